/// Configuration for the MongoDB lock backend.
///
/// Parses a `mongodb://` DSN the way `RedisConfig` parses `redis://`; the
/// coordinator never sees this struct.
#[derive(Debug, Clone)]
pub struct MongoConfig {
    /// Connection URI, e.g. `mongodb://127.0.0.1:27017`.
    pub uri: String,
    /// Database holding the locks collection.
    pub database: String,
    /// Collection name locks are stored in, one document per resource.
    pub collection: String,
    /// Probability, in `[0, 1]`, that a given `save` also attempts to
    /// (idempotently) create the TTL index on `expires_at`. Kept
    /// probabilistic rather than once-per-startup so a non-admin caller
    /// lazily installs the index without every `save` paying the round
    /// trip. Default `0.001` matches the reference backend.
    pub gc_probability: f64,
}

impl Default for MongoConfig {
    fn default() -> Self {
        Self {
            uri: String::from("mongodb://127.0.0.1:27017"),
            database: String::from("latchkey"),
            collection: String::from("locks"),
            gc_probability: 0.001,
        }
    }
}

impl MongoConfig {
    /// Create a config pointed at `uri`, leaving everything else default.
    ///
    /// # Errors
    ///
    /// Returns [`latchkey_core::error::LockError::InvalidArgument`] if
    /// `gc_probability` built via [`MongoConfig::with_gc_probability`] is
    /// ever outside `[0, 1]`; `new` itself cannot fail.
    #[must_use]
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            ..Self::default()
        }
    }

    /// Validate the configuration, surfacing the spec's `gcProbability`
    /// range check and non-empty database/collection requirement.
    ///
    /// # Errors
    ///
    /// Returns [`latchkey_core::error::LockError::InvalidArgument`] if
    /// `gc_probability` is outside `[0, 1]`, or `database`/`collection` is
    /// empty.
    pub fn validate(&self) -> Result<(), latchkey_core::error::LockError> {
        if !(0.0..=1.0).contains(&self.gc_probability) {
            return Err(latchkey_core::error::LockError::InvalidArgument(format!(
                "gc_probability must be in [0, 1], got {}",
                self.gc_probability
            )));
        }
        if self.database.is_empty() || self.collection.is_empty() {
            return Err(latchkey_core::error::LockError::InvalidArgument(
                "database and collection must not be empty".to_owned(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let cfg = MongoConfig::default();
        assert_eq!(cfg.database, "latchkey");
        assert_eq!(cfg.collection, "locks");
        assert!((cfg.gc_probability - 0.001).abs() < f64::EPSILON);
    }

    #[test]
    fn rejects_gc_probability_out_of_range() {
        let cfg = MongoConfig {
            gc_probability: 1.5,
            ..MongoConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_empty_database_or_collection() {
        let cfg = MongoConfig {
            database: String::new(),
            ..MongoConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn accepts_boundary_probabilities() {
        for p in [0.0, 1.0] {
            let cfg = MongoConfig {
                gc_probability: p,
                ..MongoConfig::default()
            };
            assert!(cfg.validate().is_ok());
        }
    }
}
