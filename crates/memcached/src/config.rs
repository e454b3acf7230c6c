use std::time::Duration;

/// Configuration for the Memcached lock backend.
///
/// Parses to a `memcache://host:port` DSN the way `RedisConfig` parses a
/// `redis://` one; the coordinator never sees this struct.
#[derive(Debug, Clone)]
pub struct MemcachedConfig {
    /// Server address, e.g. `127.0.0.1:11211`.
    pub address: String,
    /// Prefix applied to every key this backend writes, to avoid collisions
    /// with unrelated data sharing the same Memcached instance.
    pub prefix: String,
    /// TTL applied to a fresh `save` before the caller's own TTL (if any)
    /// is layered on via `refresh`.
    pub default_ttl: Duration,
    /// Grace window a key is left alive for during the extend-then-delete
    /// release trick, so a concurrent contender racing `add` never
    /// observes a key that looks entirely absent mid-delete.
    pub delete_grace: Duration,
}

impl Default for MemcachedConfig {
    fn default() -> Self {
        Self {
            address: String::from("127.0.0.1:11211"),
            prefix: String::from("latchkey"),
            default_ttl: Duration::from_secs(30),
            delete_grace: Duration::from_millis(500),
        }
    }
}

impl MemcachedConfig {
    /// Create a config pointed at `address`, leaving everything else default.
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Self::default()
        }
    }

    /// The storage key for `resource`.
    #[must_use]
    pub(crate) fn item_key(&self, resource: &str) -> String {
        format!("{}:lock:{}", self.prefix, resource)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let cfg = MemcachedConfig::default();
        assert_eq!(cfg.address, "127.0.0.1:11211");
        assert_eq!(cfg.prefix, "latchkey");
    }

    #[test]
    fn key_rendering_uses_prefix() {
        let cfg = MemcachedConfig {
            prefix: "app".into(),
            ..MemcachedConfig::default()
        };
        assert_eq!(cfg.item_key("job/42"), "app:lock:job/42");
    }
}
