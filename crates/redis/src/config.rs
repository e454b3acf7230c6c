use std::time::Duration;

/// Configuration for the Redis-family lock backend.
///
/// Parses the `redis://` DSN the spec assigns this backend; the coordinator
/// never sees this struct, matching how `RedisConfig`/`PostgresConfig` are
/// constructed independently of the generic store trait throughout this
/// workspace.
#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// Connection URL, e.g. `redis://127.0.0.1:6379`.
    pub url: String,
    /// Prefix applied to every key this backend writes, to avoid collisions
    /// with unrelated data sharing the same Redis instance.
    pub prefix: String,
    /// Maximum number of pooled connections.
    pub pool_size: usize,
    /// How long to wait for a pooled connection before giving up.
    pub connection_timeout: Duration,
    /// TTL applied to a fresh `save` before the caller's own TTL (if any)
    /// is layered on via `refresh`. Keeps an un-refreshed, TTL-less lock
    /// from living forever if a caller forgets to configure one.
    pub default_ttl: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: String::from("redis://127.0.0.1:6379"),
            prefix: String::from("latchkey"),
            pool_size: 8,
            connection_timeout: Duration::from_secs(5),
            default_ttl: Duration::from_secs(30),
        }
    }
}

impl RedisConfig {
    /// Create a config pointed at `url`, leaving everything else default.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// The writer key for `resource`.
    #[must_use]
    pub(crate) fn writer_key(&self, resource: &str) -> String {
        format!("{}:lock:{}", self.prefix, resource)
    }

    /// The sorted-set key holding live reader tokens for `resource`.
    #[must_use]
    pub(crate) fn readers_key(&self, resource: &str) -> String {
        format!("{}:lock:{}:readers", self.prefix, resource)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let cfg = RedisConfig::default();
        assert_eq!(cfg.url, "redis://127.0.0.1:6379");
        assert_eq!(cfg.prefix, "latchkey");
        assert_eq!(cfg.pool_size, 8);
    }

    #[test]
    fn key_rendering_uses_prefix() {
        let cfg = RedisConfig {
            prefix: "app".into(),
            ..RedisConfig::default()
        };
        assert_eq!(cfg.writer_key("job/42"), "app:lock:job/42");
        assert_eq!(cfg.readers_key("job/42"), "app:lock:job/42:readers");
    }
}
