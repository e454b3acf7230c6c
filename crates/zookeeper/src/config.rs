/// Configuration for the ZooKeeper store backend.
#[derive(Debug, Clone)]
pub struct ZkConfig {
    /// Comma-separated `host:port` cluster connect string, e.g.
    /// `zoo1:2181,zoo2:2181,zoo3:2181`.
    pub connect_string: String,
    /// Session timeout negotiated with the ensemble. A shorter timeout makes
    /// a crashed holder's ephemeral nodes disappear sooner, at the cost of
    /// more aggressive heartbeating.
    pub session_timeout: std::time::Duration,
    /// Root znode all lock nodes are created under. Created (recursively, as
    /// persistent nodes) on first use if missing.
    pub root: String,
}

impl Default for ZkConfig {
    fn default() -> Self {
        Self {
            connect_string: String::from("127.0.0.1:2181"),
            session_timeout: std::time::Duration::from_secs(10),
            root: String::from("/latchkey"),
        }
    }
}

impl ZkConfig {
    /// Create a config pointed at `connect_string`, with other fields at
    /// their defaults.
    #[must_use]
    pub fn new(connect_string: impl Into<String>) -> Self {
        Self {
            connect_string: connect_string.into(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let cfg = ZkConfig::default();
        assert_eq!(cfg.connect_string, "127.0.0.1:2181");
        assert_eq!(cfg.root, "/latchkey");
    }

    #[test]
    fn new_overrides_connect_string_only() {
        let cfg = ZkConfig::new("zoo1:2181,zoo2:2181");
        assert_eq!(cfg.connect_string, "zoo1:2181,zoo2:2181");
        assert_eq!(cfg.root, "/latchkey");
    }
}
