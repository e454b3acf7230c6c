use std::path::PathBuf;

/// Configuration for the OS advisory file-lock backend.
#[derive(Debug, Clone)]
pub struct FileConfig {
    /// Directory lock files are created under. Created (including parents)
    /// on first use if missing.
    pub root: PathBuf,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/tmp/latchkey-locks"),
        }
    }
}

impl FileConfig {
    /// Create a config rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_root_is_tmp() {
        let cfg = FileConfig::default();
        assert_eq!(cfg.root, PathBuf::from("/tmp/latchkey-locks"));
    }

    #[test]
    fn new_sets_root() {
        let cfg = FileConfig::new("/var/run/latchkey");
        assert_eq!(cfg.root, PathBuf::from("/var/run/latchkey"));
    }
}
