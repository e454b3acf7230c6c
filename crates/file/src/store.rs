use std::io::ErrorKind;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use fs4::tokio::AsyncFileExt;
use rand::Rng;
use sha1::{Digest, Sha1};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::debug;

use latchkey_core::capability::{BlockingExclusive, Persisting};
use latchkey_core::error::LockError;
use latchkey_core::key::Key;

use crate::config::FileConfig;

/// Identity string this backend writes its fencing token under in a `Key`'s
/// per-store state map.
pub const IDENTITY: &str = "latchkey-file";

/// An open, locked file descriptor plus the token that currently owns it.
/// Keeping the `File` alive for the duration of the hold is what keeps the
/// OS advisory lock held — closing it releases the lock regardless of
/// whether `delete` was ever called (crash-safety for free).
struct HeldFile {
    file: File,
    token: String,
}

/// OS advisory file-lock [`Persisting`] backend.
///
/// One regular file per resource under [`FileConfig::root`]. Exclusivity is
/// enforced by an `flock`-family advisory lock (via `fs4`) held on an open
/// file descriptor for the lifetime of the hold; the file's contents carry
/// the holder's fencing token so a second opener can distinguish "still
/// held" from "file exists but whatever created it is long gone and never
/// cleaned up" (bare `create_new` existence cannot make that distinction).
///
/// `flock` has no TTL concept, so [`FileStore::put_off_expiration`] only
/// confirms this process still holds the descriptor; like the ZooKeeper
/// backend, enforcement of any deadline is left entirely to the `Key`'s
/// local clock. Unlike ZooKeeper, `Key`s acquired here remain serializable —
/// nothing here is tied to a non-transferable session identity — but a
/// *held* lock's file descriptor is process-local regardless, so a `Key`
/// handed to another process must re-open and re-acquire.
///
/// A resource name is never used as a raw path component: it is hashed with
/// a sanitized prefix into a single flat filename, which rules out path
/// traversal (`../../etc/passwd`) or accidental subdirectory creation from
/// attacker-influenced resource identifiers.
///
/// There is no read-lock recipe here (`flock(LOCK_SH)` would work for
/// readers-vs-writer but this backend does not expose it), so `FileStore`
/// implements only [`Persisting`] and [`BlockingExclusive`] — native
/// blocking is exactly what `flock_exclusive` gives for free.
pub struct FileStore {
    config: FileConfig,
    held: DashMap<String, HeldFile>,
}

impl FileStore {
    /// Build a store rooted at `config.root`. The root directory is created
    /// lazily on first `save`/`wait_and_save`, not here.
    #[must_use]
    pub fn new(config: FileConfig) -> Self {
        Self {
            config,
            held: DashMap::new(),
        }
    }

    fn path_for(&self, resource: &str) -> PathBuf {
        let mut hasher = Sha1::new();
        hasher.update(resource.as_bytes());
        let digest = hasher.finalize();
        let sanitized: String = resource
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.config.root.join(format!("{sanitized}-{}.lock", hex_encode(&digest)))
    }

    async fn ensure_root(&self) -> Result<(), LockError> {
        fs::create_dir_all(&self.config.root).await.map_err(LockError::storage)
    }

    async fn open_for_lock(&self, path: &PathBuf) -> Result<File, LockError> {
        OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)
            .await
            .map_err(LockError::storage)
    }

    async fn write_token(file: &mut File, token: &str) -> Result<(), LockError> {
        file.set_len(0).await.map_err(LockError::storage)?;
        file.seek(std::io::SeekFrom::Start(0)).await.map_err(LockError::storage)?;
        file.write_all(token.as_bytes()).await.map_err(LockError::storage)?;
        file.flush().await.map_err(LockError::storage)?;
        Ok(())
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// Base polling interval (100ms) with +/-10% jitter, used only to wait for
/// this *process's own* other handle to release a resource before we even
/// attempt to open a second file description against it (see the module
/// doc comment on why same-process contention is tracked in `held` rather
/// than left entirely to `flock`).
fn jittered_poll_interval() -> Duration {
    let base = Duration::from_millis(100);
    let jitter_pct = rand::thread_rng().gen_range(-10..=10);
    let delta = base.as_millis() as i64 * jitter_pct / 100;
    Duration::from_millis((base.as_millis() as i64 + delta).max(1) as u64)
}

#[async_trait]
impl Persisting for FileStore {
    fn identity(&self) -> &'static str {
        IDENTITY
    }

    async fn save(&self, key: &mut Key) -> Result<(), LockError> {
        let resource = key.resource().to_owned();
        let token = key.state_mut(IDENTITY).token_or_init().to_owned();

        if let Some(existing) = self.held.get(&resource) {
            return if existing.token == token {
                Ok(())
            } else {
                Err(LockError::LockConflicted(format!(
                    "resource {resource} is already held"
                )))
            };
        }

        self.ensure_root().await?;
        let path = self.path_for(&resource);
        let mut file = self.open_for_lock(&path).await?;

        match AsyncFileExt::try_lock_exclusive(&file) {
            Ok(()) => {
                Self::write_token(&mut file, &token).await?;
                self.held.insert(resource.clone(), HeldFile { file, token });
                debug!(resource, "file: acquired exclusive advisory lock");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => Err(LockError::LockConflicted(format!(
                "resource {resource} is already held by another process"
            ))),
            Err(e) => Err(LockError::acquiring(e)),
        }
    }

    async fn put_off_expiration(&self, key: &mut Key, _ttl: Duration) -> Result<(), LockError> {
        let resource = key.resource().to_owned();
        let token = key.state_mut(IDENTITY).token_or_init().to_owned();

        match self.held.get(&resource) {
            Some(entry) if entry.token == token => Ok(()),
            _ => Err(LockError::LockConflicted(format!(
                "resource {resource} is not held by this process"
            ))),
        }
    }

    async fn delete(&self, key: &mut Key) -> Result<(), LockError> {
        let resource = key.resource().to_owned();
        let token = key.state_mut(IDENTITY).token_or_init().to_owned();

        let owned = self.held.get(&resource).is_some_and(|e| e.token == token);
        if !owned {
            return Ok(());
        }
        self.held.remove(&resource);
        let _ = fs::remove_file(self.path_for(&resource)).await;
        Ok(())
    }

    async fn exists(&self, key: &Key) -> Result<bool, LockError> {
        let Some(token) = key.state(IDENTITY).and_then(|s| s.token.clone()) else {
            return Ok(false);
        };
        Ok(self
            .held
            .get(key.resource())
            .is_some_and(|entry| entry.token == token))
    }

    fn as_blocking_exclusive(&self) -> Option<&dyn BlockingExclusive> {
        Some(self)
    }
}

#[async_trait]
impl BlockingExclusive for FileStore {
    async fn wait_and_save(&self, key: &mut Key) -> Result<(), LockError> {
        let resource = key.resource().to_owned();
        let token = key.state_mut(IDENTITY).token_or_init().to_owned();

        // A second file description opened by this same process against a
        // path it already holds would itself block forever on `flock`, so
        // same-process contention is resolved against `held` before ever
        // opening the file a second time.
        loop {
            match self.held.get(&resource) {
                Some(entry) if entry.token == token => return Ok(()),
                Some(_) => tokio::time::sleep(jittered_poll_interval()).await,
                None => break,
            }
        }

        self.ensure_root().await?;
        let path = self.path_for(&resource);
        let mut file = self.open_for_lock(&path).await?;

        AsyncFileExt::lock_exclusive(&file)
            .await
            .map_err(LockError::acquiring)?;
        Self::write_token(&mut file, &token).await?;
        self.held.insert(resource.clone(), HeldFile { file, token });
        debug!(resource, "file: blocking exclusive lock granted");
        Ok(())
    }
}

#[cfg(test)]
mod path_tests {
    use super::*;

    #[test]
    fn path_has_no_raw_path_separators_from_resource() {
        let store = FileStore::new(FileConfig::new("/tmp/latchkey-test"));
        let path = store.path_for("../../etc/passwd");
        assert!(!path.to_string_lossy().contains(".."));
        assert_eq!(path.parent(), Some(store.config.root.as_path()));
    }

    #[test]
    fn distinct_resources_produce_distinct_paths() {
        let store = FileStore::new(FileConfig::new("/tmp/latchkey-test"));
        assert_ne!(store.path_for("a/b"), store.path_for("a-b"));
    }
}

#[cfg(all(test, feature = "integration"))]
mod integration_tests {
    use super::*;

    fn test_config() -> FileConfig {
        let dir = tempfile::tempdir().expect("tempdir").into_path();
        FileConfig::new(dir)
    }

    #[tokio::test]
    async fn conformance() {
        let store = FileStore::new(test_config());
        latchkey_core::testing::run_lock_conformance_tests(&store)
            .await
            .expect("conformance tests should pass");
    }

    #[tokio::test]
    async fn blocking_exclusive_waits_for_release() {
        let store = std::sync::Arc::new(FileStore::new(test_config()));
        let resource = "blocking-target";
        let mut holder_a = Key::new(resource);

        store.save(&mut holder_a).await.unwrap();

        let waiter = store.clone();
        let wait = tokio::spawn(async move {
            let mut holder_b = Key::new("blocking-target");
            waiter.wait_and_save(&mut holder_b).await.unwrap();
            holder_b
        });

        tokio::time::sleep(Duration::from_millis(200)).await;
        store.delete(&mut holder_a).await.unwrap();

        let mut holder_b = wait.await.unwrap();
        assert!(store.exists(&holder_b).await.unwrap());
        store.delete(&mut holder_b).await.unwrap();
    }
}
