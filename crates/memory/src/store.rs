use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry as MapEntry;
use tokio::time::Instant;
use tracing::debug;

use latchkey_core::capability::{Persisting, Shared};
use latchkey_core::error::LockError;
use latchkey_core::key::Key;

/// Identity string this backend writes its fencing token under in a `Key`'s
/// per-store state map.
pub const IDENTITY: &str = "latchkey-memory";

/// A single resource's hold state: at most one writer, any number of
/// concurrent readers, and one shared expiration (the spec's in-memory
/// backend does not track per-reader deadlines separately).
#[derive(Debug, Clone)]
struct Entry {
    writer: Option<String>,
    readers: HashSet<String>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|deadline| Instant::now() >= deadline)
    }

    fn is_empty_or_expired(&self) -> bool {
        self.is_expired() || (self.writer.is_none() && self.readers.is_empty())
    }
}

fn expiry_from_ttl(ttl: Option<Duration>) -> Option<Instant> {
    ttl.map(|d| Instant::now() + d)
}

/// In-memory [`Persisting`] + [`Shared`] store backed by a [`DashMap`].
///
/// Used standalone (the plain in-process backend) and, with `permits = 1`,
/// as the intra-process guard `latchkey-pg-advisory` layers in front of the
/// database's advisory lock to serialize same-connection contenders.
///
/// Expiry is checked lazily on access; there is no background reaper. All
/// operations are synchronous internally (a single `DashMap` shard lock) —
/// the `async` signatures exist purely to satisfy the shared trait.
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: DashMap<String, Entry>,
}

impl MemoryStore {
    /// Create a new, empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn evict_if_expired(&self, resource: &str) {
        self.data.remove_if(resource, |_, entry| entry.is_expired());
    }
}

#[async_trait]
impl Persisting for MemoryStore {
    fn identity(&self) -> &'static str {
        IDENTITY
    }

    async fn save(&self, key: &mut Key) -> Result<(), LockError> {
        let resource = key.resource().to_owned();
        let token = key.state_mut(IDENTITY).token_or_init().to_owned();

        self.evict_if_expired(&resource);

        match self.data.entry(resource.clone()) {
            MapEntry::Vacant(vacant) => {
                vacant.insert(Entry {
                    writer: Some(token),
                    readers: HashSet::new(),
                    expires_at: None,
                });
                debug!(resource, "memory: exclusive save acquired fresh entry");
                Ok(())
            }
            MapEntry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if entry.is_empty_or_expired() {
                    entry.writer = Some(token);
                    entry.readers.clear();
                    entry.expires_at = None;
                    return Ok(());
                }
                if entry.writer.as_deref() == Some(token.as_str()) && entry.readers.is_empty() {
                    // Idempotent re-save by the same holder.
                    return Ok(());
                }
                Err(LockError::LockConflicted(format!(
                    "resource {resource} is already held"
                )))
            }
        }
    }

    async fn put_off_expiration(&self, key: &mut Key, ttl: Duration) -> Result<(), LockError> {
        let resource = key.resource().to_owned();
        let token = key.state_mut(IDENTITY).token_or_init().to_owned();

        self.evict_if_expired(&resource);

        let Some(mut entry) = self.data.get_mut(&resource) else {
            return Err(LockError::LockConflicted(format!(
                "resource {resource} is not held"
            )));
        };

        let is_holder = entry.writer.as_deref() == Some(token.as_str())
            || entry.readers.contains(&token);
        if !is_holder {
            return Err(LockError::LockConflicted(format!(
                "resource {resource} is held by a different token"
            )));
        }

        entry.expires_at = expiry_from_ttl(Some(ttl));
        Ok(())
    }

    async fn delete(&self, key: &mut Key) -> Result<(), LockError> {
        let resource = key.resource().to_owned();
        let token = key.state_mut(IDENTITY).token_or_init().to_owned();

        let MapEntry::Occupied(mut occupied) = self.data.entry(resource.clone()) else {
            return Ok(());
        };

        let entry = occupied.get_mut();
        if entry.writer.as_deref() == Some(token.as_str()) {
            entry.writer = None;
        } else {
            entry.readers.remove(&token);
        }

        if entry.writer.is_none() && entry.readers.is_empty() {
            occupied.remove();
        }

        Ok(())
    }

    async fn exists(&self, key: &Key) -> Result<bool, LockError> {
        let resource = key.resource();
        let Some(token) = key.state(IDENTITY).and_then(|s| s.token.clone()) else {
            return Ok(false);
        };

        let Some(entry) = self.data.get(resource) else {
            return Ok(false);
        };

        if entry.is_expired() {
            return Ok(false);
        }

        Ok(entry.writer.as_deref() == Some(token.as_str()) || entry.readers.contains(&token))
    }

    fn as_shared(&self) -> Option<&dyn Shared> {
        Some(self)
    }
}

#[async_trait]
impl Shared for MemoryStore {
    async fn save_read(&self, key: &mut Key) -> Result<(), LockError> {
        let resource = key.resource().to_owned();
        let token = key.state_mut(IDENTITY).token_or_init().to_owned();

        self.evict_if_expired(&resource);

        let mut entry = self.data.entry(resource.clone()).or_insert_with(|| Entry {
            writer: None,
            readers: HashSet::new(),
            expires_at: None,
        });

        if entry.is_expired() {
            entry.writer = None;
            entry.readers.clear();
            entry.expires_at = None;
        }

        if let Some(writer) = &entry.writer {
            if writer != &token {
                return Err(LockError::LockConflicted(format!(
                    "resource {resource} is exclusively held"
                )));
            }
        }

        entry.readers.insert(token);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn conformance() {
        let store = MemoryStore::new();
        latchkey_core::testing::run_lock_conformance_tests(&store)
            .await
            .expect("conformance tests should pass");
    }

    #[tokio::test]
    async fn shared_conformance() {
        let store = MemoryStore::new();
        latchkey_core::testing::run_shared_conformance_tests(&store)
            .await
            .expect("shared conformance tests should pass");
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_expiry() {
        let store = MemoryStore::new();
        latchkey_core::testing::run_ttl_expiry_conformance_test(
            &store,
            Duration::from_secs(2),
            Duration::from_millis(500),
        )
        .await
        .expect("ttl expiry test should pass");
    }

    #[tokio::test]
    async fn refresh_extends_deadline_past_original() {
        let store = MemoryStore::new();
        let mut key = Key::new("refresh-target");

        store.save(&mut key).await.unwrap();
        store
            .put_off_expiration(&mut key, Duration::from_millis(50))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        store
            .put_off_expiration(&mut key, Duration::from_secs(5))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(
            store.exists(&key).await.unwrap(),
            "refreshed TTL should outlive the original deadline"
        );
    }
}
