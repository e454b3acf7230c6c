use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry as MapEntry;
use tokio::time::Instant;
use tracing::debug;

use latchkey_core::capability::Persisting;
use latchkey_core::error::LockError;
use latchkey_core::key::Key;

/// Identity string this backend writes its fencing token under in a `Key`'s
/// per-store state map.
pub const IDENTITY: &str = "latchkey-semaphore";

type Holders = HashMap<String, Option<Instant>>;

fn live_holder_count(holders: &Holders) -> usize {
    holders
        .values()
        .filter(|expiry| !expiry.is_some_and(|deadline| Instant::now() >= deadline))
        .count()
}

fn evict_expired(holders: &mut Holders) {
    holders.retain(|_, expiry| !expiry.is_some_and(|deadline| Instant::now() >= deadline));
}

/// Bounded-concurrency intra-process guard: the same map-of-holders shape as
/// [`latchkey_memory::MemoryStore`], generalized to `permits > 1`
/// simultaneous holders of the same resource.
///
/// With `permits = 1` this degenerates to plain mutual exclusion (the
/// `latchkey-pg-advisory` backend reaches for `latchkey-memory` directly for
/// that case rather than configuring a one-permit semaphore, since the
/// single-holder shape is simpler to reason about there). This crate exists
/// for callers who want genuine N-way intra-process throttling through the
/// same `Lock` coordinator API — a bulkhead rather than a mutex.
#[derive(Debug)]
pub struct SemaphoreStore {
    permits: usize,
    data: DashMap<String, Holders>,
}

impl SemaphoreStore {
    /// Create a new semaphore store allowing up to `permits` concurrent
    /// holders per resource.
    ///
    /// # Panics
    ///
    /// Panics if `permits == 0`; a zero-permit semaphore can never be
    /// acquired, which is almost certainly a misconfiguration rather than
    /// an intentional "always locked" resource.
    #[must_use]
    pub fn new(permits: usize) -> Self {
        assert!(permits > 0, "semaphore permits must be at least 1");
        Self {
            permits,
            data: DashMap::new(),
        }
    }

    /// The configured permit count.
    #[must_use]
    pub fn permits(&self) -> usize {
        self.permits
    }
}

#[async_trait]
impl Persisting for SemaphoreStore {
    fn identity(&self) -> &'static str {
        IDENTITY
    }

    async fn save(&self, key: &mut Key) -> Result<(), LockError> {
        let resource = key.resource().to_owned();
        let token = key.state_mut(IDENTITY).token_or_init().to_owned();

        let mut entry = self.data.entry(resource.clone()).or_default();
        evict_expired(&mut entry);

        if entry.contains_key(&token) {
            // Idempotent re-acquire by the same holder.
            return Ok(());
        }

        if live_holder_count(&entry) >= self.permits {
            return Err(LockError::LockConflicted(format!(
                "resource {resource} has no free permits ({}/{} held)",
                live_holder_count(&entry),
                self.permits
            )));
        }

        entry.insert(token, None);
        debug!(resource, permits = self.permits, "semaphore: permit acquired");
        Ok(())
    }

    async fn put_off_expiration(&self, key: &mut Key, ttl: Duration) -> Result<(), LockError> {
        let resource = key.resource().to_owned();
        let token = key.state_mut(IDENTITY).token_or_init().to_owned();

        let Some(mut entry) = self.data.get_mut(&resource) else {
            return Err(LockError::LockConflicted(format!(
                "resource {resource} is not held"
            )));
        };
        evict_expired(&mut entry);

        let Some(holder_expiry) = entry.get_mut(&token) else {
            return Err(LockError::LockConflicted(format!(
                "resource {resource} is not held by this token"
            )));
        };

        *holder_expiry = Some(Instant::now() + ttl);
        Ok(())
    }

    async fn delete(&self, key: &mut Key) -> Result<(), LockError> {
        let resource = key.resource().to_owned();
        let token = key.state_mut(IDENTITY).token_or_init().to_owned();

        let MapEntry::Occupied(mut occupied) = self.data.entry(resource) else {
            return Ok(());
        };

        occupied.get_mut().remove(&token);
        if occupied.get().is_empty() {
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

        Ok(match entry.get(&token) {
            Some(expiry) => !expiry.is_some_and(|deadline| Instant::now() >= deadline),
            None => false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn conformance() {
        let store = SemaphoreStore::new(1);
        latchkey_core::testing::run_lock_conformance_tests(&store)
            .await
            .expect("conformance tests should pass");
    }

    #[tokio::test]
    async fn n_permits_allow_n_concurrent_holders() {
        let store = SemaphoreStore::new(3);
        let resource = "pool/worker";

        let mut keys: Vec<Key> = (0..3).map(|_| Key::new(resource)).collect();
        for key in &mut keys {
            store.save(key).await.expect("should have a free permit");
        }

        let mut fourth = Key::new(resource);
        let result = store.save(&mut fourth).await;
        assert!(
            matches!(result, Err(LockError::LockConflicted(_))),
            "the fourth acquire must fail once all 3 permits are held"
        );

        store.delete(&mut keys[0]).await.unwrap();
        store
            .save(&mut fourth)
            .await
            .expect("releasing one permit should admit the next waiter");
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_expiry_frees_a_permit() {
        let store = SemaphoreStore::new(1);
        latchkey_core::testing::run_ttl_expiry_conformance_test(
            &store,
            Duration::from_secs(1),
            Duration::from_millis(250),
        )
        .await
        .expect("ttl expiry test should pass");
    }
}
