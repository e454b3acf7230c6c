use std::time::Duration;

use async_memcached::Client;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use latchkey_core::capability::Persisting;
use latchkey_core::error::LockError;
use latchkey_core::key::Key;

use crate::config::MemcachedConfig;

/// Identity string this backend writes its fencing token under in a `Key`'s
/// per-store state map.
pub const IDENTITY: &str = "latchkey-memcached";

fn ttl_secs(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX).max(1)
}

/// Memcached [`Persisting`] lock backend.
///
/// `save` is `ADD key token ttl`; on `NOT_STORED` it falls through to
/// [`MemcachedStore::reacquire_or_conflict`], which reads the current
/// value+CAS and, if it belongs to this token, refreshes the TTL via `CAS`
/// instead of failing — this is what gives `save` its idempotent-for-the-
/// same-holder behavior on a backend with no native CAS-on-insert. `delete`
/// uses the "extend-then-delete" trick: `CAS` the TTL down to a short grace
/// window, then `DELETE`, so a contender racing `ADD` never observes a key
/// that is momentarily gone mid-release but still logically held.
///
/// Memcached has no read-lock primitive, so this backend does not implement
/// [`latchkey_core::capability::Shared`]; `Lock::acquire_read` silently
/// promotes to exclusive against it.
pub struct MemcachedStore {
    client: Mutex<Client>,
    config: MemcachedConfig,
}

impl MemcachedStore {
    /// Connect to the configured Memcached server.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::InvalidArgument`] if the connection cannot be
    /// established.
    pub async fn new(config: MemcachedConfig) -> Result<Self, LockError> {
        let client = Client::new(config.address.clone())
            .await
            .map_err(|e| LockError::InvalidArgument(e.to_string()))?;
        Ok(Self {
            client: Mutex::new(client),
            config,
        })
    }

    /// `save`'s fallback path when `ADD` reports the key already exists:
    /// read the current value+CAS and, if it's this token's own hold,
    /// refresh the TTL instead of conflicting.
    async fn reacquire_or_conflict(
        &self,
        item_key: &str,
        token: &str,
        resource: &str,
    ) -> Result<(), LockError> {
        let mut client = self.client.lock().await;
        let current = client.get(item_key).await.map_err(LockError::storage)?;

        match current {
            Some(value) if value.data == token.as_bytes() => {
                client
                    .cas(
                        item_key,
                        token.as_bytes(),
                        Some(ttl_secs(self.config.default_ttl)),
                        None,
                        value.cas,
                    )
                    .await
                    .map_err(LockError::storage)?;
                debug!(resource, "memcached: idempotent re-save refreshed ttl");
                Ok(())
            }
            _ => Err(LockError::LockConflicted(format!(
                "resource {resource} is already held"
            ))),
        }
    }
}

#[async_trait]
impl Persisting for MemcachedStore {
    fn identity(&self) -> &'static str {
        IDENTITY
    }

    async fn save(&self, key: &mut Key) -> Result<(), LockError> {
        let resource = key.resource().to_owned();
        let token = key.state_mut(IDENTITY).token_or_init().to_owned();
        let item_key = self.config.item_key(&resource);

        let add_result = {
            let mut client = self.client.lock().await;
            client
                .add(
                    &item_key,
                    token.as_bytes(),
                    Some(ttl_secs(self.config.default_ttl)),
                    None,
                )
                .await
        };

        match add_result {
            Ok(()) => {
                debug!(resource, "memcached: exclusive save acquired fresh item");
                Ok(())
            }
            Err(_) => self.reacquire_or_conflict(&item_key, &token, &resource).await,
        }
    }

    async fn put_off_expiration(&self, key: &mut Key, ttl: Duration) -> Result<(), LockError> {
        let resource = key.resource().to_owned();
        let token = key.state_mut(IDENTITY).token_or_init().to_owned();
        let item_key = self.config.item_key(&resource);

        let mut client = self.client.lock().await;
        let current = client.get(&item_key).await.map_err(LockError::storage)?;

        let Some(value) = current else {
            return Err(LockError::LockConflicted(format!(
                "resource {resource} is not held"
            )));
        };
        if value.data != token.as_bytes() {
            return Err(LockError::LockConflicted(format!(
                "resource {resource} is held by a different token"
            )));
        }

        client
            .cas(&item_key, token.as_bytes(), Some(ttl_secs(ttl)), None, value.cas)
            .await
            .map_err(LockError::storage)?;
        Ok(())
    }

    async fn delete(&self, key: &mut Key) -> Result<(), LockError> {
        let resource = key.resource().to_owned();
        let token = key.state_mut(IDENTITY).token_or_init().to_owned();
        let item_key = self.config.item_key(&resource);

        let mut client = self.client.lock().await;
        let current = client.get(&item_key).await.map_err(LockError::storage)?;

        let Some(value) = current else {
            return Ok(());
        };
        if value.data != token.as_bytes() {
            return Ok(());
        }

        // Extend-then-delete: shrink the TTL to a short grace window before
        // the actual delete, so a contender's concurrent ADD never lands in
        // the gap between "value still says we hold it" and "key is gone."
        let grace = ttl_secs(self.config.delete_grace);
        if client
            .cas(&item_key, token.as_bytes(), Some(grace), None, value.cas)
            .await
            .is_ok()
        {
            client.delete(&item_key).await.map_err(LockError::storage)?;
        }
        Ok(())
    }

    async fn exists(&self, key: &Key) -> Result<bool, LockError> {
        let resource = key.resource();
        let Some(token) = key.state(IDENTITY).and_then(|s| s.token.clone()) else {
            return Ok(false);
        };
        let item_key = self.config.item_key(resource);

        let mut client = self.client.lock().await;
        let current = client.get(&item_key).await.map_err(LockError::storage)?;
        Ok(current.is_some_and(|value| value.data == token.as_bytes()))
    }
}

#[cfg(all(test, feature = "integration"))]
mod integration_tests {
    use super::*;

    fn test_config() -> MemcachedConfig {
        MemcachedConfig {
            address: std::env::var("MEMCACHED_ADDR")
                .unwrap_or_else(|_| "127.0.0.1:11211".to_owned()),
            prefix: format!("latchkey-test-{}", latchkey_core::generate_fencing_token()),
            ..MemcachedConfig::default()
        }
    }

    #[tokio::test]
    async fn conformance() {
        let store = MemcachedStore::new(test_config())
            .await
            .expect("connection should succeed");
        latchkey_core::testing::run_lock_conformance_tests(&store)
            .await
            .expect("conformance tests should pass");
    }

    #[tokio::test]
    async fn ttl_expiry() {
        let store = MemcachedStore::new(test_config())
            .await
            .expect("connection should succeed");
        latchkey_core::testing::run_ttl_expiry_conformance_test(
            &store,
            Duration::from_secs(2),
            Duration::from_millis(800),
        )
        .await
        .expect("ttl expiry test should pass");
    }

    #[tokio::test]
    async fn refresh_extends_deadline_past_original() {
        let store = MemcachedStore::new(test_config())
            .await
            .expect("connection should succeed");
        let mut key = Key::new("refresh-target");

        store.save(&mut key).await.unwrap();
        store
            .put_off_expiration(&mut key, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(store.exists(&key).await.unwrap());
        store.delete(&mut key).await.unwrap();
    }
}
