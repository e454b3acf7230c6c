use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use deadpool_redis::{Config as PoolConfig, Pool, Runtime};
use redis::{AsyncCommands, Script};
use tracing::debug;

use latchkey_core::capability::{Persisting, Shared};
use latchkey_core::error::LockError;
use latchkey_core::key::Key;

use crate::config::RedisConfig;
use crate::scripts;

/// Identity string this backend writes its fencing token under in a `Key`'s
/// per-store state map.
pub const IDENTITY: &str = "latchkey-redis";

fn now_epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the Unix epoch")
        .as_millis() as i64
}

fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

/// Redis-family (single-node) [`Persisting`] + [`Shared`] lock backend.
///
/// `save` is `SET key token NX PX ttl`; `put_off_expiration` is a
/// compare-and-set Lua script; `delete` is the symmetric compare-and-delete
/// Lua script. Read-locks are a sorted set of tokens scored by per-member
/// expiry, all guarded by Lua so the read-then-write sequences in
/// [`crate::scripts`] execute atomically against concurrent contenders.
///
/// Consistency is only as strong as the underlying deployment: a single
/// Redis instance gives full mutual exclusion, while Sentinel/Cluster
/// failover can lose a lock mid-hold. For strong consistency across
/// failover, prefer `latchkey-pg-advisory` or `latchkey-mongodb`.
pub struct RedisStore {
    pool: Pool,
    config: RedisConfig,
}

impl RedisStore {
    /// Create a new `RedisStore` from the provided configuration.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::InvalidArgument`] if the pool cannot be built
    /// (malformed URL, invalid pool parameters).
    pub fn new(config: RedisConfig) -> Result<Self, LockError> {
        let pool = PoolConfig::from_url(&config.url)
            .builder()
            .map_err(|e| LockError::InvalidArgument(e.to_string()))?
            .max_size(config.pool_size)
            .wait_timeout(Some(config.connection_timeout))
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| LockError::InvalidArgument(e.to_string()))?;

        Ok(Self { pool, config })
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection, LockError> {
        self.pool.get().await.map_err(LockError::storage)
    }
}

#[async_trait]
impl Persisting for RedisStore {
    fn identity(&self) -> &'static str {
        IDENTITY
    }

    async fn save(&self, key: &mut Key) -> Result<(), LockError> {
        let resource = key.resource().to_owned();
        let token = key.state_mut(IDENTITY).token_or_init().to_owned();
        let writer_key = self.config.writer_key(&resource);
        let readers_key = self.config.readers_key(&resource);

        let mut conn = self.conn().await?;
        let acquired: i64 = Script::new(scripts::SAVE_EXCLUSIVE)
            .key(&writer_key)
            .key(&readers_key)
            .arg(&token)
            .arg(duration_ms(self.config.default_ttl))
            .arg(now_epoch_ms())
            .invoke_async(&mut conn)
            .await
            .map_err(LockError::storage)?;

        if acquired == 1 {
            debug!(resource, "redis: exclusive save acquired");
            Ok(())
        } else {
            Err(LockError::LockConflicted(format!(
                "resource {resource} is already held"
            )))
        }
    }

    async fn put_off_expiration(&self, key: &mut Key, ttl: Duration) -> Result<(), LockError> {
        let resource = key.resource().to_owned();
        let token = key.state_mut(IDENTITY).token_or_init().to_owned();
        let writer_key = self.config.writer_key(&resource);
        let readers_key = self.config.readers_key(&resource);

        let mut conn = self.conn().await?;
        let extended: i64 = Script::new(scripts::PUT_OFF_EXPIRATION)
            .key(&writer_key)
            .key(&readers_key)
            .arg(&token)
            .arg(duration_ms(ttl))
            .arg(now_epoch_ms() + duration_ms(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(LockError::storage)?;

        if extended == 1 {
            Ok(())
        } else {
            Err(LockError::LockConflicted(format!(
                "resource {resource} holder has changed"
            )))
        }
    }

    async fn delete(&self, key: &mut Key) -> Result<(), LockError> {
        let resource = key.resource().to_owned();
        let token = key.state_mut(IDENTITY).token_or_init().to_owned();
        let writer_key = self.config.writer_key(&resource);
        let readers_key = self.config.readers_key(&resource);

        let mut conn = self.conn().await?;
        let _: i64 = Script::new(scripts::DELETE)
            .key(&writer_key)
            .key(&readers_key)
            .arg(&token)
            .invoke_async(&mut conn)
            .await
            .map_err(LockError::storage)?;

        Ok(())
    }

    async fn exists(&self, key: &Key) -> Result<bool, LockError> {
        let resource = key.resource();
        let Some(token) = key.state(IDENTITY).and_then(|s| s.token.clone()) else {
            return Ok(false);
        };
        let writer_key = self.config.writer_key(resource);
        let readers_key = self.config.readers_key(resource);

        let mut conn = self.conn().await?;
        let writer: Option<String> = conn.get(&writer_key).await.map_err(LockError::storage)?;
        if writer.as_deref() == Some(token.as_str()) {
            return Ok(true);
        }

        let score: Option<f64> = conn
            .zscore(&readers_key, &token)
            .await
            .map_err(LockError::storage)?;
        Ok(score.is_some_and(|s| s >= now_epoch_ms() as f64))
    }

    fn as_shared(&self) -> Option<&dyn Shared> {
        Some(self)
    }
}

#[async_trait]
impl Shared for RedisStore {
    async fn save_read(&self, key: &mut Key) -> Result<(), LockError> {
        let resource = key.resource().to_owned();
        let token = key.state_mut(IDENTITY).token_or_init().to_owned();
        let writer_key = self.config.writer_key(&resource);
        let readers_key = self.config.readers_key(&resource);
        let expiry = now_epoch_ms() + duration_ms(self.config.default_ttl);

        let mut conn = self.conn().await?;
        let acquired: i64 = Script::new(scripts::SAVE_SHARED)
            .key(&writer_key)
            .key(&readers_key)
            .arg(&token)
            .arg(expiry)
            .arg(now_epoch_ms())
            .invoke_async(&mut conn)
            .await
            .map_err(LockError::storage)?;

        if acquired == 1 {
            debug!(resource, "redis: shared save acquired");
            Ok(())
        } else {
            Err(LockError::LockConflicted(format!(
                "resource {resource} is exclusively held"
            )))
        }
    }
}

#[cfg(all(test, feature = "integration"))]
mod integration_tests {
    use super::*;

    fn test_config() -> RedisConfig {
        RedisConfig {
            url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_owned()),
            prefix: format!("latchkey-test-{}", latchkey_core::generate_fencing_token()),
            ..RedisConfig::default()
        }
    }

    #[tokio::test]
    async fn conformance() {
        let store = RedisStore::new(test_config()).expect("pool creation should succeed");
        latchkey_core::testing::run_lock_conformance_tests(&store)
            .await
            .expect("conformance tests should pass");
    }

    #[tokio::test]
    async fn shared_conformance() {
        let store = RedisStore::new(test_config()).expect("pool creation should succeed");
        latchkey_core::testing::run_shared_conformance_tests(&store)
            .await
            .expect("shared conformance tests should pass");
    }

    #[tokio::test]
    async fn ttl_expiry() {
        let store = RedisStore::new(test_config()).expect("pool creation should succeed");
        latchkey_core::testing::run_ttl_expiry_conformance_test(
            &store,
            Duration::from_secs(1),
            Duration::from_millis(500),
        )
        .await
        .expect("ttl expiry test should pass");
    }
}
