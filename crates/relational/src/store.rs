use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::debug;

use latchkey_core::capability::Persisting;
use latchkey_core::error::LockError;
use latchkey_core::key::Key;

use crate::config::RelationalConfig;
use crate::migrations;

/// Identity string this backend writes its fencing token under in a `Key`'s
/// per-store state map.
pub const IDENTITY: &str = "latchkey-relational";

fn expires_at(ttl: Duration) -> chrono::DateTime<chrono::Utc> {
    chrono::Utc::now() + ttl
}

/// Generic relational-table [`Persisting`] lock backend.
///
/// One row per resource in a `{prefix}locks(name PRIMARY KEY, owner,
/// expires_at)` table. `save` sweeps stale rows for this name, then
/// performs `INSERT ... ON CONFLICT (name) DO UPDATE ... WHERE
/// {table}.owner = EXCLUDED.owner` — the `WHERE` clause is what makes the
/// upsert idempotent for the same holder while still leaving a genuinely
/// different holder's row untouched (`rows_affected() == 0`, translated to
/// [`LockError::LockConflicted`]).
pub struct RelationalStore {
    pool: PgPool,
    config: RelationalConfig,
}

impl RelationalStore {
    /// Create a new `RelationalStore`, connecting and running migrations.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::InvalidArgument`] if the pool cannot be built,
    /// or [`LockError::LockStorage`] if migrations fail.
    pub async fn new(config: RelationalConfig) -> Result<Self, LockError> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(config.pool_size)
            .connect(&config.url)
            .await
            .map_err(|e| LockError::InvalidArgument(e.to_string()))?;

        migrations::run_migrations(&pool, &config)
            .await
            .map_err(LockError::storage)?;

        Ok(Self { pool, config })
    }

    /// Create a `RelationalStore` from an existing pool, e.g. one shared
    /// with an application's own data access layer. Runs migrations.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::LockStorage`] if migrations fail.
    pub async fn from_pool(pool: PgPool, config: RelationalConfig) -> Result<Self, LockError> {
        migrations::run_migrations(&pool, &config)
            .await
            .map_err(LockError::storage)?;
        Ok(Self { pool, config })
    }
}

#[async_trait]
impl Persisting for RelationalStore {
    fn identity(&self) -> &'static str {
        IDENTITY
    }

    async fn save(&self, key: &mut Key) -> Result<(), LockError> {
        let resource = key.resource().to_owned();
        let token = key.state_mut(IDENTITY).token_or_init().to_owned();
        let table = self.config.locks_table();
        let expiry = expires_at(self.config.default_ttl);

        let reap = format!("DELETE FROM {table} WHERE name = $1 AND expires_at <= NOW()");
        sqlx::query(&reap)
            .bind(&resource)
            .execute(&self.pool)
            .await
            .map_err(LockError::storage)?;

        let upsert = format!(
            "INSERT INTO {table} (name, owner, expires_at) VALUES ($1, $2, $3) \
             ON CONFLICT (name) DO UPDATE SET owner = EXCLUDED.owner, expires_at = EXCLUDED.expires_at \
             WHERE {table}.owner = EXCLUDED.owner"
        );
        let result = sqlx::query(&upsert)
            .bind(&resource)
            .bind(&token)
            .bind(expiry)
            .execute(&self.pool)
            .await
            .map_err(LockError::storage)?;

        if result.rows_affected() > 0 {
            debug!(resource, "relational: exclusive save acquired");
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
        let table = self.config.locks_table();
        let expiry = expires_at(ttl);

        let update = format!(
            "UPDATE {table} SET expires_at = $1 WHERE name = $2 AND owner = $3 AND expires_at > NOW()"
        );
        let result = sqlx::query(&update)
            .bind(expiry)
            .bind(&resource)
            .bind(&token)
            .execute(&self.pool)
            .await
            .map_err(LockError::storage)?;

        if result.rows_affected() > 0 {
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
        let table = self.config.locks_table();

        let delete = format!("DELETE FROM {table} WHERE name = $1 AND owner = $2");
        sqlx::query(&delete)
            .bind(&resource)
            .bind(&token)
            .execute(&self.pool)
            .await
            .map_err(LockError::storage)?;
        Ok(())
    }

    async fn exists(&self, key: &Key) -> Result<bool, LockError> {
        let resource = key.resource();
        let Some(token) = key.state(IDENTITY).and_then(|s| s.token.clone()) else {
            return Ok(false);
        };
        let table = self.config.locks_table();

        let select = format!(
            "SELECT 1 FROM {table} WHERE name = $1 AND owner = $2 AND expires_at > NOW()"
        );
        let row: Option<(i32,)> = sqlx::query_as(&select)
            .bind(resource)
            .bind(&token)
            .fetch_optional(&self.pool)
            .await
            .map_err(LockError::storage)?;
        Ok(row.is_some())
    }
}

#[cfg(all(test, feature = "integration"))]
mod integration_tests {
    use super::*;

    fn test_config() -> RelationalConfig {
        RelationalConfig {
            url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgres://localhost:5432/latchkey_test".to_owned()),
            table_prefix: format!("test_{}_", latchkey_core::generate_fencing_token().replace(['+', '/', '='], "")),
            ..RelationalConfig::default()
        }
    }

    #[tokio::test]
    async fn conformance() {
        let store = RelationalStore::new(test_config())
            .await
            .expect("pool creation should succeed");
        latchkey_core::testing::run_lock_conformance_tests(&store)
            .await
            .expect("conformance tests should pass");
    }

    #[tokio::test]
    async fn ttl_expiry() {
        let store = RelationalStore::new(test_config())
            .await
            .expect("pool creation should succeed");
        latchkey_core::testing::run_ttl_expiry_conformance_test(
            &store,
            Duration::from_secs(1),
            Duration::from_millis(500),
        )
        .await
        .expect("ttl expiry test should pass");
    }
}
