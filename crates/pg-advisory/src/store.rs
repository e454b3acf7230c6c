use std::time::Duration;

use async_trait::async_trait;
use latchkey_memory::MemoryStore;
use rand::Rng;
use sqlx::postgres::PgConnection;
use sqlx::Connection as _;
use tokio::sync::Mutex;
use tracing::debug;

use latchkey_core::capability::{BlockingExclusive, BlockingShared, Persisting, Shared};
use latchkey_core::error::LockError;
use latchkey_core::key::Key;

use crate::config::PgAdvisoryConfig;

/// Identity string this backend writes its per-store state under in a
/// `Key`'s per-store state map. Carries the acquired mode (`"exclusive"` /
/// `"shared"`) in [`latchkey_core::key::StoreState::handle`]; advisory
/// locks have no fencing token of their own (ownership is the session, not
/// a value), so `token` is unused here.
pub const IDENTITY: &str = "latchkey-pg-advisory";

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const POLL_JITTER_FRACTION: f64 = 0.10;

fn jittered_poll_interval() -> Duration {
    let jitter = rand::thread_rng().gen_range(-POLL_JITTER_FRACTION..=POLL_JITTER_FRACTION);
    let millis = POLL_INTERVAL.as_millis() as f64 * (1.0 + jitter);
    Duration::from_millis(millis.max(1.0) as u64)
}

fn advisory_id(resource: &str) -> i64 {
    i64::from(crc32fast::hash(resource.as_bytes()))
}

/// PostgreSQL advisory-lock [`Persisting`] + [`Shared`] +
/// [`BlockingExclusive`] + [`BlockingShared`] backend.
///
/// Advisory locks are scoped to a database *session*, so this store owns
/// one dedicated connection for its whole lifetime rather than checking
/// connections in and out of a pool. That dedication creates a subtlety
/// `pg_try_advisory_lock` alone cannot resolve: if two distinct in-process
/// `Lock` handles both call `save` against the *same* connection for the
/// *same* resource, Postgres happily grants both (a session reacquiring
/// its own advisory lock is reference-counted, not rejected) — so a bare
/// wrapper around the SQL primitive would let two unrelated callers in the
/// same process both believe they hold the lock.
///
/// The fix is the embedded [`MemoryStore`] guard: every `save`/`save_read`
/// first goes through the guard (keyed by the caller's own fencing token,
/// generated fresh per `Key`), which serializes same-connection contenders
/// before the database is ever consulted. Only the guard's winner proceeds
/// to `pg_try_advisory_lock[_shared]`; `exists`/`delete` consult the guard
/// as the authoritative "is *this* caller the one who holds it" answer.
///
/// `delete` loops `pg_advisory_unlock[_shared]` until it returns `false`
/// (no remaining session-held lock for that `objid`/mode) rather than
/// calling it once — essential because a caller that `save`d the same
/// `Key` twice has incremented the session's reference count twice.
/// `put_off_expiration` is a no-op that just re-verifies continued
/// presence through the guard: advisory locks never expire.
pub struct PgAdvisoryStore {
    conn: Mutex<PgConnection>,
    guard: MemoryStore,
}

impl PgAdvisoryStore {
    /// Connect a dedicated session for advisory-lock use.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::InvalidArgument`] if the connection cannot be
    /// established.
    pub async fn new(config: PgAdvisoryConfig) -> Result<Self, LockError> {
        let conn = PgConnection::connect(&config.url)
            .await
            .map_err(|e| LockError::InvalidArgument(e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
            guard: MemoryStore::new(),
        })
    }

    async fn poll_guard_exclusive(&self, key: &mut Key) -> Result<(), LockError> {
        loop {
            match self.guard.save(key).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_conflicted() => tokio::time::sleep(jittered_poll_interval()).await,
                Err(e) => return Err(e),
            }
        }
    }

    async fn poll_guard_shared(&self, key: &mut Key) -> Result<(), LockError> {
        loop {
            match self.guard.save_read(key).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_conflicted() => tokio::time::sleep(jittered_poll_interval()).await,
                Err(e) => return Err(e),
            }
        }
    }

    /// Promote a currently shared hold on `key` to exclusive.
    ///
    /// Acquires the exclusive advisory lock *before* releasing the shared
    /// one — advisory locks offer no atomic upgrade primitive, so for a
    /// brief window this session holds both. That window is intentional,
    /// not a bug: see the crate's module documentation.
    ///
    /// # Errors
    ///
    /// [`LockError::LockConflicted`] if the exclusive lock is unavailable.
    pub async fn promote_to_exclusive(&self, key: &mut Key) -> Result<(), LockError> {
        let resource = key.resource().to_owned();
        let objid = advisory_id(&resource);
        let mut conn = self.conn.lock().await;

        let acquired: bool = sqlx::query_scalar::<_, bool>("SELECT pg_try_advisory_lock($1)")
            .bind(objid)
            .fetch_one(&mut *conn)
            .await
            .map_err(LockError::storage)?;
        if !acquired {
            return Err(LockError::LockConflicted(format!(
                "resource {resource} cannot be promoted: exclusive lock unavailable"
            )));
        }

        let _: bool = sqlx::query_scalar::<_, bool>("SELECT pg_advisory_unlock_shared($1)")
            .bind(objid)
            .fetch_one(&mut *conn)
            .await
            .map_err(LockError::storage)?;
        drop(conn);

        key.state_mut(IDENTITY).handle = Some("exclusive".to_owned());
        debug!(resource, "pg-advisory: promoted shared hold to exclusive");
        Ok(())
    }

    /// Demote a currently exclusive hold on `key` to shared.
    ///
    /// Same both-held window as [`PgAdvisoryStore::promote_to_exclusive`],
    /// mirrored: acquires the shared lock before releasing the exclusive
    /// one.
    ///
    /// # Errors
    ///
    /// [`LockError::LockConflicted`] if the shared lock is unavailable.
    pub async fn demote_to_shared(&self, key: &mut Key) -> Result<(), LockError> {
        let resource = key.resource().to_owned();
        let objid = advisory_id(&resource);
        let mut conn = self.conn.lock().await;

        let acquired: bool = sqlx::query_scalar::<_, bool>("SELECT pg_try_advisory_lock_shared($1)")
            .bind(objid)
            .fetch_one(&mut *conn)
            .await
            .map_err(LockError::storage)?;
        if !acquired {
            return Err(LockError::LockConflicted(format!(
                "resource {resource} cannot be demoted: shared lock unavailable"
            )));
        }

        let _: bool = sqlx::query_scalar::<_, bool>("SELECT pg_advisory_unlock($1)")
            .bind(objid)
            .fetch_one(&mut *conn)
            .await
            .map_err(LockError::storage)?;
        drop(conn);

        key.state_mut(IDENTITY).handle = Some("shared".to_owned());
        debug!(resource, "pg-advisory: demoted exclusive hold to shared");
        Ok(())
    }
}

#[async_trait]
impl Persisting for PgAdvisoryStore {
    fn identity(&self) -> &'static str {
        IDENTITY
    }

    async fn save(&self, key: &mut Key) -> Result<(), LockError> {
        let resource = key.resource().to_owned();
        self.guard.save(key).await?;

        let objid = advisory_id(&resource);
        let acquired: bool = {
            let mut conn = self.conn.lock().await;
            sqlx::query_scalar::<_, bool>("SELECT pg_try_advisory_lock($1)")
                .bind(objid)
                .fetch_one(&mut *conn)
                .await
                .map_err(LockError::storage)?
        };

        if acquired {
            key.state_mut(IDENTITY).handle = Some("exclusive".to_owned());
            debug!(resource, "pg-advisory: exclusive lock acquired");
            Ok(())
        } else {
            let _ = self.guard.delete(key).await;
            Err(LockError::LockConflicted(format!(
                "resource {resource} is held by another session"
            )))
        }
    }

    async fn put_off_expiration(&self, key: &mut Key, _ttl: Duration) -> Result<(), LockError> {
        let resource = key.resource().to_owned();
        if self.guard.exists(key).await? {
            Ok(())
        } else {
            Err(LockError::LockConflicted(format!(
                "resource {resource} is not held by this token"
            )))
        }
    }

    async fn delete(&self, key: &mut Key) -> Result<(), LockError> {
        let resource = key.resource().to_owned();
        if !self.guard.exists(key).await? {
            return Ok(());
        }

        let shared = key.state(IDENTITY).and_then(|s| s.handle.as_deref()) == Some("shared");
        let objid = advisory_id(&resource);
        let unlock_query = if shared {
            "SELECT pg_advisory_unlock_shared($1)"
        } else {
            "SELECT pg_advisory_unlock($1)"
        };

        {
            let mut conn = self.conn.lock().await;
            loop {
                let still_held: bool = sqlx::query_scalar::<_, bool>(unlock_query)
                    .bind(objid)
                    .fetch_one(&mut *conn)
                    .await
                    .map_err(LockError::storage)?;
                if !still_held {
                    break;
                }
            }
        }

        self.guard.delete(key).await?;
        Ok(())
    }

    async fn exists(&self, key: &Key) -> Result<bool, LockError> {
        self.guard.exists(key).await
    }

    fn as_shared(&self) -> Option<&dyn Shared> {
        Some(self)
    }

    fn as_blocking_exclusive(&self) -> Option<&dyn BlockingExclusive> {
        Some(self)
    }

    fn as_blocking_shared(&self) -> Option<&dyn BlockingShared> {
        Some(self)
    }
}

#[async_trait]
impl Shared for PgAdvisoryStore {
    async fn save_read(&self, key: &mut Key) -> Result<(), LockError> {
        let resource = key.resource().to_owned();
        self.guard.save_read(key).await?;

        let objid = advisory_id(&resource);
        let acquired: bool = {
            let mut conn = self.conn.lock().await;
            sqlx::query_scalar::<_, bool>("SELECT pg_try_advisory_lock_shared($1)")
                .bind(objid)
                .fetch_one(&mut *conn)
                .await
                .map_err(LockError::storage)?
        };

        if acquired {
            key.state_mut(IDENTITY).handle = Some("shared".to_owned());
            debug!(resource, "pg-advisory: shared lock acquired");
            Ok(())
        } else {
            let _ = self.guard.delete(key).await;
            Err(LockError::LockConflicted(format!(
                "resource {resource} is exclusively held by another session"
            )))
        }
    }
}

#[async_trait]
impl BlockingExclusive for PgAdvisoryStore {
    async fn wait_and_save(&self, key: &mut Key) -> Result<(), LockError> {
        let resource = key.resource().to_owned();
        self.poll_guard_exclusive(key).await?;

        let objid = advisory_id(&resource);
        let mut conn = self.conn.lock().await;
        sqlx::query("SELECT pg_advisory_lock($1)")
            .bind(objid)
            .execute(&mut *conn)
            .await
            .map_err(LockError::storage)?;
        drop(conn);

        key.state_mut(IDENTITY).handle = Some("exclusive".to_owned());
        debug!(resource, "pg-advisory: blocking exclusive lock acquired");
        Ok(())
    }
}

#[async_trait]
impl BlockingShared for PgAdvisoryStore {
    async fn wait_and_save_read(&self, key: &mut Key) -> Result<(), LockError> {
        let resource = key.resource().to_owned();
        self.poll_guard_shared(key).await?;

        let objid = advisory_id(&resource);
        let mut conn = self.conn.lock().await;
        sqlx::query("SELECT pg_advisory_lock_shared($1)")
            .bind(objid)
            .execute(&mut *conn)
            .await
            .map_err(LockError::storage)?;
        drop(conn);

        key.state_mut(IDENTITY).handle = Some("shared".to_owned());
        debug!(resource, "pg-advisory: blocking shared lock acquired");
        Ok(())
    }
}

#[cfg(all(test, feature = "integration"))]
mod integration_tests {
    use super::*;

    fn test_config() -> PgAdvisoryConfig {
        PgAdvisoryConfig {
            url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgres://localhost:5432/latchkey_test".to_owned()),
        }
    }

    #[tokio::test]
    async fn conformance() {
        let store = PgAdvisoryStore::new(test_config())
            .await
            .expect("connection should succeed");
        latchkey_core::testing::run_lock_conformance_tests(&store)
            .await
            .expect("conformance tests should pass");
    }

    #[tokio::test]
    async fn shared_conformance() {
        let store = PgAdvisoryStore::new(test_config())
            .await
            .expect("connection should succeed");
        latchkey_core::testing::run_shared_conformance_tests(&store)
            .await
            .expect("shared conformance tests should pass");
    }

    #[tokio::test]
    async fn two_handles_same_connection_second_is_conflicted() {
        // S4 from the spec: same (one-connection) store, two Lock handles
        // for the same resource — the in-memory guard must catch the
        // second before it ever reaches the database.
        let store = PgAdvisoryStore::new(test_config())
            .await
            .expect("connection should succeed");
        let resource = format!("pg-advisory-s4/{}", latchkey_core::generate_fencing_token());

        let mut l1 = Key::new(resource.clone());
        let mut l2 = Key::new(resource);

        store.save(&mut l1).await.expect("first handle should acquire");
        let result = store.save(&mut l2).await;
        assert!(matches!(result, Err(LockError::LockConflicted(_))));

        store.delete(&mut l1).await.unwrap();
    }

    #[tokio::test]
    async fn readers_block_a_writer() {
        // S5 from the spec.
        let store = PgAdvisoryStore::new(test_config())
            .await
            .expect("connection should succeed");
        let resource = format!("pg-advisory-s5/{}", latchkey_core::generate_fencing_token());

        let mut reader_a = Key::new(resource.clone());
        let mut reader_b = Key::new(resource.clone());
        let mut writer = Key::new(resource);

        store.save_read(&mut reader_a).await.unwrap();
        store.save_read(&mut reader_b).await.unwrap();
        let result = store.save(&mut writer).await;
        assert!(matches!(result, Err(LockError::LockConflicted(_))));

        store.delete(&mut reader_a).await.unwrap();
        store.delete(&mut reader_b).await.unwrap();
    }
}
