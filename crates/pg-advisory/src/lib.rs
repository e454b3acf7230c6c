//! PostgreSQL advisory-lock `latchkey` lock backend.
//!
//! Provides [`PgAdvisoryStore`], a [`latchkey_core::Persisting`] +
//! [`latchkey_core::Shared`] + [`latchkey_core::BlockingExclusive`] +
//! [`latchkey_core::BlockingShared`] implementation on top of
//! `pg_try_advisory_lock[_shared]` / `pg_advisory_lock[_shared]` /
//! `pg_advisory_unlock[_shared]`. See [`store`] for why a dedicated,
//! in-memory-guarded connection is required rather than a plain pool.
//!
//! ```ignore
//! use latchkey_pg_advisory::{PgAdvisoryConfig, PgAdvisoryStore};
//!
//! let config = PgAdvisoryConfig::new("postgres://localhost/app");
//! let store = PgAdvisoryStore::new(config).await?;
//! ```

mod config;
mod store;

pub use config::PgAdvisoryConfig;
pub use store::PgAdvisoryStore;
