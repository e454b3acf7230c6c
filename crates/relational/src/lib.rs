//! Generic relational-table `latchkey` lock backend.
//!
//! Provides [`RelationalStore`], a [`latchkey_core::Persisting`]
//! implementation backed by a plain `{prefix}locks` table via `sqlx`. Use
//! this when a relational database is already in the application's stack
//! but dedicated advisory-lock semantics (`latchkey-pg-advisory`) aren't
//! available or wanted.
//!
//! ```ignore
//! use latchkey_relational::{RelationalConfig, RelationalStore};
//!
//! let config = RelationalConfig::new("postgres://localhost/app");
//! let store = RelationalStore::new(config).await?;
//! ```

mod config;
mod migrations;
mod store;

pub use config::RelationalConfig;
pub use migrations::run_migrations;
pub use store::RelationalStore;
