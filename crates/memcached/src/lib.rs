//! Memcached `latchkey` lock backend.
//!
//! Provides [`MemcachedStore`], a [`latchkey_core::Persisting`]
//! implementation using `ADD` for exclusive acquisition and the
//! extend-then-delete trick for safe release. See [`store`] for why this
//! backend self-reacquires through `CAS` rather than erroring on an
//! idempotent re-save.
//!
//! ```ignore
//! use latchkey_memcached::{MemcachedConfig, MemcachedStore};
//!
//! let config = MemcachedConfig::new("127.0.0.1:11211");
//! let store = MemcachedStore::new(config).await?;
//! ```

mod config;
mod store;

pub use config::MemcachedConfig;
pub use store::MemcachedStore;
