//! ZooKeeper `latchkey` lock backend.
//!
//! Provides [`ZkStore`], a [`latchkey_core::Persisting`] implementation
//! backed by ephemeral znodes. See [`store`] for why locks acquired through
//! this backend are session-lifetime rather than TTL-bound, and why their
//! `Key`s are marked non-serializable.
//!
//! ```ignore
//! use latchkey_zookeeper::{ZkConfig, ZkStore};
//!
//! let config = ZkConfig::new("zoo1:2181,zoo2:2181");
//! let store = ZkStore::new(config).await?;
//! ```

mod config;
mod store;

pub use config::ZkConfig;
pub use store::ZkStore;
