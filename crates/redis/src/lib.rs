//! Redis-family `latchkey` lock backend.
//!
//! Provides [`RedisStore`], a [`latchkey_core::Persisting`] +
//! [`latchkey_core::Shared`] implementation using `SET NX PX` for exclusive
//! holds and a Lua-guarded sorted set for shared (read) holds. See
//! [`store`] for the consistency caveats across Redis deployment
//! topologies.
//!
//! ```ignore
//! use latchkey_redis::{RedisConfig, RedisStore};
//!
//! let config = RedisConfig::new("redis://localhost:6379");
//! let store = RedisStore::new(config)?;
//! ```

mod config;
mod scripts;
mod store;

pub use config::RedisConfig;
pub use store::RedisStore;
