//! Store trait abstractions and the distributed lock coordinator for
//! latchkey.
//!
//! This crate is the shared core every backend crate (`latchkey-memory`,
//! `latchkey-redis`, `latchkey-memcached`, `latchkey-mongodb`,
//! `latchkey-relational`, `latchkey-pg-advisory`, `latchkey-zookeeper`,
//! `latchkey-file`, `latchkey-semaphore`) depends on. It fixes three
//! things, and nothing else:
//!
//! - The [`Key`] value object and its fencing-token/expiry bookkeeping.
//! - The [`capability`] trait tower (`Persisting` / `Shared` /
//!   `BlockingExclusive` / `BlockingShared`) every backend implements to
//!   the depth it can honor.
//! - The [`Lock`] coordinator: the stateful handle callers use to acquire,
//!   refresh, and release a hold, regardless of which backend is behind
//!   it.
//!
//! [`testing`] is a reusable conformance suite backend crates run against
//! their own store instances in their own `#[cfg(test)]` modules.

pub mod capability;
pub mod error;
pub mod key;
pub mod lock;
pub mod testing;

pub use capability::{BlockingExclusive, BlockingShared, Persisting, Shared};
pub use error::LockError;
pub use key::{generate_fencing_token, Key, StoreState};
pub use lock::Lock;
