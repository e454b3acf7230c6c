//! OS advisory file-lock `latchkey` backend.
//!
//! Provides [`FileStore`], a [`latchkey_core::Persisting`] +
//! [`latchkey_core::BlockingExclusive`] implementation backed by
//! `flock`-family advisory locks on regular files. See [`store`] for the
//! fencing-token-in-file-body protocol and why same-process contention is
//! tracked separately from the OS lock itself.
//!
//! ```ignore
//! use latchkey_file::{FileConfig, FileStore};
//!
//! let store = FileStore::new(FileConfig::new("/var/run/latchkey"));
//! ```

mod config;
mod store;

pub use config::FileConfig;
pub use store::FileStore;
