//! In-memory [`latchkey_core::Persisting`] / [`latchkey_core::Shared`] store.
//!
//! Used two ways: standalone, as the plain intra-process backend for
//! single-binary callers, and embedded inside `latchkey-pg-advisory` to
//! serialize same-connection contenders ahead of the database round trip.
//! `latchkey-semaphore` generalizes the same entry shape to N concurrent
//! holders.

mod store;

pub use store::MemoryStore;
