use std::time::Duration;

use async_trait::async_trait;

use crate::error::LockError;
use crate::key::Key;

/// The base capability every store backend must provide: exclusive,
/// non-blocking writes.
///
/// `save` / `delete` / `exists` / `put_off_expiration` are the only
/// operations the [`crate::lock::Lock`] coordinator needs to mediate plain
/// mutual exclusion. Richer capabilities (`Shared`, `BlockingExclusive`,
/// `BlockingShared`) are strict supertraits; a backend that cannot honor one
/// simply never overrides the corresponding `as_*` accessor below, and the
/// coordinator falls back to polling or to exclusive mode.
///
/// TTL/expiry enforcement (the spec's "Expiring" capability) is not a
/// separate trait here: every backend receives the same post-call
/// `key.is_expired()` check from the coordinator regardless of whether the
/// backend itself honors TTLs server-side. Whether a given backend reaps
/// expired holds autonomously is a documented property of the backend, not
/// a distinct Rust trait.
#[async_trait]
pub trait Persisting: Send + Sync {
    /// Stable identity string used as the key into [`Key`]'s per-store state
    /// map. Must be unique per backend *type*, not per instance.
    fn identity(&self) -> &'static str;

    /// Acquire (or idempotently re-acquire) an exclusive hold on `key`.
    ///
    /// Succeeds if the resource is unheld, or already held by `key`'s own
    /// fencing token (idempotent re-save, which may refresh the TTL).
    /// Fails with [`LockError::LockConflicted`] if held by a different
    /// token.
    async fn save(&self, key: &mut Key) -> Result<(), LockError>;

    /// Extend the backend-side deadline for `key` by `ttl`.
    ///
    /// Fails with [`LockError::LockConflicted`] if the holder has changed
    /// since acquisition.
    async fn put_off_expiration(&self, key: &mut Key, ttl: Duration) -> Result<(), LockError>;

    /// Release `key`'s hold. A no-op (not an error) if `key` is not the
    /// current holder — must never release someone else's lock.
    async fn delete(&self, key: &mut Key) -> Result<(), LockError>;

    /// `true` iff the resource is currently held by `key`'s own fencing
    /// token (not merely by *someone*).
    async fn exists(&self, key: &Key) -> Result<bool, LockError>;

    /// Downcast to the [`Shared`] capability, if this backend supports
    /// read-locks. Backends that don't return `None`.
    fn as_shared(&self) -> Option<&dyn Shared> {
        None
    }

    /// Downcast to the [`BlockingExclusive`] capability, if this backend can
    /// natively block until an exclusive hold is available.
    fn as_blocking_exclusive(&self) -> Option<&dyn BlockingExclusive> {
        None
    }

    /// Downcast to the [`BlockingShared`] capability, if this backend can
    /// natively block until a shared hold is available.
    fn as_blocking_shared(&self) -> Option<&dyn BlockingShared> {
        None
    }
}

/// Many-readers/one-writer read-lock acquisition.
///
/// A strict superset of [`Persisting`]: any backend advertising `Shared`
/// must still support the plain exclusive operations.
#[async_trait]
pub trait Shared: Persisting {
    /// Acquire (or idempotently re-acquire) a shared (read) hold on `key`.
    ///
    /// Fails with [`LockError::LockConflicted`] if an exclusive hold is
    /// currently outstanding.
    async fn save_read(&self, key: &mut Key) -> Result<(), LockError>;
}

/// Native blocking exclusive acquisition: suspends the caller until granted.
#[async_trait]
pub trait BlockingExclusive: Persisting {
    /// Block until an exclusive hold on `key` is granted, or a non-conflict
    /// backend error occurs.
    async fn wait_and_save(&self, key: &mut Key) -> Result<(), LockError>;
}

/// Native blocking shared acquisition: suspends the caller until granted.
#[async_trait]
pub trait BlockingShared: Shared {
    /// Block until a shared hold on `key` is granted, or a non-conflict
    /// backend error occurs.
    async fn wait_and_save_read(&self, key: &mut Key) -> Result<(), LockError>;
}
