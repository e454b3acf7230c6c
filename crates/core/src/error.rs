use thiserror::Error;

/// The uniform error taxonomy shared by every store backend and the [`crate::lock::Lock`]
/// coordinator.
///
/// Backends translate their own failures (connection errors, driver errors, protocol
/// errors) into one of these variants at the trait boundary; the coordinator never sees
/// backend-specific error types.
#[derive(Debug, Error)]
pub enum LockError {
    /// Bad configuration supplied at construction time: non-positive TTL, a missing
    /// database/collection name, an unsupported DSN scheme, or a `gc_probability`
    /// outside `[0, 1]`. Never retried.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A positive TTL was required but none (or a non-positive one) was supplied.
    #[error("invalid ttl: {0}")]
    InvalidTtl(String),

    /// Another holder currently owns the resource.
    #[error("lock conflicted: {0}")]
    LockConflicted(String),

    /// A backend failure occurred while acquiring or refreshing a lock.
    #[error("lock acquiring failed: {0}")]
    LockAcquiring(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// A backend failure occurred while releasing a lock, or the resource still
    /// appeared locked after a successful-looking delete.
    #[error("lock releasing failed: {0}")]
    LockReleasing(String),

    /// A non-conflict backend write failure during `put_off_expiration`.
    #[error("lock storage failed: {0}")]
    LockStorage(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// The Key's local deadline elapsed before, or immediately after, a backend
    /// operation that otherwise succeeded.
    #[error("lock expired: {0}")]
    LockExpired(String),
}

impl LockError {
    /// Wrap an arbitrary backend error as [`LockError::LockAcquiring`].
    pub fn acquiring<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::LockAcquiring(Box::new(err))
    }

    /// Wrap an arbitrary backend error as [`LockError::LockStorage`].
    pub fn storage<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::LockStorage(Box::new(err))
    }

    /// `true` for the one expected steady-state failure mode.
    #[must_use]
    pub fn is_conflicted(&self) -> bool {
        matches!(self, Self::LockConflicted(_))
    }
}
