use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::capability::Persisting;
use crate::error::LockError;
use crate::key::Key;

/// Base polling interval for the blocking-fallback loop: 100ms ± 10% jitter.
const POLL_INTERVAL: Duration = Duration::from_millis(100);
const POLL_JITTER_FRACTION: f64 = 0.10;

fn jittered_poll_interval() -> Duration {
    let jitter = rand::thread_rng().gen_range(-POLL_JITTER_FRACTION..=POLL_JITTER_FRACTION);
    let millis = POLL_INTERVAL.as_millis() as f64 * (1.0 + jitter);
    Duration::from_millis(millis.max(1.0) as u64)
}

/// The stateful handle a caller holds: binds a [`Key`] to a backend `Store`,
/// an optional TTL, and an auto-release policy.
///
/// A `Lock` is not safe for concurrent use by multiple tasks without
/// external synchronization (matching the "single `&mut` borrow" discipline
/// its embedded [`Key`] requires). Distinct `Lock`s for the same resource
/// may run on parallel tasks, threads, or processes and are coordinated
/// exclusively through the store.
pub struct Lock {
    key: Key,
    store: Arc<dyn Persisting>,
    ttl: Option<Duration>,
    auto_release: bool,
    dirty: bool,
}

impl Lock {
    /// Construct a new lock handle bound to `key` and `store`.
    ///
    /// `ttl`, if set, is the deadline the coordinator enforces locally and
    /// asks the backend to honor on every `acquire` / `refresh`. Must be
    /// positive; `Some(Duration::ZERO)` is rejected by `acquire`/`refresh`,
    /// not here, matching the spec's "invalid argument surfaces at the call
    /// that needs it" error design.
    #[must_use]
    pub fn new(key: Key, store: Arc<dyn Persisting>, ttl: Option<Duration>, auto_release: bool) -> Self {
        Self {
            key,
            store,
            ttl,
            auto_release,
            dirty: false,
        }
    }

    /// The resource identifier this lock addresses.
    #[must_use]
    pub fn resource(&self) -> &str {
        self.key.resource()
    }

    /// `true` iff this handle believes it currently owns the resource.
    ///
    /// May be conservatively stale: the backend may have expired the hold
    /// without this handle having observed it yet. Call [`Lock::is_acquired`]
    /// for an authoritative (but racy) backend read.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Pure local check: has the Key's deadline elapsed? Does not contact
    /// the backend.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.key.is_expired()
    }

    /// Pure local check: time remaining until the Key's deadline, or `None`
    /// if there is no deadline or it has already elapsed. Does not contact
    /// the backend.
    #[must_use]
    pub fn remaining_lifetime(&self) -> Option<Duration> {
        self.key.remaining_lifetime()
    }

    /// Authoritative (but racy) ownership query: re-reads the backend and
    /// updates `dirty` as a side effect.
    ///
    /// # Errors
    ///
    /// Returns whatever backend error `exists` surfaces.
    pub async fn is_acquired(&mut self) -> Result<bool, LockError> {
        let held = self.store.exists(&self.key).await?;
        self.dirty = held;
        Ok(held)
    }

    /// Acquire an exclusive hold.
    ///
    /// `blocking = false`: a single `save` attempt; returns `Ok(false)` on
    /// conflict rather than erroring.
    ///
    /// `blocking = true`: uses the backend's native blocking acquisition if
    /// it advertises [`crate::capability::BlockingExclusive`], else polls
    /// `save` with 100ms ± 10% jitter between attempts.
    ///
    /// # Errors
    ///
    /// - [`LockError::LockAcquiring`] wraps any non-conflict backend
    ///   failure.
    /// - [`LockError::LockExpired`] if the Key's local deadline elapsed
    ///   immediately after a successful acquisition; the coordinator
    ///   compensates with a best-effort release first.
    pub async fn acquire(&mut self, blocking: bool) -> Result<bool, LockError> {
        self.key.reset_expiration();

        let outcome = if blocking {
            if let Some(be) = self.store.as_blocking_exclusive() {
                be.wait_and_save(&mut self.key).await.map(|()| true)
            } else {
                self.poll_until_saved().await
            }
        } else {
            match self.store.save(&mut self.key).await {
                Ok(()) => Ok(true),
                Err(e) if e.is_conflicted() => Ok(false),
                Err(e) => Err(e),
            }
        };

        let acquired = match outcome {
            Ok(acquired) => acquired,
            Err(e) if e.is_conflicted() => return Err(e),
            Err(e) => return Err(LockError::acquiring(BackendFailure(e.to_string()))),
        };

        if !acquired {
            self.dirty = false;
            return Ok(false);
        }

        self.dirty = true;
        debug!(resource = self.key.resource(), "lock acquired");

        if let Some(ttl) = self.ttl {
            self.refresh(Some(ttl)).await?;
        }

        self.check_not_expired_or_compensate().await?;

        Ok(true)
    }

    /// Poll `save` until it succeeds, sleeping with jitter between
    /// conflicts. Used when the backend lacks native blocking-exclusive
    /// support.
    async fn poll_until_saved(&mut self) -> Result<bool, LockError> {
        loop {
            match self.store.save(&mut self.key).await {
                Ok(()) => return Ok(true),
                Err(e) if e.is_conflicted() => {
                    tokio::time::sleep(jittered_poll_interval()).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Acquire a shared (read) hold.
    ///
    /// Identical to [`Lock::acquire`], substituting the `Shared` /
    /// `BlockingShared` operations. If the store lacks `Shared` entirely,
    /// silently promotes to exclusive [`Lock::acquire`] (and, if also
    /// `blocking`, further promotes to the blocking-exclusive path — this
    /// double promotion is intentional, see the crate's design notes).
    ///
    /// # Errors
    ///
    /// Same as [`Lock::acquire`].
    pub async fn acquire_read(&mut self, blocking: bool) -> Result<bool, LockError> {
        let Some(shared) = self.store.as_shared() else {
            return self.acquire(blocking).await;
        };

        self.key.reset_expiration();

        let outcome = if blocking {
            if let Some(bs) = shared.as_blocking_shared() {
                bs.wait_and_save_read(&mut self.key).await.map(|()| true)
            } else {
                Self::poll_until_saved_read(shared, &mut self.key).await
            }
        } else {
            match shared.save_read(&mut self.key).await {
                Ok(()) => Ok(true),
                Err(e) if e.is_conflicted() => Ok(false),
                Err(e) => Err(e),
            }
        };

        let acquired = match outcome {
            Ok(acquired) => acquired,
            Err(e) if e.is_conflicted() => return Err(e),
            Err(e) => return Err(LockError::acquiring(BackendFailure(e.to_string()))),
        };

        if !acquired {
            self.dirty = false;
            return Ok(false);
        }

        self.dirty = true;
        debug!(resource = self.key.resource(), "read lock acquired");

        if let Some(ttl) = self.ttl {
            self.refresh(Some(ttl)).await?;
        }

        self.check_not_expired_or_compensate().await?;

        Ok(true)
    }

    async fn poll_until_saved_read(
        shared: &dyn crate::capability::Shared,
        key: &mut Key,
    ) -> Result<bool, LockError> {
        loop {
            match shared.save_read(key).await {
                Ok(()) => return Ok(true),
                Err(e) if e.is_conflicted() => {
                    tokio::time::sleep(jittered_poll_interval()).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Extend the hold's TTL.
    ///
    /// `ttl` defaults to the one fixed at construction; a `None` default
    /// with no construction-time TTL either, or an explicit zero, is
    /// [`LockError::InvalidTtl`].
    ///
    /// # Errors
    ///
    /// - [`LockError::InvalidTtl`] for a missing or non-positive TTL.
    /// - [`LockError::LockConflicted`] if another holder has taken over;
    ///   `dirty` is cleared first so a destructor-driven auto-release does
    ///   not attempt to delete a lock this handle no longer owns.
    /// - [`LockError::LockAcquiring`] for any other backend failure.
    /// - [`LockError::LockExpired`] per the same compensation as
    ///   [`Lock::acquire`].
    pub async fn refresh(&mut self, ttl: Option<Duration>) -> Result<(), LockError> {
        let ttl = ttl.or(self.ttl).ok_or_else(|| {
            LockError::InvalidTtl("refresh requires a TTL, none was configured".to_owned())
        })?;
        if ttl.is_zero() {
            return Err(LockError::InvalidTtl(
                "refresh TTL must be positive".to_owned(),
            ));
        }

        self.key.reset_expiration();

        match self.store.put_off_expiration(&mut self.key, ttl).await {
            Ok(()) => {}
            Err(e) if e.is_conflicted() => {
                self.dirty = false;
                return Err(e);
            }
            Err(e) => return Err(LockError::acquiring(BackendFailure(e.to_string()))),
        }

        self.dirty = true;
        self.key.set_lifetime(ttl);

        self.check_not_expired_or_compensate().await
    }

    /// After a successful backend operation, check whether the Key's local
    /// deadline has already elapsed; if so, best-effort release and raise
    /// [`LockError::LockExpired`] rather than let the caller believe it
    /// holds a lock it has already lost the race for.
    async fn check_not_expired_or_compensate(&mut self) -> Result<(), LockError> {
        if !self.key.is_expired() {
            return Ok(());
        }

        if let Err(secondary) = self.release().await {
            warn!(
                resource = self.key.resource(),
                error = %secondary,
                "compensating release after expiry failed (swallowed)"
            );
        }

        Err(LockError::LockExpired(format!(
            "local deadline elapsed for resource {}",
            self.key.resource()
        )))
    }

    /// Release the hold.
    ///
    /// Always calls `store.delete`, then double-checks with `store.exists`
    /// to defend against backends whose delete silently failed to reach
    /// durable state.
    ///
    /// # Errors
    ///
    /// [`LockError::LockReleasing`] wraps any non-releasing backend error,
    /// or is raised directly if the resource still appears held by this
    /// handle's token after a successful-looking delete.
    pub async fn release(&mut self) -> Result<(), LockError> {
        match self.store.delete(&mut self.key).await {
            Ok(()) => {}
            Err(LockError::LockReleasing(msg)) => return Err(LockError::LockReleasing(msg)),
            Err(e) => return Err(LockError::LockReleasing(e.to_string())),
        }

        self.dirty = false;

        if self.store.exists(&self.key).await? {
            return Err(LockError::LockReleasing(format!(
                "resource {} still locked after delete",
                self.key.resource()
            )));
        }

        Ok(())
    }
}

impl Drop for Lock {
    /// Best-effort auto-release on scoped teardown.
    ///
    /// `Drop` cannot `await`, so when `auto_release && dirty` this spawns a
    /// detached release task on the ambient Tokio runtime if one is
    /// reachable; otherwise this is a silent no-op and the TTL remains the
    /// only backstop. Prefer calling [`Lock::release`] explicitly.
    fn drop(&mut self) {
        if !(self.auto_release && self.dirty) {
            return;
        }

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(
                resource = self.key.resource(),
                "auto-release skipped: no Tokio runtime reachable from Drop"
            );
            return;
        };

        let store = Arc::clone(&self.store);
        let mut key = self.key.clone();
        let resource = key.resource().to_owned();
        handle.spawn(async move {
            if let Err(e) = store.delete(&mut key).await {
                warn!(resource, error = %e, "teardown auto-release failed (swallowed)");
            }
        });
    }
}

/// Marker wrapper so an arbitrary backend error's `Display` output can be
/// re-wrapped behind [`std::error::Error`] without depending on the
/// backend's concrete error type.
#[derive(Debug)]
struct BackendFailure(String);

impl std::fmt::Display for BackendFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for BackendFailure {}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::capability::Shared;

    const IDENTITY: &str = "fake-store";

    /// Single-resource, single-slot fake store for exercising the
    /// coordinator's own logic in isolation from any real backend: tracks
    /// one writer token and a settable "delete does not actually clear the
    /// entry" misbehavior, so `Lock::release`'s post-delete `exists` check
    /// can be driven deliberately.
    #[derive(Default)]
    struct FakeStore {
        inner: Mutex<FakeState>,
    }

    #[derive(Default)]
    struct FakeState {
        holder: Option<String>,
        readers: std::collections::HashSet<String>,
        delete_is_silently_ineffective: bool,
    }

    impl FakeStore {
        fn new() -> Self {
            Self::default()
        }

        fn misbehaving_delete() -> Self {
            let store = Self::new();
            store.inner.lock().unwrap().delete_is_silently_ineffective = true;
            store
        }
    }

    #[async_trait]
    impl Persisting for FakeStore {
        fn identity(&self) -> &'static str {
            IDENTITY
        }

        async fn save(&self, key: &mut Key) -> Result<(), LockError> {
            let token = key.state_mut(IDENTITY).token_or_init().to_owned();
            let mut state = self.inner.lock().unwrap();
            match &state.holder {
                Some(h) if h == &token => Ok(()),
                Some(_) => Err(LockError::LockConflicted("held".to_owned())),
                None => {
                    state.holder = Some(token);
                    Ok(())
                }
            }
        }

        async fn put_off_expiration(&self, key: &mut Key, _ttl: Duration) -> Result<(), LockError> {
            let token = key.state_mut(IDENTITY).token_or_init().to_owned();
            let state = self.inner.lock().unwrap();
            match &state.holder {
                Some(h) if h == &token => Ok(()),
                _ => Err(LockError::LockConflicted("not holder".to_owned())),
            }
        }

        async fn delete(&self, key: &mut Key) -> Result<(), LockError> {
            let token = key.state_mut(IDENTITY).token_or_init().to_owned();
            let mut state = self.inner.lock().unwrap();
            if state.holder.as_deref() == Some(token.as_str()) && !state.delete_is_silently_ineffective {
                state.holder = None;
            }
            Ok(())
        }

        async fn exists(&self, key: &Key) -> Result<bool, LockError> {
            let Some(token) = key.state(IDENTITY).and_then(|s| s.token.clone()) else {
                return Ok(false);
            };
            let state = self.inner.lock().unwrap();
            Ok(state.holder.as_deref() == Some(token.as_str()))
        }

        fn as_shared(&self) -> Option<&dyn Shared> {
            Some(self)
        }
    }

    #[async_trait]
    impl Shared for FakeStore {
        async fn save_read(&self, key: &mut Key) -> Result<(), LockError> {
            let token = key.state_mut(IDENTITY).token_or_init().to_owned();
            let mut state = self.inner.lock().unwrap();
            if state.holder.is_some() {
                return Err(LockError::LockConflicted("exclusively held".to_owned()));
            }
            state.readers.insert(token);
            Ok(())
        }
    }

    #[tokio::test]
    async fn acquire_non_blocking_success_sets_dirty() {
        let store = Arc::new(FakeStore::new());
        let mut lock = Lock::new(Key::new("r"), store, None, false);

        assert!(lock.acquire(false).await.unwrap());
        assert!(lock.is_dirty());
    }

    #[tokio::test]
    async fn acquire_non_blocking_conflict_returns_false_and_clears_dirty() {
        let store = Arc::new(FakeStore::new());

        let mut first = Lock::new(Key::new("r"), Arc::clone(&store) as Arc<dyn Persisting>, None, false);
        assert!(first.acquire(false).await.unwrap());

        let mut second = Lock::new(Key::new("r"), store as Arc<dyn Persisting>, None, false);
        assert!(!second.acquire(false).await.unwrap());
        assert!(!second.is_dirty());
    }

    #[tokio::test]
    async fn acquire_with_ttl_that_already_elapsed_compensates_and_raises_expired() {
        let store = Arc::new(FakeStore::new());
        let mut lock = Lock::new(
            Key::new("r"),
            store.clone() as Arc<dyn Persisting>,
            Some(Duration::from_nanos(1)),
            false,
        );

        tokio::time::sleep(Duration::from_millis(5)).await;
        let result = lock.acquire(false).await;
        assert!(matches!(result, Err(LockError::LockExpired(_))));

        // Compensating release must have actually run against the backend.
        assert!(store.inner.lock().unwrap().holder.is_none());
    }

    #[tokio::test]
    async fn refresh_conflict_clears_dirty_so_drop_does_not_delete() {
        let store = Arc::new(FakeStore::new());
        let mut lock = Lock::new(Key::new("r"), Arc::clone(&store) as Arc<dyn Persisting>, None, false);
        assert!(lock.acquire(false).await.unwrap());

        // Simulate another holder taking over out from under us.
        store.inner.lock().unwrap().holder = Some("someone-else".to_owned());

        let result = lock.refresh(Some(Duration::from_secs(5))).await;
        assert!(matches!(result, Err(LockError::LockConflicted(_))));
        assert!(!lock.is_dirty());
    }

    #[tokio::test]
    async fn refresh_without_any_ttl_is_invalid_argument() {
        let store = Arc::new(FakeStore::new());
        let mut lock = Lock::new(Key::new("r"), store, None, false);
        lock.acquire(false).await.unwrap();

        let result = lock.refresh(None).await;
        assert!(matches!(result, Err(LockError::InvalidTtl(_))));
    }

    #[tokio::test]
    async fn release_detects_silently_ineffective_delete() {
        let store = Arc::new(FakeStore::misbehaving_delete());
        let mut lock = Lock::new(Key::new("r"), store, None, false);
        assert!(lock.acquire(false).await.unwrap());

        let result = lock.release().await;
        assert!(matches!(result, Err(LockError::LockReleasing(_))));
    }

    #[tokio::test]
    async fn release_clears_dirty_on_success() {
        let store = Arc::new(FakeStore::new());
        let mut lock = Lock::new(Key::new("r"), store, None, false);
        assert!(lock.acquire(false).await.unwrap());

        lock.release().await.unwrap();
        assert!(!lock.is_dirty());
    }

    #[tokio::test]
    async fn is_acquired_reflects_backend_state_and_updates_dirty() {
        let store = Arc::new(FakeStore::new());
        let mut lock = Lock::new(Key::new("r"), Arc::clone(&store) as Arc<dyn Persisting>, None, false);
        assert!(lock.acquire(false).await.unwrap());

        // Backend forgets about us entirely (e.g. an out-of-band expiry).
        store.inner.lock().unwrap().holder = None;

        assert!(!lock.is_acquired().await.unwrap());
        assert!(!lock.is_dirty());
    }

    #[tokio::test]
    async fn acquire_read_promotes_to_exclusive_when_store_lacks_shared() {
        /// A minimal `Persisting`-only store: no `Shared` impl at all.
        #[derive(Default)]
        struct ExclusiveOnly(Mutex<Option<String>>);

        #[async_trait]
        impl Persisting for ExclusiveOnly {
            fn identity(&self) -> &'static str {
                "exclusive-only"
            }
            async fn save(&self, key: &mut Key) -> Result<(), LockError> {
                let token = key.state_mut("exclusive-only").token_or_init().to_owned();
                let mut guard = self.0.lock().unwrap();
                if guard.is_some() && guard.as_deref() != Some(token.as_str()) {
                    return Err(LockError::LockConflicted("held".to_owned()));
                }
                *guard = Some(token);
                Ok(())
            }
            async fn put_off_expiration(&self, _key: &mut Key, _ttl: Duration) -> Result<(), LockError> {
                Ok(())
            }
            async fn delete(&self, key: &mut Key) -> Result<(), LockError> {
                let token = key.state_mut("exclusive-only").token_or_init().to_owned();
                let mut guard = self.0.lock().unwrap();
                if guard.as_deref() == Some(token.as_str()) {
                    *guard = None;
                }
                Ok(())
            }
            async fn exists(&self, key: &Key) -> Result<bool, LockError> {
                let Some(token) = key.state("exclusive-only").and_then(|s| s.token.clone()) else {
                    return Ok(false);
                };
                Ok(self.0.lock().unwrap().as_deref() == Some(token.as_str()))
            }
        }

        let store = Arc::new(ExclusiveOnly::default());
        let mut lock = Lock::new(Key::new("r"), store, None, false);
        assert!(lock.acquire_read(false).await.unwrap());
        assert!(lock.is_dirty());
    }

    #[tokio::test]
    async fn acquire_read_uses_shared_when_available_and_allows_concurrent_readers() {
        let store = Arc::new(FakeStore::new());

        let mut reader_a = Lock::new(Key::new("r"), Arc::clone(&store) as Arc<dyn Persisting>, None, false);
        let mut reader_b = Lock::new(Key::new("r"), store as Arc<dyn Persisting>, None, false);

        assert!(reader_a.acquire_read(false).await.unwrap());
        assert!(reader_b.acquire_read(false).await.unwrap());
    }
}
