use std::collections::HashMap;
use std::time::{Duration, Instant};

use base64::Engine as _;
use rand::RngCore;

/// Per-store state attached to a [`Key`]: principally the fencing token a backend
/// uses to prove continued ownership across `save` / `put_off_expiration` / `delete`
/// calls, plus any opaque backend handle that needs to outlive a single call
/// (a held connection, a session id, ...).
#[derive(Debug, Clone, Default)]
pub struct StoreState {
    /// 32 random bytes, base64-encoded. Generated lazily on first use.
    pub token: Option<String>,
    /// Opaque backend-specific handle (e.g. a ZooKeeper session id, serialized).
    pub handle: Option<String>,
}

impl StoreState {
    /// Return the fencing token, generating one if this is the first use.
    pub fn token_or_init(&mut self) -> &str {
        if self.token.is_none() {
            self.token = Some(generate_fencing_token());
        }
        self.token.as_deref().expect("just initialized")
    }
}

/// Generate a 32-byte random fencing token, base64-encoded (44 ASCII chars).
#[must_use]
pub fn generate_fencing_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// Value object identifying a locked resource.
///
/// A `Key` is immutable in its resource identifier but mutable in the bookkeeping
/// stores attach to it (fencing tokens, expiry). It must never be used with two
/// stores of different identities concurrently — each store writes its own slot in
/// `states`, keyed by the store's identity string, so this is enforced by
/// convention rather than the type system.
#[derive(Debug, Clone)]
pub struct Key {
    resource: String,
    states: HashMap<&'static str, StoreState>,
    expiration: Option<Instant>,
    serializable: bool,
}

impl Key {
    /// Create a new key for the given resource identifier.
    ///
    /// # Panics
    ///
    /// Panics if `resource` is empty or exceeds 1024 bytes once UTF-8 encoded;
    /// callers are expected to validate user-supplied resource names before
    /// constructing a `Key`.
    #[must_use]
    pub fn new(resource: impl Into<String>) -> Self {
        let resource = resource.into();
        assert!(!resource.is_empty(), "resource identifier must not be empty");
        assert!(
            resource.len() <= 1024,
            "resource identifier must not exceed 1024 bytes"
        );
        Self {
            resource,
            states: HashMap::new(),
            expiration: None,
            serializable: true,
        }
    }

    /// The resource identifier this key addresses.
    #[must_use]
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Per-store state for `store_identity`, creating an empty entry on first access.
    pub fn state_mut(&mut self, store_identity: &'static str) -> &mut StoreState {
        self.states.entry(store_identity).or_default()
    }

    /// Per-store state for `store_identity`, if it has been written.
    #[must_use]
    pub fn state(&self, store_identity: &'static str) -> Option<&StoreState> {
        self.states.get(store_identity)
    }

    /// Whether this key may be serialized (transported across a process boundary).
    ///
    /// Cleared by backends whose holder identity cannot survive process
    /// boundaries (e.g. a ZooKeeper session).
    #[must_use]
    pub fn is_serializable(&self) -> bool {
        self.serializable
    }

    /// Mark this key non-serializable. Irreversible for the lifetime of the key.
    pub fn mark_non_serializable(&mut self) {
        self.serializable = false;
    }

    /// Reset the local expiration clock to "no deadline." Called at the start of
    /// every acquisition attempt.
    pub fn reset_expiration(&mut self) {
        self.expiration = None;
    }

    /// Push the local deadline out to `now + ttl`, unless a sooner deadline is
    /// already set (sticky minimum — `reduce_lifetime` only ever moves the
    /// deadline earlier never later, so this is used for the *first* deadline
    /// set after a reset).
    pub fn set_lifetime(&mut self, ttl: Duration) {
        self.expiration = Some(Instant::now() + ttl);
    }

    /// Reduce the local deadline to `now + ttl` only if that is earlier than the
    /// current deadline (or no deadline is set yet). Never extends the deadline.
    pub fn reduce_lifetime(&mut self, ttl: Duration) {
        let candidate = Instant::now() + ttl;
        match self.expiration {
            Some(current) if candidate >= current => {}
            _ => self.expiration = Some(candidate),
        }
    }

    /// Whether the local deadline has elapsed. A key with no deadline never expires.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expiration.is_some_and(|exp| Instant::now() >= exp)
    }

    /// Time remaining until the local deadline, or `None` if there is no deadline
    /// or it has already elapsed.
    #[must_use]
    pub fn remaining_lifetime(&self) -> Option<Duration> {
        self.expiration.and_then(|exp| exp.checked_duration_since(Instant::now()))
    }
}

/// Serializes to the bare resource identifier — per-store state (fencing
/// tokens, opaque handles) is process- and connection-local and would be
/// meaningless transported elsewhere. Fails loudly (returns an error rather
/// than silently dropping the flag) once [`Key::mark_non_serializable`] has
/// been called: a key bound to a backend whose holder identity cannot
/// survive a process boundary (e.g. a ZooKeeper session) must not be handed
/// to another process at all.
impl serde::Serialize for Key {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        if !self.serializable {
            return Err(serde::ser::Error::custom(
                "key is bound to a non-transferable store session and cannot be serialized",
            ));
        }
        serializer.serialize_str(&self.resource)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_key_has_no_deadline() {
        let key = Key::new("job/42");
        assert!(!key.is_expired());
        assert_eq!(key.remaining_lifetime(), None);
    }

    #[test]
    fn set_lifetime_then_expired_after_elapsed() {
        let mut key = Key::new("job/42");
        key.set_lifetime(Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(5));
        assert!(key.is_expired());
    }

    #[test]
    fn reduce_lifetime_is_sticky_minimum() {
        let mut key = Key::new("r");
        key.set_lifetime(Duration::from_secs(10));
        let first_deadline = key.expiration;

        // A longer TTL must not push the deadline out.
        key.reduce_lifetime(Duration::from_secs(100));
        assert_eq!(key.expiration, first_deadline);

        // A shorter TTL does move it earlier.
        key.reduce_lifetime(Duration::from_millis(1));
        assert_ne!(key.expiration, first_deadline);
    }

    #[test]
    fn fencing_token_generated_lazily_and_stable() {
        let mut key = Key::new("r");
        assert!(key.state("redis").is_none());

        let token = key.state_mut("redis").token_or_init().to_string();
        assert_eq!(token.len(), 44);

        // Second access returns the same token.
        let token2 = key.state_mut("redis").token_or_init().to_string();
        assert_eq!(token, token2);
    }

    #[test]
    fn states_are_independent_per_store_identity() {
        let mut key = Key::new("r");
        key.state_mut("redis").token_or_init();
        assert!(key.state("postgres").is_none());
    }

    #[test]
    fn non_serializable_is_irreversible() {
        let mut key = Key::new("r");
        assert!(key.is_serializable());
        key.mark_non_serializable();
        assert!(!key.is_serializable());
    }

    #[test]
    #[should_panic(expected = "must not be empty")]
    fn empty_resource_panics() {
        Key::new("");
    }

    #[test]
    fn serializable_key_serializes_to_its_resource() {
        let key = Key::new("job/42");
        let json = serde_json::to_string(&key).expect("a fresh key must serialize");
        assert_eq!(json, "\"job/42\"");
    }

    #[test]
    fn non_serializable_key_fails_serialization_loudly() {
        let mut key = Key::new("r");
        key.mark_non_serializable();
        let result = serde_json::to_string(&key);
        assert!(result.is_err(), "a non-serializable key must refuse to serialize");
    }
}
