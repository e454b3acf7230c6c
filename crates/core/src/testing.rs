//! Reusable conformance suites every backend crate runs against its own
//! store instance.
//!
//! Mirrors the pattern of `acteon_state::testing::run_store_conformance_tests`:
//! a shared assertion suite lives here so each backend crate's own
//! `#[cfg(test)]` module only has to construct a store and call in.

use std::time::Duration;

use crate::capability::Persisting;
use crate::error::LockError;
use crate::key::Key;

/// Panics (via `assert!`/`assert_eq!`) on the first violated invariant, so
/// callers should invoke this from within a `#[test]` / `#[tokio::test]`
/// function, not swallow the `Result`.
///
/// Exercises testable properties 1-5 from the spec: exclusivity,
/// independence, idempotent save, non-owner delete is a no-op, and the
/// round-trip save/exists/delete/exists cycle.
///
/// # Errors
///
/// Returns any backend error not itself part of the property being tested
/// (e.g. a connection failure), so the caller can `.expect(...)` with
/// context.
pub async fn run_lock_conformance_tests(store: &dyn Persisting) -> Result<(), LockError> {
    exclusivity(store).await?;
    independence(store).await?;
    idempotent_save(store).await?;
    non_owner_delete_is_noop(store).await?;
    round_trip(store).await?;
    Ok(())
}

async fn exclusivity(store: &dyn Persisting) -> Result<(), LockError> {
    let resource = unique_resource("exclusivity");
    let mut holder_a = Key::new(resource.clone());
    let mut holder_b = Key::new(resource);

    store.save(&mut holder_a).await?;

    let result = store.save(&mut holder_b).await;
    assert!(
        matches!(result, Err(LockError::LockConflicted(_))),
        "a distinct holder must be conflicted while A still holds, got {result:?}"
    );

    store.delete(&mut holder_a).await?;
    Ok(())
}

async fn independence(store: &dyn Persisting) -> Result<(), LockError> {
    let mut key_r = Key::new(unique_resource("independence-r"));
    let mut key_r_prime = Key::new(unique_resource("independence-r-prime"));

    store.save(&mut key_r).await?;
    assert!(
        !store.exists(&key_r_prime).await?,
        "operations on r must not affect r' before r' is touched"
    );

    store.save(&mut key_r_prime).await?;
    assert!(store.exists(&key_r).await?, "r must remain held");
    assert!(store.exists(&key_r_prime).await?, "r' must now be held");

    store.delete(&mut key_r).await?;
    assert!(
        store.exists(&key_r_prime).await?,
        "deleting r must not affect r'"
    );

    store.delete(&mut key_r_prime).await?;
    Ok(())
}

async fn idempotent_save(store: &dyn Persisting) -> Result<(), LockError> {
    let mut key = Key::new(unique_resource("idempotent-save"));

    store.save(&mut key).await?;
    store.save(&mut key).await?;
    assert!(
        store.exists(&key).await?,
        "the same holder re-saving must not drop the lock"
    );

    store.delete(&mut key).await?;
    Ok(())
}

async fn non_owner_delete_is_noop(store: &dyn Persisting) -> Result<(), LockError> {
    let resource = unique_resource("non-owner-delete");
    let mut holder_a = Key::new(resource.clone());
    let mut holder_b = Key::new(resource);

    store.save(&mut holder_a).await?;
    store.delete(&mut holder_b).await?;

    assert!(
        store.exists(&holder_a).await?,
        "a non-owner's delete must leave the real holder's lock intact"
    );

    store.delete(&mut holder_a).await?;
    Ok(())
}

async fn round_trip(store: &dyn Persisting) -> Result<(), LockError> {
    let mut key = Key::new(unique_resource("round-trip"));

    assert!(!store.exists(&key).await?, "must start unheld");
    store.save(&mut key).await?;
    assert!(store.exists(&key).await?, "must be held after save");
    store.delete(&mut key).await?;
    assert!(!store.exists(&key).await?, "must be unheld after delete");
    Ok(())
}

/// TTL expiry conformance (testable property 6): only meaningful for
/// backends that honor TTL autonomously. Not part of the default suite
/// since not every conforming store enforces expiry server-side (file locks
/// and ZooKeeper sessions notably do not); backends that do should call this
/// explicitly with a short `ttl` and a generous `margin`.
///
/// # Errors
///
/// Returns any backend error encountered while driving the scenario.
pub async fn run_ttl_expiry_conformance_test(
    store: &dyn Persisting,
    ttl: Duration,
    margin: Duration,
) -> Result<(), LockError> {
    let mut key = Key::new(unique_resource("ttl-expiry"));

    store.save(&mut key).await?;
    store.put_off_expiration(&mut key, ttl).await?;

    tokio::time::sleep(ttl + margin).await;

    assert!(
        !store.exists(&key).await?,
        "resource must be reaped autonomously after ttl + margin without an explicit delete"
    );
    Ok(())
}

/// Shared/exclusive exclusion conformance (testable property 7): only
/// meaningful for backends advertising [`crate::capability::Shared`].
///
/// # Errors
///
/// Returns any backend error encountered while driving the scenario.
pub async fn run_shared_conformance_tests(
    store: &dyn crate::capability::Shared,
) -> Result<(), LockError> {
    let resource = unique_resource("shared-exclusion");

    // Two independent shared holders may coexist.
    let mut reader_a = Key::new(resource.clone());
    let mut reader_b = Key::new(resource.clone());
    store.save_read(&mut reader_a).await?;
    store.save_read(&mut reader_b).await?;
    assert!(store.exists(&reader_a).await?);
    assert!(store.exists(&reader_b).await?);

    // An exclusive hold is blocked while readers are outstanding.
    let mut writer = Key::new(resource.clone());
    let result = store.save(&mut writer).await;
    assert!(
        matches!(result, Err(LockError::LockConflicted(_))),
        "exclusive save must be blocked by outstanding shared holds, got {result:?}"
    );

    store.delete(&mut reader_a).await?;
    store.delete(&mut reader_b).await?;

    // With readers gone, exclusive now succeeds, and a fresh read is blocked by it.
    store.save(&mut writer).await?;
    let mut reader_c = Key::new(resource);
    let result = store.save_read(&mut reader_c).await;
    assert!(
        matches!(result, Err(LockError::LockConflicted(_))),
        "shared save must be blocked by an outstanding exclusive hold, got {result:?}"
    );

    store.delete(&mut writer).await?;
    Ok(())
}

fn unique_resource(label: &str) -> String {
    format!("latchkey-conformance/{label}/{}", uuid_like())
}

/// Lightweight unique suffix without pulling in a `uuid` dependency for test
/// code: a random fencing token is already exactly this shape.
fn uuid_like() -> String {
    crate::key::generate_fencing_token()
}
