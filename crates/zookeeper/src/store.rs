use async_trait::async_trait;
use sha1::{Digest, Sha1};
use tracing::debug;
use zookeeper_client as zk;

use latchkey_core::capability::Persisting;
use latchkey_core::error::LockError;
use latchkey_core::key::Key;

use crate::config::ZkConfig;

/// Identity string this backend writes its fencing token under in a `Key`'s
/// per-store state map.
pub const IDENTITY: &str = "latchkey-zookeeper";

/// ZooKeeper [`Persisting`] lock backend.
///
/// A lock is an ephemeral znode under [`ZkConfig::root`], one per resource,
/// whose data body is the holder's fencing token. Ephemeral nodes are tied to
/// the creating session, not to any TTL this crate controls: once the
/// session that created a node dies (crash, network partition past the
/// negotiated timeout), the ensemble removes the node itself. Because of
/// that, [`ZkStore::put_off_expiration`] is a presence check rather than a
/// deadline push, and `Key`s acquired through this backend are marked
/// [`Key::mark_non_serializable`] — a session lives on one TCP connection in
/// one process, so its holder identity cannot be handed to another process.
///
/// ZooKeeper has no native read-lock primitive exposed here (the well-known
/// "shared lock" recipe needs sequential children and watches well beyond
/// what this backend's ephemeral-node model provides), so `ZkStore` does not
/// implement [`latchkey_core::capability::Shared`].
///
/// Resource identifiers containing `/` cannot be used as a single znode name
/// under the flat root this backend creates; those are flattened by
/// replacing `/` with `-` and appending a SHA-1 digest of the original
/// identifier, so two different resources that happen to flatten to the same
/// dashed prefix still land on distinct znodes.
pub struct ZkStore {
    client: zk::Client,
    config: ZkConfig,
}

impl ZkStore {
    /// Connect to the configured ensemble and ensure the root znode exists.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::InvalidArgument`] if the connection cannot be
    /// established, or [`LockError::LockStorage`] if the root znode cannot
    /// be created.
    pub async fn new(config: ZkConfig) -> Result<Self, LockError> {
        let client = zk::Client::connect(&config.connect_string)
            .await
            .map_err(|e| LockError::InvalidArgument(e.to_string()))?;

        match client
            .create(&config.root, b"", &zk::CreateMode::Persistent.with_acls(zk::Acls::anyone_all()))
            .await
        {
            Ok(_) | Err(zk::Error::NodeExists) => {}
            Err(e) => return Err(LockError::storage(e)),
        }

        Ok(Self { client, config })
    }

    fn node_path(&self, resource: &str) -> String {
        node_path(&self.config.root, resource)
    }

    async fn current_holder(&self, path: &str) -> Result<Option<Vec<u8>>, LockError> {
        match self.client.get_data(path).await {
            Ok((data, _stat)) => Ok(Some(data)),
            Err(zk::Error::NoNode) => Ok(None),
            Err(e) => Err(LockError::storage(e)),
        }
    }
}

/// Flatten a resource identifier into a znode path under `root`.
///
/// Resources with no `/` map directly to `{root}/{resource}`; those
/// containing `/` are dashed and suffixed with a SHA-1 of the original so
/// distinct resources never collide after flattening.
fn node_path(root: &str, resource: &str) -> String {
    if resource.contains('/') {
        let mut hasher = Sha1::new();
        hasher.update(resource.as_bytes());
        let digest = hasher.finalize();
        let flattened = resource.replace('/', "-");
        format!("{root}/{flattened}-{}", hex_encode(&digest))
    } else {
        format!("{root}/{resource}")
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

#[async_trait]
impl Persisting for ZkStore {
    fn identity(&self) -> &'static str {
        IDENTITY
    }

    async fn save(&self, key: &mut Key) -> Result<(), LockError> {
        let resource = key.resource().to_owned();
        let token = key.state_mut(IDENTITY).token_or_init().to_owned();
        let path = self.node_path(&resource);

        let create_result = self
            .client
            .create(
                &path,
                token.as_bytes(),
                &zk::CreateMode::Ephemeral.with_acls(zk::Acls::anyone_all()),
            )
            .await;

        match create_result {
            Ok(_) => {
                key.mark_non_serializable();
                debug!(resource, "zookeeper: created ephemeral lock node");
                Ok(())
            }
            Err(zk::Error::NodeExists) => {
                let holder = self.current_holder(&path).await?;
                if holder.as_deref() == Some(token.as_bytes()) {
                    key.mark_non_serializable();
                    debug!(resource, "zookeeper: idempotent re-save, node already ours");
                    Ok(())
                } else {
                    Err(LockError::LockConflicted(format!(
                        "resource {resource} is already held"
                    )))
                }
            }
            Err(e) => Err(LockError::acquiring(e)),
        }
    }

    async fn put_off_expiration(&self, key: &mut Key, _ttl: std::time::Duration) -> Result<(), LockError> {
        // Ephemeral nodes have no TTL of their own; their lifetime is the
        // session's. The best this backend can do is confirm the session
        // is still holding the node at all.
        let resource = key.resource().to_owned();
        let token = key.state_mut(IDENTITY).token_or_init().to_owned();
        let path = self.node_path(&resource);

        let holder = self.current_holder(&path).await?;
        if holder.as_deref() == Some(token.as_bytes()) {
            Ok(())
        } else {
            Err(LockError::LockConflicted(format!(
                "resource {resource} is no longer held by this session"
            )))
        }
    }

    async fn delete(&self, key: &mut Key) -> Result<(), LockError> {
        let resource = key.resource().to_owned();
        let token = key.state_mut(IDENTITY).token_or_init().to_owned();
        let path = self.node_path(&resource);

        let holder = self.current_holder(&path).await?;
        if holder.as_deref() != Some(token.as_bytes()) {
            return Ok(());
        }

        match self.client.delete(&path, None).await {
            Ok(()) | Err(zk::Error::NoNode) => Ok(()),
            Err(e) => Err(LockError::LockReleasing(e.to_string())),
        }
    }

    async fn exists(&self, key: &Key) -> Result<bool, LockError> {
        let Some(token) = key.state(IDENTITY).and_then(|s| s.token.clone()) else {
            return Ok(false);
        };
        let path = self.node_path(key.resource());
        let holder = self.current_holder(&path).await?;
        Ok(holder.as_deref() == Some(token.as_bytes()))
    }
}

#[cfg(test)]
mod path_tests {
    use super::*;

    #[test]
    fn simple_resource_maps_directly_under_root() {
        assert_eq!(node_path("/latchkey", "job-42"), "/latchkey/job-42");
    }

    #[test]
    fn resource_with_slash_is_flattened_and_suffixed() {
        let path = node_path("/latchkey", "tenants/acme/job");
        assert!(path.starts_with("/latchkey/tenants-acme-job-"));
        // SHA-1 hex digest is 40 characters.
        assert_eq!(path.len(), "/latchkey/tenants-acme-job-".len() + 40);
    }

    #[test]
    fn distinct_resources_flattening_to_the_same_prefix_stay_distinct() {
        let a = node_path("/latchkey", "a/b-c");
        let b = node_path("/latchkey", "a-b/c");
        assert_ne!(a, b);
    }
}

#[cfg(all(test, feature = "integration"))]
mod integration_tests {
    use super::*;

    fn test_config() -> ZkConfig {
        ZkConfig {
            connect_string: std::env::var("ZOOKEEPER_ADDR")
                .unwrap_or_else(|_| "127.0.0.1:2181".to_owned()),
            root: format!("/latchkey-test-{}", latchkey_core::generate_fencing_token()),
            ..ZkConfig::default()
        }
    }

    #[tokio::test]
    async fn conformance() {
        let store = ZkStore::new(test_config())
            .await
            .expect("connection should succeed");
        latchkey_core::testing::run_lock_conformance_tests(&store)
            .await
            .expect("conformance tests should pass");
    }

    #[tokio::test]
    async fn save_marks_key_non_serializable() {
        let store = ZkStore::new(test_config())
            .await
            .expect("connection should succeed");
        let mut key = Key::new("session-bound");

        assert!(key.is_serializable());
        store.save(&mut key).await.unwrap();
        assert!(!key.is_serializable());
        store.delete(&mut key).await.unwrap();
    }
}
