use std::time::Duration;

use async_trait::async_trait;
use mongodb::bson::{doc, DateTime as BsonDateTime, Document};
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::options::{IndexOptions, UpdateOptions};
use mongodb::{Client, Collection, IndexModel};
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use latchkey_core::capability::Persisting;
use latchkey_core::error::LockError;
use latchkey_core::key::Key;

use crate::config::MongoConfig;

/// Identity string this backend writes its fencing token under in a `Key`'s
/// per-store state map.
pub const IDENTITY: &str = "latchkey-mongodb";

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    if matches!(
        err.kind.as_ref(),
        ErrorKind::Write(WriteFailure::WriteError(we)) if we.code == 11000
    ) {
        return true;
    }
    err.to_string().contains("E11000")
}

/// MongoDB [`Persisting`] lock backend.
///
/// One document per resource, `{_id: resource, token, expires_at}`. `save`
/// is an upsert filtered by `{_id: resource, $or: [{token: mine}, {expires_at:
/// {$lte: now}}]}` — it succeeds when the resource is unheld, expired, or
/// already held by this token, and a concurrent contender's upsert instead
/// raises a duplicate-key error on `_id`, translated to
/// [`LockError::LockConflicted`].
///
/// `_id`'s implicit unique index is what gives `save` its exclusivity; a
/// separate TTL index on `expires_at` (`expireAfterSeconds: 0`) is what
/// lets MongoDB reap dead locks without an explicit delete. Creating that
/// index is a Bernoulli trial on every `save` (`gc_probability`, default
/// `0.001`) rather than a deterministic one-time migration, so a caller
/// with no admin access still gets the index installed, eventually,
/// without paying for an index check on every call.
pub struct MongoStore {
    config: MongoConfig,
    client: OnceCell<Client>,
}

impl MongoStore {
    /// Construct a store for the given configuration. The MongoDB client
    /// connection itself is established lazily on first use.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::InvalidArgument`] if `config` fails
    /// [`MongoConfig::validate`].
    pub fn new(config: MongoConfig) -> Result<Self, LockError> {
        config.validate()?;
        Ok(Self {
            config,
            client: OnceCell::new(),
        })
    }

    async fn client(&self) -> Result<&Client, LockError> {
        self.client
            .get_or_try_init(|| async {
                Client::with_uri_str(&self.config.uri)
                    .await
                    .map_err(LockError::storage)
            })
            .await
    }

    async fn collection(&self) -> Result<Collection<Document>, LockError> {
        let client = self.client().await?;
        Ok(client
            .database(&self.config.database)
            .collection::<Document>(&self.config.collection))
    }

    /// Probabilistically (re-)install the TTL index. Failures are logged
    /// and swallowed: a missing index only delays reaping, it never
    /// compromises exclusivity (which comes from `_id`'s unique index).
    async fn maybe_ensure_ttl_index(&self, collection: &Collection<Document>) {
        if rand::random::<f64>() >= self.config.gc_probability {
            return;
        }

        let model = IndexModel::builder()
            .keys(doc! { "expires_at": 1 })
            .options(
                IndexOptions::builder()
                    .expire_after(Duration::from_secs(0))
                    .build(),
            )
            .build();

        if let Err(e) = collection.create_index(model).await {
            warn!(error = %e, "mongodb: ttl index installation attempt failed (swallowed)");
        }
    }
}

#[async_trait]
impl Persisting for MongoStore {
    fn identity(&self) -> &'static str {
        IDENTITY
    }

    async fn save(&self, key: &mut Key) -> Result<(), LockError> {
        let resource = key.resource().to_owned();
        let token = key.state_mut(IDENTITY).token_or_init().to_owned();
        let collection = self.collection().await?;

        self.maybe_ensure_ttl_index(&collection).await;

        let now = BsonDateTime::now();
        let default_expiry = BsonDateTime::from_chrono(chrono::Utc::now() + Duration::from_secs(30));

        let filter = doc! {
            "_id": &resource,
            "$or": [
                { "token": &token },
                { "expires_at": { "$lte": now } },
            ],
        };
        let update = doc! {
            "$set": { "token": &token, "expires_at": default_expiry },
        };

        let result = collection
            .update_one(filter, update)
            .with_options(UpdateOptions::builder().upsert(true).build())
            .await;

        match result {
            Ok(outcome) if outcome.matched_count > 0 || outcome.upserted_id.is_some() => {
                debug!(resource, "mongodb: exclusive save acquired");
                Ok(())
            }
            Ok(_) => Err(LockError::LockConflicted(format!(
                "resource {resource} is already held"
            ))),
            Err(e) if is_duplicate_key(&e) => Err(LockError::LockConflicted(format!(
                "resource {resource} is already held"
            ))),
            Err(e) => Err(LockError::storage(e)),
        }
    }

    async fn put_off_expiration(&self, key: &mut Key, ttl: Duration) -> Result<(), LockError> {
        let resource = key.resource().to_owned();
        let token = key.state_mut(IDENTITY).token_or_init().to_owned();
        let collection = self.collection().await?;

        let new_expiry = BsonDateTime::from_chrono(chrono::Utc::now() + ttl);
        let filter = doc! { "_id": &resource, "token": &token };
        let update = doc! { "$set": { "expires_at": new_expiry } };

        let outcome = collection
            .update_one(filter, update)
            .await
            .map_err(LockError::storage)?;

        if outcome.matched_count > 0 {
            Ok(())
        } else {
            Err(LockError::LockConflicted(format!(
                "resource {resource} holder has changed"
            )))
        }
    }

    async fn delete(&self, key: &mut Key) -> Result<(), LockError> {
        let resource = key.resource().to_owned();
        let token = key.state_mut(IDENTITY).token_or_init().to_owned();
        let collection = self.collection().await?;

        collection
            .delete_one(doc! { "_id": &resource, "token": &token })
            .await
            .map_err(LockError::storage)?;
        Ok(())
    }

    async fn exists(&self, key: &Key) -> Result<bool, LockError> {
        let resource = key.resource();
        let Some(token) = key.state(IDENTITY).and_then(|s| s.token.clone()) else {
            return Ok(false);
        };
        let collection = self.collection().await?;

        let now = BsonDateTime::now();
        let filter = doc! {
            "_id": resource,
            "token": &token,
            "expires_at": { "$gt": now },
        };
        let found = collection
            .find_one(filter)
            .await
            .map_err(LockError::storage)?;
        Ok(found.is_some())
    }
}

#[cfg(all(test, feature = "integration"))]
mod integration_tests {
    use super::*;

    fn test_config() -> MongoConfig {
        MongoConfig {
            uri: std::env::var("MONGODB_URI")
                .unwrap_or_else(|_| "mongodb://127.0.0.1:27017".to_owned()),
            database: format!("latchkey_test_{}", latchkey_core::generate_fencing_token()),
            ..MongoConfig::default()
        }
    }

    #[tokio::test]
    async fn conformance() {
        let store = MongoStore::new(test_config()).expect("config should validate");
        latchkey_core::testing::run_lock_conformance_tests(&store)
            .await
            .expect("conformance tests should pass");
    }

    #[tokio::test]
    async fn ttl_expiry_local_view() {
        // MongoDB's background TTL reaper runs on a ~60s cycle and isn't
        // suitable for a tight conformance test; instead confirm the local
        // expiry check on the document itself takes effect immediately.
        let store = MongoStore::new(MongoConfig {
            gc_probability: 1.0,
            ..test_config()
        })
        .expect("config should validate");

        let mut key = Key::new("ttl-local-view");
        store.save(&mut key).await.unwrap();
        store
            .put_off_expiration(&mut key, Duration::from_millis(1))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!store.exists(&key).await.unwrap());
    }
}
