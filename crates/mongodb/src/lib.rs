//! MongoDB `latchkey` lock backend.
//!
//! Provides [`MongoStore`], a [`latchkey_core::Persisting`] implementation
//! backed by one document per resource and a TTL index for autonomous
//! reaping. See [`store`] for the upsert filter that gives `save` its
//! idempotent-for-the-same-holder behavior, and the caveat that TTL reaping
//! depends on synchronized clocks between the application and the
//! database.
//!
//! ```ignore
//! use latchkey_mongodb::{MongoConfig, MongoStore};
//!
//! let config = MongoConfig::new("mongodb://127.0.0.1:27017");
//! let store = MongoStore::new(config)?;
//! ```

mod config;
mod store;

pub use config::MongoConfig;
pub use store::MongoStore;
