//! An offline-first, end-to-end-encrypted synchronizing document store.
//!
//! The crate splits a CRDT store from its transport/crypto boundary:
//! `store`/`record`/`schema`/`crdt` hold the local data model,
//! `crypto`/`keys`/`envelope` hold the wire formats and key hierarchy,
//! `sync`/`rpc`/`coordinator` hold everything that talks to a server or
//! another replica, and `db` is the handle an embedder actually opens.

pub mod boundary;
pub mod change;
mod clock;
pub mod collection;
pub mod coordinator;
pub mod crdt;
pub mod crypto;
pub mod db;
mod dot;
pub mod editchain;
pub mod envelope;
pub mod epoch;
pub mod error;
pub mod id;
pub mod keys;
pub mod presence;
pub mod record;
pub mod rpc;
pub mod schema;
pub mod store;
pub mod sync;

pub use boundary::{CryptoProvider, EncryptionContext};
pub use change::{ChangeBus, ChangeEvent, EmitterId};
pub use clock::Clock;
pub use collection::{CollectionBuilder, CollectionDef};
pub use coordinator::{HostLock, ReplicaCoordinator, ReplicaRole};
pub use db::{Database, DatabaseConfig, QueryObserver, RecordObserver};
pub use dot::Dot;
pub use error::{Error, ErrorClass, Result};
pub use id::{PeerId, RecordId, SpaceId};
pub use record::Record;
pub use schema::Schema;
pub use store::{BulkOutcome, BulkResult, Filter, PutOptions, QueryOptions, QueryResult};
pub use sync::{SyncConfig, SyncEngine, SyncResult, SyncTransport};

#[cfg(test)]
mod test_api {
    use super::*;
    use crate::schema::Schema as SchemaDef;
    use serde_json::json;

    #[test]
    fn open_register_put_query_end_to_end() {
        let backend = sled::Config::new().temporary(true).open().unwrap();
        let db = Database::open(backend, DatabaseConfig::default());

        let notes = CollectionBuilder::new("notes")
            .unwrap()
            .v1(SchemaDef::Object(vec![
                ("title".into(), SchemaDef::String),
                ("pinned".into(), SchemaDef::Optional(Box::new(SchemaDef::Boolean))),
            ]))
            .index(&["title"], false, false)
            .build()
            .unwrap();
        db.register_collection(notes).unwrap();

        let emitter = db.new_emitter();
        db.put("notes", emitter, json!({"title": "shopping list"}), PutOptions::default())
            .unwrap();
        db.put("notes", emitter, json!({"title": "todo"}), PutOptions::default())
            .unwrap();

        let all = db
            .query(
                "notes",
                QueryOptions {
                    sort: Some(crate::store::SortSpec::Field("title".into())),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(all.total, 2);
        assert_eq!(all.records[0].data["title"], json!("shopping list"));

        db.flush().unwrap();
    }
}
