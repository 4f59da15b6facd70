//! Integration tests for reopening databases and replaying the log.

use docbase_core::{
    CollectionParameters, CollectionType, CoreError, Database, DocumentSelector,
    IndexDefinition, IndexKind, IndexLookup, InMemoryEngine, OperationOptions, StoreConfig,
};
use docbase_storage::InMemoryBackend;
use serde_json::json;
use std::sync::Arc;
use tempfile::tempdir;

#[test]
fn directory_database_survives_reopen() {
    let dir = tempdir().unwrap();
    let options = OperationOptions::default();

    let (users_id, last_rev) = {
        let db = Database::open_dir(dir.path(), StoreConfig::default()).unwrap();
        let users = db
            .create_collection(CollectionParameters::new("users", CollectionType::Document))
            .unwrap();
        let trx = db.begin_transaction();
        users
            .ensure_index(&trx, IndexDefinition::hash(&["email"], true, false))
            .unwrap();
        for i in 0..20 {
            users
                .insert(
                    &trx,
                    json!({"_key": format!("u{i}"), "email": format!("u{i}@example.com")}),
                    &options,
                )
                .unwrap();
        }
        users.remove(&trx, DocumentSelector::key("u3"), &options).unwrap();
        let last = users
            .update(
                &trx,
                DocumentSelector::key("u4"),
                json!({"email": "four@example.com"}),
                &options,
            )
            .unwrap();
        let id = users.id();
        drop(trx);
        db.close().unwrap();
        (id, last.rev)
    };

    let db = Database::open_dir(dir.path(), StoreConfig::default()).unwrap();
    let users = db.collection("users").unwrap();
    assert_eq!(users.id(), users_id);
    let trx = db.begin_transaction();
    assert_eq!(users.count(&trx).unwrap(), 19);
    assert!(matches!(
        users.read(&trx, "u3"),
        Err(CoreError::DocumentNotFound { .. })
    ));
    assert_eq!(users.read(&trx, "u4").unwrap().revision(), Some(last_rev));

    let email = users
        .indexes()
        .unwrap()
        .into_iter()
        .find(|d| d.definition.kind == IndexKind::Hash)
        .unwrap();
    assert_eq!(email.entries, 19);
    let hits = users
        .lookup_by_index(
            &trx,
            email.definition.id,
            &IndexLookup::Equal(vec![json!("four@example.com")]),
        )
        .unwrap();
    assert_eq!(hits.len(), 1);

    // new revisions continue after the recovered ones
    let next = users.insert(&trx, json!({"_key": "fresh"}), &options).unwrap();
    assert!(next.rev > last_rev);
}

#[test]
fn second_open_of_a_directory_is_refused() {
    let dir = tempdir().unwrap();
    let _db = Database::open_dir(dir.path(), StoreConfig::default()).unwrap();
    assert!(matches!(
        Database::open_dir(dir.path(), StoreConfig::default()),
        Err(CoreError::DatabaseLocked)
    ));
}

#[test]
fn shared_backend_reopen_reports_replay() {
    let engine = InMemoryEngine::new();
    let backend = InMemoryBackend::new();
    let open = || {
        Database::open(
            StoreConfig::default(),
            Box::new(backend.share()),
            Arc::new(engine.clone()),
        )
        .unwrap()
    };
    let options = OperationOptions::default();

    {
        let db = open();
        let items = db
            .create_collection(CollectionParameters::new("items", CollectionType::Document))
            .unwrap();
        let trx = db.begin_transaction();
        for i in 0..5 {
            items.insert(&trx, json!({"_key": i.to_string()}), &options).unwrap();
        }
        items
            .replace(&trx, DocumentSelector::key("0"), json!({"v": 1}), &options)
            .unwrap();
        items.remove(&trx, DocumentSelector::key("1"), &options).unwrap();
    }

    let db = open();
    let report = db.recovery_report();
    assert_eq!(report.len(), 1);
    let (name, stats) = &report[0];
    assert_eq!(name, "items");
    assert_eq!(stats.documents, 5);
    assert_eq!(stats.updates, 1);
    assert_eq!(stats.deletions, 1);
    assert_eq!(stats.alive, 4);

    let items = db.collection("items").unwrap();
    let trx = db.begin_transaction();
    assert_eq!(items.document(&trx, "0").unwrap()["v"], json!(1));
    assert_eq!(items.figures().alive.count, 4);
}

#[test]
fn dropped_index_stays_dropped() {
    let engine = InMemoryEngine::new();
    let backend = InMemoryBackend::new();
    let open = || {
        Database::open(
            StoreConfig::default(),
            Box::new(backend.share()),
            Arc::new(engine.clone()),
        )
        .unwrap()
    };

    {
        let db = open();
        let items = db
            .create_collection(CollectionParameters::new("items", CollectionType::Document))
            .unwrap();
        let trx = db.begin_transaction();
        let (tag, _) = items
            .ensure_index(&trx, IndexDefinition::skiplist(&["tag"], false, false))
            .unwrap();
        items
            .ensure_index(&trx, IndexDefinition::fulltext("text", 2))
            .unwrap();
        assert!(items.drop_index(&trx, tag.definition.id).unwrap());
    }

    let db = open();
    let kinds: Vec<_> = db
        .collection("items")
        .unwrap()
        .indexes()
        .unwrap()
        .into_iter()
        .map(|d| d.definition.kind)
        .collect();
    assert_eq!(kinds, vec![IndexKind::Primary, IndexKind::Fulltext]);
}

#[test]
fn failed_sync_is_not_replayed() {
    let engine = InMemoryEngine::new();
    let backend = InMemoryBackend::new();
    let open = || {
        Database::open(
            StoreConfig::default(),
            Box::new(backend.share()),
            Arc::new(engine.clone()),
        )
        .unwrap()
    };
    let durable = OperationOptions::default().wait_for_sync(true);

    {
        let db = open();
        let users = db
            .create_collection(CollectionParameters::new("users", CollectionType::Document))
            .unwrap();
        let trx = db.begin_transaction();
        let synced = backend.sync_count();
        users.insert(&trx, json!({"_key": "kept"}), &durable).unwrap();
        assert!(backend.sync_count() > synced);

        backend.fail_syncs(true);
        assert!(users.insert(&trx, json!({"_key": "lost"}), &durable).is_err());
        assert!(users
            .update(&trx, DocumentSelector::key("kept"), json!({"v": 1}), &durable)
            .is_err());
        assert!(matches!(
            users.read(&trx, "lost"),
            Err(CoreError::DocumentNotFound { .. })
        ));
        backend.heal();
    }

    let db = open();
    let users = db.collection("users").unwrap();
    let trx = db.begin_transaction();
    assert_eq!(users.all_keys(&trx).unwrap(), vec!["kept".to_string()]);
    assert!(users.document(&trx, "kept").unwrap().get("v").is_none());
}
