//! Integration tests for the document pipeline.

use docbase_core::{
    CollectionParameters, CollectionType, CoreError, Database, DocumentOperation,
    DocumentSelector, IndexDefinition, IndexLookup, InMemoryEngine, LockMode, OperationOptions,
    Revision, ServerRole, StoreConfig,
};
use docbase_core::clock::{pack, HLC_EPOCH_MS};
use docbase_storage::InMemoryBackend;
use serde_json::json;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn open() -> (Database, InMemoryBackend) {
    let backend = InMemoryBackend::new();
    let db = Database::open(
        StoreConfig::default(),
        Box::new(backend.share()),
        Arc::new(InMemoryEngine::new()),
    )
    .unwrap();
    (db, backend)
}

fn users(db: &Database) -> Arc<docbase_core::Collection> {
    db.create_collection(CollectionParameters::new("users", CollectionType::Document))
        .unwrap()
}

#[test]
fn duplicate_key_leaves_collection_unchanged() {
    let (db, _) = open();
    let users = users(&db);
    let trx = db.begin_transaction();
    let options = OperationOptions::default();
    users.insert(&trx, json!({"_key": "a", "v": 1}), &options).unwrap();

    let err = users
        .insert(&trx, json!({"_key": "a", "v": 2}), &options)
        .unwrap_err();
    assert!(err.is_unique_violation(), "{err:?}");
    assert_eq!(users.count(&trx).unwrap(), 1);
    assert_eq!(users.document(&trx, "a").unwrap()["v"], json!(1));
}

#[test]
fn stale_revision_conflicts_without_changes() {
    let (db, _) = open();
    let users = users(&db);
    let trx = db.begin_transaction();
    let options = OperationOptions::default();
    let first = users.insert(&trx, json!({"_key": "a", "v": 1}), &options).unwrap();
    let second = users
        .update(&trx, DocumentSelector::key("a"), json!({"v": 2}), &options)
        .unwrap();
    assert!(second.rev > first.rev);
    assert_eq!(second.old_rev, Some(first.rev));

    let stale = DocumentSelector::key("a").with_revision(first.rev);
    let checked = options.ignore_revisions(false);
    let err = users
        .replace(&trx, stale.clone(), json!({"v": 3}), &checked)
        .unwrap_err();
    assert!(matches!(err, CoreError::Conflict { .. }), "{err:?}");
    assert_eq!(users.document(&trx, "a").unwrap()["v"], json!(2));
    let err = users.remove(&trx, stale.clone(), &checked).unwrap_err();
    assert!(matches!(err, CoreError::Conflict { .. }));

    // revisions are ignored by default
    let forced = users.replace(&trx, stale, json!({"v": 3}), &options).unwrap();
    assert!(forced.rev > second.rev);
}

#[test]
fn failed_unique_secondary_unwinds_the_insert() {
    let (db, _) = open();
    let users = users(&db);
    let trx = db.begin_transaction();
    let (email, created) = users
        .ensure_index(&trx, IndexDefinition::hash(&["email"], true, false))
        .unwrap();
    assert!(created);

    let options = OperationOptions::default();
    users
        .insert(&trx, json!({"_key": "a", "email": "a@example.com"}), &options)
        .unwrap();
    let err = users
        .insert(&trx, json!({"_key": "b", "email": "a@example.com"}), &options)
        .unwrap_err();
    assert!(err.is_unique_violation());

    assert!(users.read(&trx, "b").is_err());
    assert_eq!(users.all_keys(&trx).unwrap(), vec!["a".to_string()]);
    let hits = users
        .lookup_by_index(
            &trx,
            email.definition.id,
            &IndexLookup::Equal(vec![json!("a@example.com")]),
        )
        .unwrap();
    assert_eq!(hits.len(), 1);

    // the key is free again
    users
        .insert(&trx, json!({"_key": "b", "email": "b@example.com"}), &options)
        .unwrap();
}

#[test]
fn log_failure_unwinds_every_operation_kind() {
    let (db, backend) = open();
    let users = users(&db);
    let trx = db.begin_transaction();
    let options = OperationOptions::default();
    let (tag, _) = users
        .ensure_index(&trx, IndexDefinition::skiplist(&["tag"], false, false))
        .unwrap();
    users
        .insert(&trx, json!({"_key": "a", "tag": "old"}), &options)
        .unwrap();
    let before = users.figures();

    backend.fail_appends_after(0);
    assert!(users.insert(&trx, json!({"_key": "b", "tag": "new"}), &options).is_err());
    assert!(users
        .update(&trx, DocumentSelector::key("a"), json!({"tag": "new"}), &options)
        .is_err());
    assert!(users.remove(&trx, DocumentSelector::key("a"), &options).is_err());
    backend.heal();

    assert_eq!(users.all_keys(&trx).unwrap(), vec!["a".to_string()]);
    assert_eq!(users.document(&trx, "a").unwrap()["tag"], json!("old"));
    let tagged_new = users
        .lookup_by_index(&trx, tag.definition.id, &IndexLookup::Equal(vec![json!("new")]))
        .unwrap();
    assert!(tagged_new.is_empty());
    assert_eq!(users.figures().alive, before.alive);

    users
        .update(&trx, DocumentSelector::key("a"), json!({"tag": "new"}), &options)
        .unwrap();
}

#[test]
fn revisions_increase_across_collections() {
    let (db, _) = open();
    let users = users(&db);
    let posts = db
        .create_collection(CollectionParameters::new("posts", CollectionType::Document))
        .unwrap();
    let trx = db.begin_transaction();
    let options = OperationOptions::default();

    let mut last = None;
    for i in 0..50 {
        let target = if i % 2 == 0 { &users } else { &posts };
        let result = target.insert(&trx, json!({"n": i}), &options).unwrap();
        if let Some(previous) = last {
            assert!(result.rev > previous);
        }
        last = Some(result.rev);
    }
}

#[test]
fn edges_need_valid_endpoints() {
    let (db, _) = open();
    let users = users(&db);
    let links = db
        .create_collection(CollectionParameters::new("links", CollectionType::Edge))
        .unwrap();
    let trx = db.begin_transaction();
    let options = OperationOptions::default();
    users.insert(&trx, json!({"_key": "a"}), &options).unwrap();
    users.insert(&trx, json!({"_key": "b"}), &options).unwrap();

    let err = links.insert(&trx, json!({"_from": "users/a"}), &options).unwrap_err();
    assert!(matches!(err, CoreError::InvalidEdgeAttribute { .. }), "{err:?}");

    links
        .execute(
            &trx,
            DocumentOperation::Insert(json!({"_from": "users/a", "_to": "users/b"})),
            &options,
        )
        .unwrap();
    let outbound = links
        .lookup_by_index(
            &trx,
            docbase_core::collection::EDGE_INDEX_ID,
            &IndexLookup::Edges {
                direction: docbase_core::index::EdgeDirection::Outbound,
                vertex: "users/a".to_string(),
            },
        )
        .unwrap();
    assert_eq!(outbound.len(), 1);
}

#[test]
fn return_old_and_new() {
    let (db, _) = open();
    let users = users(&db);
    let trx = db.begin_transaction();
    let options = OperationOptions::default().return_old(true).return_new(true);
    users.insert(&trx, json!({"_key": "a", "v": 1}), &options).unwrap();
    let result = users
        .update(&trx, DocumentSelector::key("a"), json!({"w": 2}), &options)
        .unwrap();
    let old = result.old.unwrap();
    let new = result.new.unwrap();
    assert_eq!(old["v"], json!(1));
    assert!(old.get("w").is_none());
    assert_eq!(new["v"], json!(1));
    assert_eq!(new["w"], json!(2));
}

#[test]
fn waiting_writer_gets_a_later_revision() {
    let (db, _) = open();
    let db = Arc::new(db);
    let users = users(&db);
    let options = OperationOptions::default();
    let mut holder = db.begin_transaction();
    users.insert(&holder, json!({"_key": "a", "v": 0}), &options).unwrap();
    holder.lock(&users, LockMode::Write).unwrap();

    let waiter = {
        let db = Arc::clone(&db);
        thread::spawn(move || {
            let trx = db.begin_transaction();
            db.collection("users").unwrap().update(
                &trx,
                DocumentSelector::key("a"),
                json!({"v": 2}),
                &OperationOptions::default(),
            )
        })
    };
    // the waiter blocks on the collection lock meanwhile
    thread::sleep(Duration::from_millis(50));
    let first = users
        .update(&holder, DocumentSelector::key("a"), json!({"v": 1}), &options)
        .unwrap();
    holder.release_locks();

    let second = waiter.join().unwrap().unwrap();
    assert_eq!(second.old_rev, Some(first.rev));
    assert!(second.rev > first.rev, "{} <= {}", second.rev, first.rev);
    assert_eq!(users.document(&holder, "a").unwrap()["v"], json!(2));
}

#[test]
fn shard_server_keeps_sharding_attributes() {
    let db = Database::open(
        StoreConfig::new().server_role(ServerRole::DbServer),
        Box::new(InMemoryBackend::new()),
        Arc::new(InMemoryEngine::new()),
    )
    .unwrap();
    let regions = db
        .create_collection(
            CollectionParameters::new("regions", CollectionType::Document).shard_keys(&["region"]),
        )
        .unwrap();
    let trx = db.begin_transaction();
    let options = OperationOptions::default();
    let inserted = regions
        .insert(&trx, json!({"_key": "a", "region": "eu", "v": 1}), &options)
        .unwrap();

    let err = regions
        .update(&trx, DocumentSelector::key("a"), json!({"region": "us"}), &options)
        .unwrap_err();
    assert!(
        matches!(
            err,
            CoreError::MustNotChangeShardingAttributes { ref attribute } if attribute == "region"
        ),
        "{err:?}"
    );
    let err = regions
        .replace(&trx, DocumentSelector::key("a"), json!({"v": 2}), &options)
        .unwrap_err();
    assert!(matches!(err, CoreError::MustNotChangeShardingAttributes { .. }), "{err:?}");

    let current = regions.read(&trx, "a").unwrap();
    assert_eq!(current.revision(), Some(inserted.rev));
    let document = regions.document(&trx, "a").unwrap();
    assert_eq!(document["region"], json!("eu"));
    assert_eq!(document["v"], json!(1));

    // other attributes may change
    regions
        .update(&trx, DocumentSelector::key("a"), json!({"v": 3}), &options)
        .unwrap();
    assert_eq!(regions.document(&trx, "a").unwrap()["v"], json!(3));
}

#[test]
fn single_server_ignores_shard_keys() {
    let (db, _) = open();
    let regions = db
        .create_collection(
            CollectionParameters::new("regions", CollectionType::Document).shard_keys(&["region"]),
        )
        .unwrap();
    let trx = db.begin_transaction();
    let options = OperationOptions::default();
    regions
        .insert(&trx, json!({"_key": "a", "region": "eu"}), &options)
        .unwrap();
    regions
        .update(&trx, DocumentSelector::key("a"), json!({"region": "us"}), &options)
        .unwrap();
    assert_eq!(regions.document(&trx, "a").unwrap()["region"], json!("us"));
}

#[test]
fn restore_keeps_usable_revisions_only() {
    let (db, _) = open();
    let users = users(&db);
    let trx = db.begin_transaction();
    let restore = OperationOptions::default().is_restore(true);

    let kept = Revision::new(pack(HLC_EPOCH_MS + 1_000_000, 7));
    let result = users
        .insert(&trx, json!({"_key": "kept", "_rev": kept.to_string()}), &restore)
        .unwrap();
    assert_eq!(result.rev, kept);
    assert_eq!(users.document(&trx, "kept").unwrap()["_rev"], json!(kept.to_string()));

    let garbled = users
        .insert(&trx, json!({"_key": "garbled", "_rev": "not-a-revision"}), &restore)
        .unwrap();
    assert!(garbled.rev > kept);
    assert_eq!(
        users.document(&trx, "garbled").unwrap()["_rev"],
        json!(garbled.rev.to_string())
    );

    let old_epoch = users
        .insert(&trx, json!({"_key": "old", "_rev": "12345"}), &restore)
        .unwrap();
    assert_ne!(old_epoch.rev, Revision::new(12345));
    assert!(old_epoch.rev > garbled.rev);

    // replace during restore honours the carried revision too
    let replaced_with = Revision::new(pack(HLC_EPOCH_MS + 2_000_000, 1));
    let replaced = users
        .replace(
            &trx,
            DocumentSelector::key("garbled"),
            json!({"_rev": replaced_with.to_string(), "v": 1}),
            &restore,
        )
        .unwrap();
    assert_eq!(replaced.rev, replaced_with);

    // outside restore the carried _rev is ignored
    let plain = users
        .insert(
            &trx,
            json!({"_key": "plain", "_rev": kept.to_string()}),
            &OperationOptions::default(),
        )
        .unwrap();
    assert_ne!(plain.rev, kept);
}
