//! Integration tests for index management.

use docbase_core::{
    CollectionParameters, CollectionType, CoreError, Database, IndexDefinition, IndexId,
    IndexKind, IndexLookup, InMemoryEngine, OperationOptions, StoreConfig,
};
use docbase_storage::InMemoryBackend;
use serde_json::json;
use std::ops::Bound;
use std::sync::Arc;

fn database(config: StoreConfig) -> Database {
    Database::open(
        config,
        Box::new(InMemoryBackend::new()),
        Arc::new(InMemoryEngine::new()),
    )
    .unwrap()
}

#[test]
fn ensure_index_is_idempotent() {
    let db = database(StoreConfig::default());
    let items = db
        .create_collection(CollectionParameters::new("items", CollectionType::Document))
        .unwrap();
    let trx = db.begin_transaction();

    let (first, created) = items
        .ensure_index(&trx, IndexDefinition::hash(&["a", "b"], false, false))
        .unwrap();
    assert!(created);
    // hash fields are unordered
    let (second, created) = items
        .ensure_index(&trx, IndexDefinition::hash(&["b", "a"], false, false))
        .unwrap();
    assert!(!created);
    assert_eq!(first.definition.id, second.definition.id);

    let (skiplist, created) = items
        .ensure_index(&trx, IndexDefinition::skiplist(&["a", "b"], false, false))
        .unwrap();
    assert!(created);
    assert_ne!(skiplist.definition.id, first.definition.id);
    assert_eq!(items.indexes().unwrap().len(), 3);
}

#[test]
fn unique_index_over_duplicates_is_refused() {
    let db = database(StoreConfig::default());
    let items = db
        .create_collection(CollectionParameters::new("items", CollectionType::Document))
        .unwrap();
    let trx = db.begin_transaction();
    let options = OperationOptions::default();
    items.insert(&trx, json!({"code": 7}), &options).unwrap();
    items.insert(&trx, json!({"code": 7}), &options).unwrap();

    let err = items
        .ensure_index(&trx, IndexDefinition::hash(&["code"], true, false))
        .unwrap_err();
    assert!(err.is_unique_violation(), "{err:?}");
    assert_eq!(items.indexes().unwrap().len(), 1);
}

#[test]
fn batched_fill_matches_sequential_fill() {
    let config = StoreConfig::new()
        .fill_workers(4)
        .fill_batch_threshold(10)
        .fill_block_size(16);
    let db = database(config);
    let items = db
        .create_collection(
            CollectionParameters::new("items", CollectionType::Document).index_buckets(8),
        )
        .unwrap();
    let trx = db.begin_transaction();
    let options = OperationOptions::default();
    for i in 0..200 {
        items
            .insert(&trx, json!({"group": i % 10, "rank": i}), &options)
            .unwrap();
    }

    let (group, _) = items
        .ensure_index(&trx, IndexDefinition::hash(&["group"], false, false))
        .unwrap();
    let (rank, _) = items
        .ensure_index(&trx, IndexDefinition::skiplist(&["rank"], true, false))
        .unwrap();
    assert_eq!(group.entries, 200);

    let threes = items
        .lookup_by_index(&trx, group.definition.id, &IndexLookup::Equal(vec![json!(3)]))
        .unwrap();
    assert_eq!(threes.len(), 20);

    let top = items
        .lookup_by_index(
            &trx,
            rank.definition.id,
            &IndexLookup::Range {
                lower: Bound::Included(json!(190)),
                upper: Bound::Unbounded,
            },
        )
        .unwrap();
    assert_eq!(top.len(), 10);
}

#[test]
fn drop_index_rules() {
    let db = database(StoreConfig::default());
    let items = db
        .create_collection(CollectionParameters::new("items", CollectionType::Document))
        .unwrap();
    let links = db
        .create_collection(CollectionParameters::new("links", CollectionType::Edge))
        .unwrap();
    let trx = db.begin_transaction();

    assert!(!items.drop_index(&trx, IndexId::new(0)).unwrap());
    assert!(matches!(
        items.drop_index(&trx, IndexId::new(4242)),
        Err(CoreError::IndexNotFound { .. })
    ));
    assert!(matches!(
        links.drop_index(&trx, docbase_core::collection::EDGE_INDEX_ID),
        Err(CoreError::Forbidden { .. })
    ));

    let (geo, _) = items
        .ensure_index(&trx, IndexDefinition::geo(&["lat", "lon"], false))
        .unwrap();
    assert_eq!(geo.definition.kind, IndexKind::Geo2);
    assert!(items.drop_index(&trx, geo.definition.id).unwrap());
    assert_eq!(items.indexes().unwrap().len(), 1);
}

#[test]
fn fulltext_lookup_and_cleanup() {
    let db = database(StoreConfig::default());
    let notes = db
        .create_collection(CollectionParameters::new("notes", CollectionType::Document))
        .unwrap();
    let trx = db.begin_transaction();
    let options = OperationOptions::default();
    let (text, _) = notes
        .ensure_index(&trx, IndexDefinition::fulltext("body", 3))
        .unwrap();
    notes
        .insert(&trx, json!({"_key": "a", "body": "the quick brown fox"}), &options)
        .unwrap();
    notes
        .insert(&trx, json!({"_key": "b", "body": "a quick reply"}), &options)
        .unwrap();
    notes
        .remove(&trx, docbase_core::DocumentSelector::key("a"), &options)
        .unwrap();

    let hits = notes
        .lookup_by_index(&trx, text.definition.id, &IndexLookup::Fulltext("quick".into()))
        .unwrap();
    assert_eq!(hits.len(), 1);
    notes.cleanup_indexes().unwrap();
    let hits = notes
        .lookup_by_index(&trx, text.definition.id, &IndexLookup::Fulltext("prefix:bro".into()))
        .unwrap();
    assert!(hits.is_empty());
}

#[test]
fn properties_update_and_unload() {
    let db = database(StoreConfig::default());
    let items = db
        .create_collection(CollectionParameters::new("items", CollectionType::Document))
        .unwrap();
    let updated = items
        .update_properties(&json!({"waitForSync": true, "indexBuckets": 16}))
        .unwrap();
    assert!(updated.wait_for_sync);
    assert_eq!(updated.index_buckets, 16);

    assert!(items.update_properties(&json!({"indexBuckets": 3})).is_err());
    assert_eq!(items.properties().index_buckets, 16);

    let trx = db.begin_transaction();
    items.insert(&trx, json!({}), &OperationOptions::default()).unwrap();
    items.unload().unwrap();
    assert_eq!(db.engine().get_collection_info(items.id()).unwrap().parameters.count, 1);
}
