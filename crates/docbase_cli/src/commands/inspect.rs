//! Inspect command implementation.

use docbase_core::{CollectionParameters, Database, IndexDescriptor};
use serde::Serialize;
use std::path::Path;

/// Database inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Database path.
    pub path: String,
    /// Log size in bytes.
    pub wal_size: u64,
    /// Newest tick in the log.
    pub last_tick: u64,
    /// Inspected collections.
    pub collections: Vec<CollectionInfo>,
}

/// One collection.
#[derive(Debug, Serialize)]
pub struct CollectionInfo {
    /// Stored parameters.
    pub parameters: CollectionParameters,
    /// Live documents.
    pub documents: usize,
    /// Indexes, primary first.
    pub indexes: Vec<IndexDescriptor>,
}

/// Runs the inspect command.
pub fn run(path: &Path, name: Option<&str>, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let db = super::open_existing(path)?;
    let result = inspect(&db, path, name)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_text_output(&result);
    }
    Ok(())
}

pub(crate) fn inspect(
    db: &Database,
    path: &Path,
    name: Option<&str>,
) -> Result<InspectResult, Box<dyn std::error::Error>> {
    let mut collections = Vec::new();
    let trx = db.begin_transaction();
    for collection in super::selected(db, name)? {
        collections.push(CollectionInfo {
            parameters: collection.properties(),
            documents: collection.count(&trx)?,
            indexes: collection.indexes()?,
        });
    }
    Ok(InspectResult {
        path: path.display().to_string(),
        wal_size: db.wal().size()?,
        last_tick: db.wal().last_tick().as_u64(),
        collections,
    })
}

fn print_text_output(result: &InspectResult) {
    println!("Database: {}", result.path);
    println!("  WAL size:  {} bytes", result.wal_size);
    println!("  Last tick: {}", result.last_tick);
    println!("  Collections: {}", result.collections.len());

    for info in &result.collections {
        let p = &info.parameters;
        println!();
        println!("{} ({}, {:?})", p.name, p.cid, p.collection_type);
        println!("  Documents:     {}", info.documents);
        println!("  Wait for sync: {}", p.wait_for_sync);
        println!("  Index buckets: {}", p.index_buckets);
        println!("  Maximal size:  {} bytes", p.maximal_size);
        for index in &info.indexes {
            let d = &index.definition;
            println!(
                "  Index {} {:<10} [{}]{}{} entries={}",
                d.id,
                d.kind.as_str(),
                d.fields.join(", "),
                if d.unique { " unique" } else { "" },
                if d.sparse { " sparse" } else { "" },
                index.entries
            );
        }
    }
}
