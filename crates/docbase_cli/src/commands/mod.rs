//! CLI command implementations.

pub mod dump_wal;
pub mod figures;
pub mod inspect;
pub mod verify;

use docbase_core::{Collection, Database};
use std::path::Path;
use std::sync::Arc;

/// Opens the database at `path`, refusing to create a new one.
pub(crate) fn open_existing(path: &Path) -> Result<Database, Box<dyn std::error::Error>> {
    if !path.join("journal.wal").exists() {
        return Err(format!("No database found at {}", path.display()).into());
    }
    Ok(Database::open_dir(path, docbase_core::StoreConfig::default())?)
}

/// All collections, or just `name`.
pub(crate) fn selected(
    db: &Database,
    name: Option<&str>,
) -> Result<Vec<Arc<Collection>>, Box<dyn std::error::Error>> {
    match name {
        Some(name) => Ok(vec![db.collection(name)?]),
        None => Ok(db.collections()),
    }
}
