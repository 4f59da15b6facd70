//! Figures command implementation.

use docbase_core::Figures;
use serde::Serialize;
use std::path::Path;

/// Figures of one collection.
#[derive(Debug, Serialize)]
pub struct CollectionFigures {
    /// Collection name.
    pub name: String,
    /// Its figures.
    pub figures: Figures,
}

/// Runs the figures command.
pub fn run(path: &Path, name: Option<&str>, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let db = super::open_existing(path)?;
    let result: Vec<CollectionFigures> = super::selected(&db, name)?
        .into_iter()
        .map(|c| CollectionFigures {
            name: c.name(),
            figures: c.figures(),
        })
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }
    for entry in &result {
        let f = &entry.figures;
        println!("{}", entry.name);
        println!("  Alive:        {} documents, {} bytes", f.alive.count, f.alive.size);
        println!(
            "  Dead:         {} documents, {} bytes, {} deletions",
            f.dead.count, f.dead.size, f.dead.deletion
        );
        println!("  Indexes:      {} ({} bytes)", f.indexes.count, f.indexes.size);
        println!("  Datafiles:    {}", f.datafiles);
        println!("  Uncollected:  {} log entries", f.uncollected_logfile_entries);
        println!("  Last tick:    {}", f.last_tick.as_u64());
        if let Some(status) = &f.compaction_status {
            println!("  Compaction:   {} at {}", status.message, status.time);
        }
    }
    Ok(())
}
