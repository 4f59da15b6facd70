//! Verify command implementation.

use docbase_core::wal::{WalRecord, WalRecordIterator};
use docbase_core::{Database, RecoveryStats, StoreConfig};
use docbase_storage::{FileBackend, StorageBackend};
use parking_lot::Mutex;
use serde::Serialize;
use std::path::Path;

/// Verification report.
#[derive(Debug, Default, Serialize)]
pub struct VerifyReport {
    /// Log markers read.
    pub markers: usize,
    /// Logical datafiles opened in the log.
    pub datafiles: usize,
    /// Document and tombstone markers.
    pub document_markers: usize,
    /// Offset the log is readable up to.
    pub valid_until: u64,
    /// Log size in bytes.
    pub wal_size: u64,
    /// First damaged marker, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_error: Option<String>,
    /// Replay results per collection.
    pub collections: Vec<(String, RecoveryStats)>,
    /// Why the database could not be opened, if it could not.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub open_error: Option<String>,
}

impl VerifyReport {
    /// Whether nothing was found wrong.
    pub fn is_ok(&self) -> bool {
        self.log_error.is_none()
            && self.open_error.is_none()
            && self.collections.iter().all(|(_, stats)| stats.skipped == 0)
    }
}

/// Runs the verify command.
pub fn run(path: &Path, json: bool) -> Result<VerifyReport, Box<dyn std::error::Error>> {
    let wal_path = path.join("journal.wal");
    if !wal_path.exists() {
        return Err(format!("No database found at {}", path.display()).into());
    }

    let mut report = check_log(&wal_path)?;
    if report.log_error.is_none() {
        match Database::open_dir(path, StoreConfig::default()) {
            Ok(db) => report.collections = db.recovery_report().to_vec(),
            Err(err) => report.open_error = Some(err.to_string()),
        }
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_text_output(&report);
    }
    Ok(report)
}

fn check_log(wal_path: &Path) -> Result<VerifyReport, Box<dyn std::error::Error>> {
    let backend: Box<dyn StorageBackend> = Box::new(FileBackend::open(wal_path)?);
    let wal_size = backend.size()?;
    let backend = Mutex::new(backend);

    let mut report = VerifyReport {
        wal_size,
        ..VerifyReport::default()
    };
    let mut iter = WalRecordIterator::new(backend.lock(), 0)?;
    for item in iter.by_ref() {
        match item {
            Ok((_, record)) => {
                report.markers += 1;
                match record {
                    WalRecord::LogfileHeader { .. } => report.datafiles += 1,
                    WalRecord::Document { .. } | WalRecord::Tombstone { .. } => {
                        report.document_markers += 1;
                    }
                    _ => {}
                }
            }
            Err(err) => {
                report.log_error = Some(err.to_string());
                break;
            }
        }
    }
    report.valid_until = iter.offset();
    Ok(report)
}

fn print_text_output(report: &VerifyReport) {
    println!("Log");
    println!("  Markers:          {}", report.markers);
    println!("  Datafiles:        {}", report.datafiles);
    println!("  Document markers: {}", report.document_markers);
    println!("  Readable:         {} of {} bytes", report.valid_until, report.wal_size);
    if let Some(err) = &report.log_error {
        println!("  ERROR: {err}");
    } else if report.valid_until < report.wal_size {
        println!("  Torn tail of {} bytes", report.wal_size - report.valid_until);
    }

    if let Some(err) = &report.open_error {
        println!();
        println!("Open failed: {err}");
    }
    for (name, stats) in &report.collections {
        println!();
        println!("{name}");
        println!("  Alive:     {}", stats.alive);
        println!(
            "  Replayed:  {} new, {} updates, {} deletions",
            stats.documents, stats.updates, stats.deletions
        );
        if stats.missing_deletions > 0 {
            println!("  Deletions of unknown keys: {}", stats.missing_deletions);
        }
        if stats.skipped > 0 {
            println!("  SKIPPED markers: {}", stats.skipped);
        }
    }

    println!();
    if report.is_ok() {
        println!("Verification passed");
    } else {
        println!("Verification FAILED");
    }
}
