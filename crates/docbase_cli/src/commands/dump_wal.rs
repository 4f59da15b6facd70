//! Dump-wal command implementation.

use docbase_core::wal::{WalRecord, WalRecordIterator};
use docbase_storage::{FileBackend, StorageBackend};
use parking_lot::Mutex;
use serde::Serialize;
use std::path::Path;

/// Log marker representation for output.
#[derive(Debug, Serialize)]
pub struct WalRecordInfo {
    /// Offset in the log file.
    pub offset: u64,
    /// Marker type.
    pub record_type: String,
    /// Stamped tick.
    pub tick: u64,
    /// Collection id (if applicable).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cid: Option<u64>,
    /// Transaction id (if applicable).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tid: Option<u64>,
    /// Datafile id (if applicable).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fid: Option<u64>,
    /// Index id (if applicable).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iid: Option<u64>,
    /// Document key (if applicable).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Revision (if applicable).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rev: Option<u64>,
    /// Encoded body size in bytes (if applicable).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body_size: Option<usize>,
}

impl WalRecordInfo {
    fn describe(offset: u64, record: &WalRecord) -> Self {
        let mut info = Self {
            offset,
            record_type: format!("{:?}", record.record_type()),
            tick: record.tick().as_u64(),
            cid: record.collection().map(|c| c.as_u64()),
            tid: None,
            fid: None,
            iid: None,
            key: None,
            rev: None,
            body_size: None,
        };
        match record {
            WalRecord::LogfileHeader { fid, .. } | WalRecord::LogfileFooter { fid, .. } => {
                info.fid = Some(fid.as_u64());
            }
            WalRecord::Document {
                tid, key, rev, body, ..
            } => {
                info.tid = Some(tid.as_u64());
                info.key = Some(key.clone());
                info.rev = Some(rev.as_u64());
                info.body_size = Some(body.len());
            }
            WalRecord::Tombstone { tid, key, rev, .. } => {
                info.tid = Some(tid.as_u64());
                info.key = Some(key.clone());
                info.rev = Some(rev.as_u64());
            }
            WalRecord::CreateIndex { iid, .. } | WalRecord::DropIndex { iid, .. } => {
                info.iid = Some(iid.as_u64());
            }
            WalRecord::CollectionHeader { .. } => {}
        }
        info
    }
}

/// Runs the dump-wal command.
pub fn run(
    path: &Path,
    limit: Option<usize>,
    start_offset: u64,
    cid: Option<u64>,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let wal_path = path.join("journal.wal");
    if !wal_path.exists() {
        return Err("WAL file not found".into());
    }

    let backend: Box<dyn StorageBackend> = Box::new(FileBackend::open(&wal_path)?);
    let backend = Mutex::new(backend);
    let records = read_wal_records(&backend, start_offset, limit, cid)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
    } else {
        print_text_output(&records);
    }
    Ok(())
}

pub(crate) fn read_wal_records(
    backend: &Mutex<Box<dyn StorageBackend>>,
    start_offset: u64,
    limit: Option<usize>,
    cid: Option<u64>,
) -> Result<Vec<WalRecordInfo>, Box<dyn std::error::Error>> {
    let max_records = limit.unwrap_or(usize::MAX);
    let mut records = Vec::new();
    for item in WalRecordIterator::new(backend.lock(), start_offset)? {
        if records.len() >= max_records {
            break;
        }
        let (offset, record) = item?;
        if cid.is_some() && record.collection().map(|c| c.as_u64()) != cid {
            continue;
        }
        records.push(WalRecordInfo::describe(offset, &record));
    }
    Ok(records)
}

fn print_text_output(records: &[WalRecordInfo]) {
    println!("{:>10}  {:>8}  {:<16}  DETAILS", "OFFSET", "TICK", "TYPE");
    for r in records {
        let mut details = Vec::new();
        if let Some(cid) = r.cid {
            details.push(format!("cid={cid}"));
        }
        if let Some(tid) = r.tid {
            details.push(format!("tid={tid}"));
        }
        if let Some(fid) = r.fid {
            details.push(format!("fid={fid}"));
        }
        if let Some(iid) = r.iid {
            details.push(format!("iid={iid}"));
        }
        if let Some(key) = &r.key {
            details.push(format!("key={key}"));
        }
        if let Some(rev) = r.rev {
            details.push(format!("rev={rev}"));
        }
        if let Some(size) = r.body_size {
            details.push(format!("body={size}B"));
        }
        println!(
            "{:>10}  {:>8}  {:<16}  {}",
            r.offset,
            r.tick,
            r.record_type,
            details.join(" ")
        );
    }
    println!();
    println!("{} markers", records.len());
}
