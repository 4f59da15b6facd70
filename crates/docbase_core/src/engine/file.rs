//! Directory-backed storage engine.

use super::{CollectionInfo, StorageEngine};
use crate::collection::CollectionParameters;
use crate::error::{CoreError, CoreResult};
use crate::index::IndexDefinition;
use crate::types::{CollectionId, IndexId};
use fs2::FileExt;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

const LOCK_FILE: &str = "LOCK";
const WAL_FILE: &str = "journal.wal";
const PARAMETER_FILE: &str = "parameter.json";
const COLLECTION_PREFIX: &str = "collection-";
const INDEX_PREFIX: &str = "index-";

/// Stores collection metadata as JSON files under a root directory.
///
/// The engine holds an exclusive lock on `<root>/LOCK` for its lifetime, so
/// two processes cannot open the same directory.
#[derive(Debug)]
pub struct FileEngine {
    root: PathBuf,
    /// Serializes metadata writes.
    write_lock: Mutex<()>,
    _lock_file: File,
}

impl FileEngine {
    /// Opens (and creates if needed) the directory at `root`.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseLocked` if another process holds the directory, or
    /// an I/O error.
    pub fn open(root: &Path) -> CoreResult<Self> {
        fs::create_dir_all(root)?;
        if !root.is_dir() {
            return Err(CoreError::bad_parameter(format!(
                "not a directory: {}",
                root.display()
            )));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(root.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(CoreError::DatabaseLocked);
        }

        debug!(root = %root.display(), "storage engine opened");
        Ok(Self {
            root: root.to_path_buf(),
            write_lock: Mutex::new(()),
            _lock_file: lock_file,
        })
    }

    /// Root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the write-ahead log file.
    #[must_use]
    pub fn wal_path(&self) -> PathBuf {
        self.root.join(WAL_FILE)
    }

    fn collection_dir(&self, cid: CollectionId) -> PathBuf {
        self.root.join(format!("{COLLECTION_PREFIX}{}", cid.as_u64()))
    }

    fn existing_collection_dir(&self, cid: CollectionId) -> CoreResult<PathBuf> {
        let dir = self.collection_dir(cid);
        if dir.join(PARAMETER_FILE).is_file() {
            Ok(dir)
        } else {
            Err(CoreError::collection_not_found(cid.to_string()))
        }
    }

    fn index_path(dir: &Path, iid: IndexId) -> PathBuf {
        dir.join(format!("{INDEX_PREFIX}{}.json", iid.as_u64()))
    }

    fn read_parameters(dir: &Path) -> CoreResult<CollectionParameters> {
        let data = fs::read(dir.join(PARAMETER_FILE))?;
        let value: serde_json::Value = serde_json::from_slice(&data)?;
        CollectionParameters::from_json(&value, true)
    }

    fn write_parameters(dir: &Path, parameters: &CollectionParameters) -> CoreResult<()> {
        let data = serde_json::to_vec_pretty(&parameters.to_json()?)?;
        write_atomic(dir, PARAMETER_FILE, &data)
    }
}

/// Writes `name` in `dir` through a temporary file and a rename.
fn write_atomic(dir: &Path, name: &str, data: &[u8]) -> CoreResult<()> {
    let temp = dir.join(format!("{name}.tmp"));
    let mut file = File::create(&temp)?;
    file.write_all(data)?;
    file.sync_all()?;
    drop(file);
    fs::rename(&temp, dir.join(name))?;
    sync_directory(dir)
}

#[cfg(unix)]
fn sync_directory(dir: &Path) -> CoreResult<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_directory(_dir: &Path) -> CoreResult<()> {
    Ok(())
}

fn parse_numbered(name: &str, prefix: &str, suffix: &str) -> Option<u64> {
    name.strip_prefix(prefix)?.strip_suffix(suffix)?.parse().ok()
}

impl StorageEngine for FileEngine {
    fn create_collection(&self, parameters: &CollectionParameters) -> CoreResult<()> {
        let _guard = self.write_lock.lock();
        let dir = self.collection_dir(parameters.cid);
        if dir.join(PARAMETER_FILE).exists() {
            return Err(CoreError::DuplicateName {
                name: parameters.name.clone(),
            });
        }
        fs::create_dir_all(&dir)?;
        Self::write_parameters(&dir, parameters)?;
        sync_directory(&self.root)
    }

    fn rename_collection(&self, cid: CollectionId, name: &str) -> CoreResult<()> {
        let _guard = self.write_lock.lock();
        let dir = self.existing_collection_dir(cid)?;
        let mut parameters = Self::read_parameters(&dir)?;
        parameters.name = name.to_string();
        Self::write_parameters(&dir, &parameters)
    }

    fn change_collection(&self, parameters: &CollectionParameters) -> CoreResult<()> {
        let _guard = self.write_lock.lock();
        let dir = self.existing_collection_dir(parameters.cid)?;
        Self::write_parameters(&dir, parameters)
    }

    fn get_collection_info(&self, cid: CollectionId) -> CoreResult<CollectionInfo> {
        let dir = self.existing_collection_dir(cid)?;
        let parameters = Self::read_parameters(&dir)?;

        let mut indexes = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if parse_numbered(name, INDEX_PREFIX, ".json").is_none() {
                continue;
            }
            let value: serde_json::Value = serde_json::from_slice(&fs::read(entry.path())?)?;
            indexes.push(serde_json::from_value::<IndexDefinition>(value)?);
        }
        indexes.sort_by_key(|d| d.id);
        Ok(CollectionInfo {
            parameters,
            indexes,
        })
    }

    fn create_index(&self, cid: CollectionId, definition: &IndexDefinition) -> CoreResult<()> {
        let _guard = self.write_lock.lock();
        let dir = self.existing_collection_dir(cid)?;
        let data = serde_json::to_vec_pretty(definition)?;
        write_atomic(
            &dir,
            &format!("{INDEX_PREFIX}{}.json", definition.id.as_u64()),
            &data,
        )
    }

    fn drop_index(&self, cid: CollectionId, iid: IndexId) -> CoreResult<()> {
        let _guard = self.write_lock.lock();
        let dir = self.existing_collection_dir(cid)?;
        match fs::remove_file(Self::index_path(&dir, iid)) {
            Ok(()) => sync_directory(&dir),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn drop_collection(&self, cid: CollectionId) -> CoreResult<()> {
        let _guard = self.write_lock.lock();
        let dir = self.existing_collection_dir(cid)?;
        fs::remove_dir_all(&dir)?;
        debug!(%cid, "collection directory removed");
        sync_directory(&self.root)
    }

    fn collections(&self) -> CoreResult<Vec<CollectionId>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            if let Some(id) = name
                .to_str()
                .and_then(|n| parse_numbered(n, COLLECTION_PREFIX, ""))
            {
                if entry.path().join(PARAMETER_FILE).is_file() {
                    ids.push(CollectionId::new(id));
                }
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CollectionType;
    use tempfile::tempdir;

    fn params(cid: u64, name: &str) -> CollectionParameters {
        let mut p = CollectionParameters::new(name, CollectionType::Edge);
        p.cid = CollectionId::new(cid);
        p
    }

    #[test]
    fn layout_on_disk() {
        let temp = tempdir().unwrap();
        let engine = FileEngine::open(temp.path()).unwrap();
        engine.create_collection(&params(12, "links")).unwrap();
        let mut hash = IndexDefinition::hash(&["a", "b"], true, false);
        hash.id = IndexId::new(3);
        engine.create_index(CollectionId::new(12), &hash).unwrap();

        let dir = temp.path().join("collection-12");
        assert!(dir.join("parameter.json").is_file());
        assert!(dir.join("index-3.json").is_file());
        assert_eq!(engine.wal_path(), temp.path().join("journal.wal"));
    }

    #[test]
    fn metadata_survives_reopen() {
        let temp = tempdir().unwrap();
        {
            let engine = FileEngine::open(temp.path()).unwrap();
            engine.create_collection(&params(5, "a")).unwrap();
            engine.create_collection(&params(2, "b")).unwrap();
            engine.rename_collection(CollectionId::new(5), "renamed").unwrap();
            let mut def = IndexDefinition::skiplist(&["n"], false, false);
            def.id = IndexId::new(9);
            engine.create_index(CollectionId::new(5), &def).unwrap();
        }
        let engine = FileEngine::open(temp.path()).unwrap();
        assert_eq!(
            engine.collections().unwrap(),
            vec![CollectionId::new(2), CollectionId::new(5)]
        );
        let info = engine.get_collection_info(CollectionId::new(5)).unwrap();
        assert_eq!(info.parameters.name, "renamed");
        assert_eq!(info.parameters.collection_type, CollectionType::Edge);
        assert_eq!(info.indexes.len(), 1);
        assert_eq!(info.indexes[0].id, IndexId::new(9));

        engine.drop_index(CollectionId::new(5), IndexId::new(9)).unwrap();
        engine.drop_index(CollectionId::new(5), IndexId::new(9)).unwrap();
        assert!(engine
            .get_collection_info(CollectionId::new(5))
            .unwrap()
            .indexes
            .is_empty());
    }

    #[test]
    fn second_open_is_locked_out() {
        let temp = tempdir().unwrap();
        let _engine = FileEngine::open(temp.path()).unwrap();
        assert!(matches!(
            FileEngine::open(temp.path()),
            Err(CoreError::DatabaseLocked)
        ));
    }

    #[test]
    fn drop_removes_directory() {
        let temp = tempdir().unwrap();
        let engine = FileEngine::open(temp.path()).unwrap();
        engine.create_collection(&params(1, "gone")).unwrap();
        engine.drop_collection(CollectionId::new(1)).unwrap();
        assert!(!temp.path().join("collection-1").exists());
        assert!(matches!(
            engine.get_collection_info(CollectionId::new(1)),
            Err(CoreError::CollectionNotFound { .. })
        ));
    }
}
