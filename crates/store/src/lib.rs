//! Persistent `file hash → file name` records backed by [`redb`].
//!
//! # Tables
//!
//! | Name    | Key            | Value                                  |
//! |---------|----------------|----------------------------------------|
//! | `files` | content hash   | file name (empty until first bound)    |
//! | `names` | file name      | content hash                           |
//!
//! `files` holds the records themselves; `names` is a secondary index so
//! records can be addressed by either column.  Both tables are updated in the
//! same write transaction, so they never disagree.
//!
//! Every public operation catches storage failures, logs them, and reports
//! the outcome through its return value.  Callers check the result instead of
//! handling an error.
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

// ── redb table definitions ────────────────────────────────────────────────────

/// Record table: `file_hash → file_name`.
const FILES_TABLE: TableDefinition<&str, &str> = TableDefinition::new("files");
/// Name index: `file_name → file_hash`.
const NAMES_TABLE: TableDefinition<&str, &str> = TableDefinition::new("names");

/// One persisted mapping between a file name and its content hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub file_name: String,
    pub file_hash: String,
}

/// Column selector for [`HashStore::select_one`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Column {
    FileName,
    FileHash,
}

/// Result of [`HashStore::insert_if_absent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The hash was unseen and a new record now exists for it.
    Inserted,
    /// A record for the hash already existed; nothing was written.
    AlreadyPresent,
    /// The storage layer failed; nothing was written.
    Failed,
}

impl InsertOutcome {
    pub fn inserted(self) -> bool {
        matches!(self, Self::Inserted)
    }
}

pub struct HashStore {
    db: Database,
    path: PathBuf,
}

impl std::fmt::Debug for HashStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashStore").field("path", &self.path).finish()
    }
}

impl HashStore {
    /// Open or create the store file at `path` and make sure its tables exist.
    ///
    /// Unlike the record operations this one propagates failures: a consumer
    /// without a store cannot start.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let db = Database::create(&path)
            .with_context(|| format!("opening hash store at {}", path.display()))?;

        let store = Self { db, path };
        store.try_create_table()?;
        info!(path = %store.path.display(), "connected to hash store");
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Ensure both tables exist.  Idempotent.
    pub fn create_table(&self) -> bool {
        match self.try_create_table() {
            Ok(()) => true,
            Err(err) => {
                error!(?err, "failed to create hash store tables");
                false
            }
        }
    }

    /// Insert a record for `hash` unless one already exists.
    ///
    /// The existence check and the insert share one write transaction, so two
    /// callers racing on the same hash cannot both see `Inserted`.
    pub fn insert_if_absent(&self, hash: &str) -> InsertOutcome {
        match self.try_insert_if_absent(hash) {
            Ok(true) => {
                info!(hash, "inserted new hash record");
                InsertOutcome::Inserted
            }
            Ok(false) => {
                info!(hash, "hash already exists in store");
                InsertOutcome::AlreadyPresent
            }
            Err(err) => {
                error!(?err, hash, "failed to insert hash record");
                InsertOutcome::Failed
            }
        }
    }

    /// Bind `name` to the record for `hash`.  Returns `false` when no record
    /// exists for `hash` or the write failed.
    ///
    /// If `name` was bound to a different hash before, that stale record is
    /// dropped: the file at `name` no longer holds that content.
    pub fn update_file_name(&self, hash: &str, name: &str) -> bool {
        match self.try_update_file_name(hash, name) {
            Ok(true) => {
                info!(hash, name, "bound file name to hash record");
                true
            }
            Ok(false) => {
                debug!(hash, name, "no hash record to bind name to");
                false
            }
            Err(err) => {
                error!(?err, hash, name, "failed to update file name");
                false
            }
        }
    }

    /// Delete the record currently bound to `name`.  Returns `true` when a
    /// record was removed.
    pub fn delete_by_name(&self, name: &str) -> bool {
        match self.try_delete_by_name(name) {
            Ok(removed) => {
                if removed {
                    info!(name, "deleted hash record by name");
                }
                removed
            }
            Err(err) => {
                error!(?err, name, "failed to delete hash record by name");
                false
            }
        }
    }

    /// Delete the record for `hash`.  Returns `true` when a record was removed.
    pub fn delete_by_hash(&self, hash: &str) -> bool {
        match self.try_delete_by_hash(hash) {
            Ok(removed) => {
                if removed {
                    info!(hash, "deleted hash record by hash");
                }
                removed
            }
            Err(err) => {
                error!(?err, hash, "failed to delete hash record by hash");
                false
            }
        }
    }

    /// Value of `column` in the first record (hash key order), if any.
    pub fn select_one(&self, column: Column) -> Option<String> {
        match self.try_first_record() {
            Ok(record) => record.map(|r| match column {
                Column::FileName => r.file_name,
                Column::FileHash => r.file_hash,
            }),
            Err(err) => {
                error!(?err, "failed to select from hash store");
                None
            }
        }
    }

    pub fn find_by_name(&self, name: &str) -> Option<FileRecord> {
        match self.try_find_by_name(name) {
            Ok(record) => record,
            Err(err) => {
                error!(?err, name, "failed to look up record by name");
                None
            }
        }
    }

    pub fn find_by_hash(&self, hash: &str) -> Option<FileRecord> {
        match self.try_find_by_hash(hash) {
            Ok(record) => record,
            Err(err) => {
                error!(?err, hash, "failed to look up record by hash");
                None
            }
        }
    }

    /// All records in hash key order.
    pub fn records(&self) -> Vec<FileRecord> {
        match self.try_records() {
            Ok(records) => records,
            Err(err) => {
                error!(?err, "failed to list hash store records");
                Vec::new()
            }
        }
    }

    pub fn len(&self) -> usize {
        let count = || -> Result<u64> {
            let tx = self.db.begin_read()?;
            let tbl = tx.open_table(FILES_TABLE)?;
            Ok(tbl.len()?)
        };
        match count() {
            Ok(n) => n as usize,
            Err(err) => {
                error!(?err, "failed to count hash store records");
                0
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ── fallible internals ────────────────────────────────────────────────────

    fn try_create_table(&self) -> Result<()> {
        let tx = self.db.begin_write()?;
        tx.open_table(FILES_TABLE)?;
        tx.open_table(NAMES_TABLE)?;
        tx.commit()?;
        Ok(())
    }

    fn try_insert_if_absent(&self, hash: &str) -> Result<bool> {
        let tx = self.db.begin_write()?;
        {
            let mut files = tx.open_table(FILES_TABLE)?;
            if files.get(hash)?.is_some() {
                drop(files);
                tx.abort()?;
                return Ok(false);
            }
            files.insert(hash, "")?;
        }
        tx.commit()?;
        Ok(true)
    }

    fn try_update_file_name(&self, hash: &str, name: &str) -> Result<bool> {
        let tx = self.db.begin_write()?;
        {
            let mut files = tx.open_table(FILES_TABLE)?;
            let mut names = tx.open_table(NAMES_TABLE)?;

            let Some(previous_name) = files.get(hash)?.map(|v| v.value().to_string()) else {
                drop((files, names));
                tx.abort()?;
                return Ok(false);
            };

            let stale_hash = names.get(name)?.map(|v| v.value().to_string());
            if let Some(stale_hash) = stale_hash.filter(|h| h != hash) {
                files.remove(stale_hash.as_str())?;
                debug!(name, stale_hash = %stale_hash, "dropped stale record for rebound name");
            }
            if !previous_name.is_empty() && previous_name != name {
                names.remove(previous_name.as_str())?;
            }

            files.insert(hash, name)?;
            names.insert(name, hash)?;
        }
        tx.commit()?;
        Ok(true)
    }

    fn try_delete_by_name(&self, name: &str) -> Result<bool> {
        let tx = self.db.begin_write()?;
        let removed = {
            let mut files = tx.open_table(FILES_TABLE)?;
            let mut names = tx.open_table(NAMES_TABLE)?;
            let hash = names.remove(name)?.map(|v| v.value().to_string());
            match hash {
                Some(hash) => files.remove(hash.as_str())?.is_some(),
                None => false,
            }
        };
        tx.commit()?;
        Ok(removed)
    }

    fn try_delete_by_hash(&self, hash: &str) -> Result<bool> {
        let tx = self.db.begin_write()?;
        let removed = {
            let mut files = tx.open_table(FILES_TABLE)?;
            let mut names = tx.open_table(NAMES_TABLE)?;
            let name = files.remove(hash)?.map(|v| v.value().to_string());
            if let Some(name) = name.as_deref().filter(|n| !n.is_empty()) {
                let indexed = names.get(name)?.map(|v| v.value() == hash).unwrap_or(false);
                if indexed {
                    names.remove(name)?;
                }
            }
            name.is_some()
        };
        tx.commit()?;
        Ok(removed)
    }

    fn try_first_record(&self) -> Result<Option<FileRecord>> {
        let tx = self.db.begin_read()?;
        let files = tx.open_table(FILES_TABLE)?;
        let first = files.iter()?.next().transpose()?.map(|(k, v)| FileRecord {
            file_hash: k.value().to_string(),
            file_name: v.value().to_string(),
        });
        Ok(first)
    }

    fn try_find_by_name(&self, name: &str) -> Result<Option<FileRecord>> {
        let tx = self.db.begin_read()?;
        let names = tx.open_table(NAMES_TABLE)?;
        let hash = names.get(name)?.map(|v| v.value().to_string());
        Ok(hash.map(|file_hash| FileRecord {
            file_name: name.to_string(),
            file_hash,
        }))
    }

    fn try_find_by_hash(&self, hash: &str) -> Result<Option<FileRecord>> {
        let tx = self.db.begin_read()?;
        let files = tx.open_table(FILES_TABLE)?;
        let name = files.get(hash)?.map(|v| v.value().to_string());
        Ok(name.map(|file_name| FileRecord {
            file_name,
            file_hash: hash.to_string(),
        }))
    }

    fn try_records(&self) -> Result<Vec<FileRecord>> {
        let tx = self.db.begin_read()?;
        let files = tx.open_table(FILES_TABLE)?;
        let mut out = Vec::new();
        for row in files.iter()? {
            let (k, v) = row?;
            out.push(FileRecord {
                file_hash: k.value().to_string(),
                file_name: v.value().to_string(),
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const HASH_A: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";
    const HASH_B: &str = "486ea46224d1bb4fb680f34f7c9ad96a8f24ec88be73ea8e5a6c65260e9cb8a7";

    fn open_store(dir: &TempDir) -> HashStore {
        HashStore::open(dir.path().join("db").join("consumer.redb")).unwrap()
    }

    #[test]
    fn open_creates_parent_dirs_and_empty_tables() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        assert!(store.path().exists());
        assert!(store.is_empty());
        assert!(store.create_table(), "create_table must be idempotent");
        assert_eq!(store.select_one(Column::FileHash), None);
    }

    #[test]
    fn insert_if_absent_inserts_once() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        assert_eq!(store.insert_if_absent(HASH_A), InsertOutcome::Inserted);
        assert_eq!(store.insert_if_absent(HASH_A), InsertOutcome::AlreadyPresent);
        assert!(!store.insert_if_absent(HASH_A).inserted());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn update_binds_name_and_indexes_it() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store.insert_if_absent(HASH_A);
        assert!(store.update_file_name(HASH_A, "/in/a.txt"));

        let by_name = store.find_by_name("/in/a.txt").unwrap();
        assert_eq!(by_name.file_hash, HASH_A);
        let by_hash = store.find_by_hash(HASH_A).unwrap();
        assert_eq!(by_hash.file_name, "/in/a.txt");
        assert_eq!(store.select_one(Column::FileName).as_deref(), Some("/in/a.txt"));
        assert_eq!(store.select_one(Column::FileHash).as_deref(), Some(HASH_A));
    }

    #[test]
    fn update_without_record_is_a_no_op() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        assert!(!store.update_file_name(HASH_A, "/in/a.txt"));
        assert!(store.find_by_name("/in/a.txt").is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn rebinding_a_name_drops_the_stale_record() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store.insert_if_absent(HASH_A);
        store.update_file_name(HASH_A, "/in/a.txt");
        store.insert_if_absent(HASH_B);
        store.update_file_name(HASH_B, "/in/a.txt");

        assert!(store.find_by_hash(HASH_A).is_none());
        assert_eq!(store.find_by_name("/in/a.txt").unwrap().file_hash, HASH_B);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn renaming_a_record_frees_the_old_name() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store.insert_if_absent(HASH_A);
        store.update_file_name(HASH_A, "/in/old.txt");
        store.update_file_name(HASH_A, "/in/new.txt");
        assert!(store.find_by_name("/in/old.txt").is_none());
        assert_eq!(store.find_by_hash(HASH_A).unwrap().file_name, "/in/new.txt");
    }

    #[test]
    fn delete_by_name_clears_both_tables() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store.insert_if_absent(HASH_A);
        store.update_file_name(HASH_A, "/in/a.txt");

        assert!(store.delete_by_name("/in/a.txt"));
        assert!(store.find_by_name("/in/a.txt").is_none());
        assert!(store.find_by_hash(HASH_A).is_none());
        // Second delete, by hash, finds nothing left.
        assert!(!store.delete_by_hash(HASH_A));
        assert!(store.is_empty());
    }

    #[test]
    fn delete_by_hash_handles_unbound_records() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store.insert_if_absent(HASH_A);
        assert!(store.delete_by_hash(HASH_A));
        assert!(store.is_empty());
        assert!(!store.delete_by_name("/never/bound.txt"));
    }

    #[test]
    fn records_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("consumer.redb");
        {
            let store = HashStore::open(&path).unwrap();
            store.insert_if_absent(HASH_A);
            store.update_file_name(HASH_A, "/in/a.txt");
            store.insert_if_absent(HASH_B);
            store.update_file_name(HASH_B, "/in/b.txt");
        }
        let store = HashStore::open(&path).unwrap();
        let records = store.records();
        assert_eq!(records.len(), 2);
        assert!(records.contains(&FileRecord {
            file_name: "/in/b.txt".to_string(),
            file_hash: HASH_B.to_string(),
        }));
    }
}
