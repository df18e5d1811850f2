//! Example database for reusing failures across runs
//!
//! The runner stores three corpora per test, distinguished by key:
//! - the primary key holds the smallest known failing buffer per origin,
//! - `<key>.secondary` holds failing buffers that have since been superseded,
//! - `<key>.coverage` holds the smallest valid buffer per coverage tag.
//!
//! Keys and values are opaque byte strings. Two backends are provided:
//! - `InMemoryDatabase`: shared in-process storage, mostly for tests
//! - `DirectoryDatabase`: one directory per key, one file per value, atomic writes
//!
//! # Example Usage
//!
//! ```rust
//! use conjecture_core::persistence::{DatabaseKey, ExampleDatabase, InMemoryDatabase};
//!
//! let mut db = InMemoryDatabase::new();
//! let key = DatabaseKey::from_function("test_my_function");
//! db.save(&key, &[1, 2, 3]).unwrap();
//! assert_eq!(db.fetch(&key).unwrap(), vec![vec![1, 2, 3]]);
//! ```

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Type alias for database operation results
pub type DatabaseResult<T> = Result<T, DatabaseError>;

#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Database storage lock was poisoned")]
    Locked,
}

/// Opaque key naming one corpus in the database
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DatabaseKey(Vec<u8>);

impl DatabaseKey {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        DatabaseKey(bytes.into())
    }

    /// Key derived from the SHA-256 digest of a test's name
    pub fn from_function(function_name: &str) -> Self {
        let digest = Sha256::digest(function_name.as_bytes());
        DatabaseKey(hex::encode(digest).into_bytes())
    }

    /// `self` followed by `"." + sub_key`
    pub fn with_sub_key(&self, sub_key: &str) -> Self {
        let mut bytes = self.0.clone();
        bytes.push(b'.');
        bytes.extend_from_slice(sub_key.as_bytes());
        DatabaseKey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Hex of the SHA-256 digest of the key, usable as a file name
    pub fn to_hex(&self) -> String {
        hex::encode(Sha256::digest(&self.0))
    }
}

impl fmt::Display for DatabaseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

/// Storage of byte buffers grouped under keys. Values under one key form a set.
pub trait ExampleDatabase: Send + Sync {
    /// Save a value under a key; saving a value twice is a no-op
    fn save(&mut self, key: &DatabaseKey, value: &[u8]) -> DatabaseResult<()>;

    /// Every value saved under a key
    fn fetch(&self, key: &DatabaseKey) -> DatabaseResult<Vec<Vec<u8>>>;

    /// Remove a value; deleting a missing value is a no-op
    fn delete(&mut self, key: &DatabaseKey, value: &[u8]) -> DatabaseResult<()>;

    fn move_value(
        &mut self,
        src_key: &DatabaseKey,
        dest_key: &DatabaseKey,
        value: &[u8],
    ) -> DatabaseResult<()> {
        self.delete(src_key, value)?;
        self.save(dest_key, value)
    }
}

/// In-memory database. Clones share storage, so a clone handed to a runner can be inspected
/// afterwards.
#[derive(Clone, Default)]
pub struct InMemoryDatabase {
    data: Arc<RwLock<HashMap<DatabaseKey, BTreeSet<Vec<u8>>>>>,
}

impl fmt::Debug for InMemoryDatabase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryDatabase")
            .field("keys", &self.key_count())
            .field("examples", &self.example_count())
            .finish()
    }
}

impl InMemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key_count(&self) -> usize {
        self.data
            .read()
            .map(|data| data.values().filter(|v| !v.is_empty()).count())
            .unwrap_or(0)
    }

    pub fn example_count(&self) -> usize {
        self.data
            .read()
            .map(|data| data.values().map(BTreeSet::len).sum())
            .unwrap_or(0)
    }
}

impl ExampleDatabase for InMemoryDatabase {
    fn save(&mut self, key: &DatabaseKey, value: &[u8]) -> DatabaseResult<()> {
        let mut data = self.data.write().map_err(|_| DatabaseError::Locked)?;
        data.entry(key.clone()).or_default().insert(value.to_vec());
        Ok(())
    }

    fn fetch(&self, key: &DatabaseKey) -> DatabaseResult<Vec<Vec<u8>>> {
        let data = self.data.read().map_err(|_| DatabaseError::Locked)?;
        Ok(data
            .get(key)
            .map(|values| values.iter().cloned().collect())
            .unwrap_or_default())
    }

    fn delete(&mut self, key: &DatabaseKey, value: &[u8]) -> DatabaseResult<()> {
        let mut data = self.data.write().map_err(|_| DatabaseError::Locked)?;
        if let Some(values) = data.get_mut(key) {
            values.remove(value);
        }
        Ok(())
    }
}

/// File-based database with atomic writes.
///
/// Layout: `<base>/<hex digest of key>/<truncated hex digest of value>.example`.
#[derive(Debug, Clone)]
pub struct DirectoryDatabase {
    base_path: PathBuf,
}

impl DirectoryDatabase {
    pub fn new<P: AsRef<Path>>(base_path: P) -> DatabaseResult<Self> {
        let base_path = base_path.as_ref().to_path_buf();
        fs::create_dir_all(&base_path).map_err(|e| match e.kind() {
            io::ErrorKind::PermissionDenied => DatabaseError::PermissionDenied(format!(
                "Cannot create database directory: {}",
                base_path.display()
            )),
            _ => DatabaseError::Io(e),
        })?;
        Ok(DirectoryDatabase { base_path })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn key_dir(&self, key: &DatabaseKey) -> PathBuf {
        self.base_path.join(key.to_hex())
    }

    fn value_path(&self, key: &DatabaseKey, value: &[u8]) -> PathBuf {
        let value_hash = Sha256::digest(value);
        self.key_dir(key)
            .join(format!("{}.example", hex::encode(&value_hash[..16])))
    }

    /// Write to a temporary file and rename it into place
    fn atomic_write(&self, path: &Path, data: &[u8]) -> DatabaseResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let temp_path = path.with_extension("tmp");
        {
            let mut file = BufWriter::new(File::create(&temp_path)?);
            file.write_all(data)?;
            file.flush()?;
        }
        fs::rename(&temp_path, path)?;
        Ok(())
    }
}

impl ExampleDatabase for DirectoryDatabase {
    fn save(&mut self, key: &DatabaseKey, value: &[u8]) -> DatabaseResult<()> {
        let path = self.value_path(key, value);
        if path.exists() {
            return Ok(());
        }
        self.atomic_write(&path, value)
    }

    fn fetch(&self, key: &DatabaseKey) -> DatabaseResult<Vec<Vec<u8>>> {
        let key_dir = self.key_dir(key);
        if !key_dir.exists() {
            return Ok(Vec::new());
        }
        let mut examples = Vec::new();
        for entry in fs::read_dir(&key_dir)? {
            let path = entry?.path();
            if path.extension().map_or(false, |ext| ext == "example") {
                match fs::read(&path) {
                    Ok(data) => examples.push(data),
                    Err(e) => log::warn!("Failed to read example file {:?}: {}", path, e),
                }
            }
        }
        examples.sort();
        Ok(examples)
    }

    fn delete(&mut self, key: &DatabaseKey, value: &[u8]) -> DatabaseResult<()> {
        let path = self.value_path(key, value);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        let key_dir = self.key_dir(key);
        if let Ok(mut entries) = fs::read_dir(&key_dir) {
            if entries.next().is_none() {
                let _ = fs::remove_dir(&key_dir);
            }
        }
        Ok(())
    }
}
