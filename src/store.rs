//! Durable storage for wallet records.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("corrupt wallet record \"{name}\": {reason}")]
    Corrupt { name: String, reason: String },
    #[error("invalid wallet name \"{0}\"")]
    InvalidName(String),
    /// Another writer saved the record since it was loaded.
    #[error("wallet \"{name}\" was modified concurrently (expected revision {expected:?}, found {found:?})")]
    Conflict {
        name: String,
        expected: Option<u64>,
        found: Option<u64>,
    },
    /// A save is in progress, or a crashed one left its lock file behind.
    #[error("wallet record is locked: {}", .0.display())]
    Locked(PathBuf),
}

/// Key-value storage of serialized wallet records, keyed by wallet name.
pub trait WalletStore: Send + Sync {
    fn exists(&self, name: &str) -> Result<bool, StoreError>;
    /// `Ok(None)` when no record exists under `name`.
    fn load(&self, name: &str) -> Result<Option<String>, StoreError>;
    /// Replaces the record atomically, provided the stored one is still at
    /// revision `expected`. `None` means no record may exist yet.
    fn save(&self, name: &str, expected: Option<u64>, contents: &str) -> Result<(), StoreError>;
    fn list(&self) -> Result<Vec<String>, StoreError>;
}

/// One pretty-printed JSON file per wallet under `<datadir>/wallets/`. The
/// record's top-level `revision` field guards against lost updates.
#[derive(Debug, Clone)]
pub struct FileStore {
    wallets_dir: PathBuf,
}

impl FileStore {
    /// Creates `<datadir>/wallets` if missing.
    pub fn open(datadir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let wallets_dir = datadir.as_ref().join("wallets");
        fs::create_dir_all(&wallets_dir)?;
        Ok(Self { wallets_dir })
    }

    pub fn path(&self, name: &str) -> Result<PathBuf, StoreError> {
        validate_name(name)?;
        Ok(self.wallets_dir.join(format!("{name}.json")))
    }
}

/// Exclusive `<name>.json.lock`, removed on drop.
struct LockFile {
    path: PathBuf,
}

impl LockFile {
    fn acquire(path: PathBuf) -> Result<Self, StoreError> {
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => Ok(Self { path }),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Err(StoreError::Locked(path)),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "could not remove lock file");
        }
    }
}

fn stored_revision(name: &str, path: &Path) -> Result<Option<u64>, StoreError> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let value: Value = serde_json::from_str(&contents).map_err(|e| StoreError::Corrupt {
        name: name.to_string(),
        reason: e.to_string(),
    })?;
    Ok(Some(value.get("revision").and_then(Value::as_u64).unwrap_or(0)))
}

fn validate_name(name: &str) -> Result<(), StoreError> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.chars().any(|c| matches!(c, '/' | '\\' | '\0'));
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidName(name.to_string()))
    }
}

impl WalletStore for FileStore {
    fn exists(&self, name: &str) -> Result<bool, StoreError> {
        Ok(self.path(name)?.exists())
    }

    fn load(&self, name: &str) -> Result<Option<String>, StoreError> {
        match fs::read_to_string(self.path(name)?) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, name: &str, expected: Option<u64>, contents: &str) -> Result<(), StoreError> {
        let path = self.path(name)?;
        let _lock = LockFile::acquire(path.with_extension("json.lock"))?;

        let found = stored_revision(name, &path)?;
        if found != expected {
            return Err(StoreError::Conflict {
                name: name.to_string(),
                expected,
                found,
            });
        }

        let tmp = path.with_extension("json.tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(contents.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        // Make the rename itself durable.
        #[cfg(unix)]
        File::open(&self.wallets_dir)?.sync_all()?;

        debug!(path = %path.display(), "saved wallet record");
        Ok(())
    }

    fn list(&self) -> Result<Vec<String>, StoreError> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.wallets_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                names.push(stem.to_string());
            }
        }
        names.sort();
        Ok(names)
    }
}
