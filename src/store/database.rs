//! Versioned embedded database shared by the durable stores.

use crate::error::{Error, Result};
use fs2::FileExt;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Magic bytes for the database manifest.
const MANIFEST_MAGIC: &[u8; 4] = b"WFT\0";

/// Manifest file name.
const MANIFEST_FILE: &str = "MANIFEST";

/// Lock file name.
const LOCK_FILE: &str = "store.lock";

/// Current schema version. Bump when adding stores (additive) or dropping
/// deprecated ones; never reuse a retired store name.
pub const SCHEMA_VERSION: u32 = 3;

struct StoreDef {
    name: &'static str,
    since: u32,
}

struct DeprecatedDef {
    name: &'static str,
    dropped_in: u32,
}

/// Logical stores by the schema version that introduced them. Store files
/// are created lazily on first write; this table is the registry.
const STORES: &[StoreDef] = &[
    StoreDef {
        name: "events",
        since: 1,
    },
    StoreDef {
        name: "profiles",
        since: 1,
    },
    StoreDef {
        name: "relay-lists",
        since: 1,
    },
    StoreDef {
        name: "contacts",
        since: 2,
    },
];

/// Stores that existed in earlier schema versions and are deleted on
/// upgrade past `dropped_in`.
const DEPRECATED: &[DeprecatedDef] = &[DeprecatedDef {
    name: "mute-lists",
    dropped_in: 3,
}];

/// Database configuration.
#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    /// Base directory for the database.
    pub path: PathBuf,

    /// Whether to create the database if it doesn't exist.
    pub create_if_missing: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./weft-db"),
            create_if_missing: true,
        }
    }
}

/// The shared embedded engine: one directory, one manifest, one process
/// lock, one append-only file per logical store.
///
/// Opening migrates the schema forward: missing stores appear lazily (the
/// registry is additive) and deprecated store files are removed. A manifest
/// written by a newer build refuses to open.
pub struct Database {
    root: PathBuf,
    version: u32,
    _lock_file: File,
}

impl Database {
    /// Open an existing database or create a new one.
    pub fn open(config: DatabaseConfig) -> Result<Self> {
        if !config.path.exists() {
            if !config.create_if_missing {
                return Err(Error::NotInitialized);
            }
            fs::create_dir_all(&config.path)?;
        }

        let lock_file = Self::acquire_lock(&config.path)?;

        match Self::read_manifest(&config.path)? {
            None => {
                Self::write_manifest(&config.path, SCHEMA_VERSION)?;
            }
            Some(on_disk) if on_disk > SCHEMA_VERSION => {
                return Err(Error::InvalidFormat(format!(
                    "database schema {} is newer than supported {}",
                    on_disk, SCHEMA_VERSION
                )));
            }
            Some(on_disk) if on_disk < SCHEMA_VERSION => {
                Self::migrate(&config.path, on_disk)?;
                Self::write_manifest(&config.path, SCHEMA_VERSION)?;
            }
            Some(_) => {}
        }

        Ok(Self {
            root: config.path,
            version: SCHEMA_VERSION,
            _lock_file: lock_file,
        })
    }

    /// Schema version this handle is running at.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Opens the file backing a registered logical store.
    pub(crate) fn open_store(&self, name: &str) -> Result<StoreFile> {
        if !STORES.iter().any(|s| s.name == name && s.since <= self.version) {
            return Err(Error::InvalidFormat(format!(
                "unknown logical store: {name}"
            )));
        }
        StoreFile::open(self.root.join(format!("{name}.store")))
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;
        lock_file.try_lock_exclusive().map_err(|_| Error::Locked)?;
        Ok(lock_file)
    }

    fn write_manifest(path: &Path, version: u32) -> Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.join(MANIFEST_FILE))?;
        file.write_all(MANIFEST_MAGIC)?;
        file.write_all(&version.to_le_bytes())?;
        file.sync_all()?;
        Ok(())
    }

    fn read_manifest(path: &Path) -> Result<Option<u32>> {
        let manifest = path.join(MANIFEST_FILE);
        if !manifest.exists() {
            return Ok(None);
        }
        let mut file = File::open(manifest)?;
        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != MANIFEST_MAGIC {
            return Err(Error::InvalidFormat("invalid manifest magic".into()));
        }
        let mut version_bytes = [0u8; 4];
        file.read_exact(&mut version_bytes)?;
        Ok(Some(u32::from_le_bytes(version_bytes)))
    }

    /// Forward migration from `from`: deprecated stores dropped after `from`
    /// have their files deleted. New stores need no work here; their files
    /// appear on first write.
    fn migrate(path: &Path, from: u32) -> Result<()> {
        info!(from, to = SCHEMA_VERSION, "migrating database schema");
        for deprecated in DEPRECATED {
            if deprecated.dropped_in > from {
                let file = path.join(format!("{}.store", deprecated.name));
                if file.exists() {
                    fs::remove_file(&file)?;
                    info!(store = deprecated.name, "dropped deprecated store");
                }
            }
        }
        Ok(())
    }
}

fn read_u32(buf: &[u8], pos: usize) -> u32 {
    u32::from_le_bytes([buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]])
}

/// One append-only store file: framed entries `len | payload | crc32`.
pub(crate) struct StoreFile {
    path: PathBuf,
    file: Mutex<File>,
}

impl StoreFile {
    fn open(path: PathBuf) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// Appends one framed entry and syncs.
    pub fn append<T: Serialize>(&self, value: &T) -> Result<()> {
        let payload = rmp_serde::to_vec(value)?;
        let checksum = crc32fast::hash(&payload);
        let mut file = self.file.lock();
        file.seek(SeekFrom::End(0))?;
        file.write_all(&(payload.len() as u32).to_le_bytes())?;
        file.write_all(&payload)?;
        file.write_all(&checksum.to_le_bytes())?;
        file.sync_data()?;
        Ok(())
    }

    /// Replays every entry from the start.
    ///
    /// A torn final frame (crash mid-append) is truncated away with a
    /// warning; a checksum mismatch on a complete frame is corruption and
    /// fails the open.
    pub fn replay<T: DeserializeOwned>(&self) -> Result<Vec<T>> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(0))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;

        let mut entries = Vec::new();
        let mut pos = 0usize;
        while pos + 4 <= buf.len() {
            let len = read_u32(&buf, pos) as usize;
            if pos + 4 + len + 4 > buf.len() {
                break;
            }
            let payload = &buf[pos + 4..pos + 4 + len];
            let stored = read_u32(&buf, pos + 4 + len);
            let computed = crc32fast::hash(payload);
            if stored != computed {
                return Err(Error::ChecksumMismatch {
                    expected: stored,
                    got: computed,
                });
            }
            entries.push(rmp_serde::from_slice(payload)?);
            pos += 8 + len;
        }

        if pos < buf.len() {
            warn!(
                path = %self.path.display(),
                dropped = buf.len() - pos,
                "truncating torn tail of store file"
            );
            file.set_len(pos as u64)?;
        }
        Ok(entries)
    }

    /// Replaces the whole file with the given entries (compaction).
    pub fn rewrite<T: Serialize>(&self, values: &[T]) -> Result<()> {
        let mut file = self.file.lock();
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        for value in values {
            let payload = rmp_serde::to_vec(value)?;
            let checksum = crc32fast::hash(&payload);
            file.write_all(&(payload.len() as u32).to_le_bytes())?;
            file.write_all(&payload)?;
            file.write_all(&checksum.to_le_bytes())?;
        }
        file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> DatabaseConfig {
        DatabaseConfig {
            path: dir.path().join("db"),
            create_if_missing: true,
        }
    }

    #[test]
    fn test_create_and_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let db = Database::open(config(&dir)).unwrap();
            assert_eq!(db.version(), SCHEMA_VERSION);
        }
        let db = Database::open(config(&dir)).unwrap();
        assert_eq!(db.version(), SCHEMA_VERSION);
    }

    #[test]
    fn test_missing_without_create_flag() {
        let dir = TempDir::new().unwrap();
        let result = Database::open(DatabaseConfig {
            path: dir.path().join("db"),
            create_if_missing: false,
        });
        assert!(matches!(result, Err(Error::NotInitialized)));
    }

    #[test]
    fn test_second_open_is_locked() {
        let dir = TempDir::new().unwrap();
        let _db = Database::open(config(&dir)).unwrap();
        let result = Database::open(config(&dir));
        assert!(matches!(result, Err(Error::Locked)));
    }

    #[test]
    fn test_newer_schema_refuses_to_open() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db");
        fs::create_dir_all(&path).unwrap();
        Database::write_manifest(&path, SCHEMA_VERSION + 1).unwrap();

        let result = Database::open(config(&dir));
        assert!(matches!(result, Err(Error::InvalidFormat(_))));
    }

    #[test]
    fn test_upgrade_drops_deprecated_store() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db");
        fs::create_dir_all(&path).unwrap();
        Database::write_manifest(&path, 2).unwrap();
        fs::write(path.join("mute-lists.store"), b"legacy").unwrap();

        let db = Database::open(config(&dir)).unwrap();
        assert_eq!(db.version(), SCHEMA_VERSION);
        assert!(!path.join("mute-lists.store").exists());
        // Manifest was advanced on disk.
        assert_eq!(
            Database::read_manifest(&path).unwrap(),
            Some(SCHEMA_VERSION)
        );
    }

    #[test]
    fn test_unknown_store_name_rejected() {
        let dir = TempDir::new().unwrap();
        let db = Database::open(config(&dir)).unwrap();
        assert!(db.open_store("mute-lists").is_err());
        assert!(db.open_store("events").is_ok());
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Entry {
        name: String,
        value: u64,
    }

    #[test]
    fn test_store_file_append_replay() {
        let dir = TempDir::new().unwrap();
        let file = StoreFile::open(dir.path().join("t.store")).unwrap();

        for i in 0..5u64 {
            file.append(&Entry {
                name: format!("e{i}"),
                value: i,
            })
            .unwrap();
        }
        let entries: Vec<Entry> = file.replay().unwrap();
        assert_eq!(entries.len(), 5);
        assert_eq!(entries[4].value, 4);
    }

    #[test]
    fn test_store_file_torn_tail_truncated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.store");
        {
            let file = StoreFile::open(path.clone()).unwrap();
            file.append(&Entry {
                name: "good".into(),
                value: 1,
            })
            .unwrap();
        }
        // Simulate a crash mid-append.
        let mut raw = OpenOptions::new().append(true).open(&path).unwrap();
        raw.write_all(&[9, 0, 0, 0, 1, 2]).unwrap();
        drop(raw);

        let file = StoreFile::open(path.clone()).unwrap();
        let entries: Vec<Entry> = file.replay().unwrap();
        assert_eq!(entries.len(), 1);

        // The tail was removed; a fresh append replays cleanly.
        file.append(&Entry {
            name: "next".into(),
            value: 2,
        })
        .unwrap();
        let entries: Vec<Entry> = file.replay().unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn test_store_file_corrupt_frame_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.store");
        {
            let file = StoreFile::open(path.clone()).unwrap();
            file.append(&Entry {
                name: "good".into(),
                value: 1,
            })
            .unwrap();
            file.append(&Entry {
                name: "also-good".into(),
                value: 2,
            })
            .unwrap();
        }
        // Flip a payload byte in the first frame.
        let mut bytes = fs::read(&path).unwrap();
        bytes[6] ^= 0xff;
        fs::write(&path, bytes).unwrap();

        let file = StoreFile::open(path).unwrap();
        let result: Result<Vec<Entry>> = file.replay();
        assert!(matches!(result, Err(Error::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_store_file_rewrite() {
        let dir = TempDir::new().unwrap();
        let file = StoreFile::open(dir.path().join("t.store")).unwrap();
        for i in 0..10u64 {
            file.append(&Entry {
                name: format!("e{i}"),
                value: i,
            })
            .unwrap();
        }
        file.rewrite(&[Entry {
            name: "only".into(),
            value: 99,
        }])
        .unwrap();

        let entries: Vec<Entry> = file.replay().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].value, 99);
    }
}
