//! Persistent key-value storage
//!
//! The core only needs get/set/delete over a handful of well-known keys;
//! everything else about persistence is a backend concern. Two backends:
//! [`RedbStorage`] for real deployments and [`MemoryStorage`] for tests and
//! ephemeral runs.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use redb::{Database, TableDefinition};

use crate::error::P2pResult;

const KV_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("pairlink_kv");

/// The closed set of storage keys the core owns.
///
/// Each key has exactly one owning subsystem, so read-modify-write cycles on
/// different keys never race.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageKey {
    /// Chat state preserved across restarts: JSON of `{syncToken, rooms}`
    PreservedState,
    /// Routing cache: JSON map of recipient address to room id
    PeerRoomIds,
    /// Pre-provisioned empty room held by wallet-role peers
    StandbyRoom,
}

impl StorageKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageKey::PreservedState => "preserved-state",
            StorageKey::PeerRoomIds => "peer-room-ids",
            StorageKey::StandbyRoom => "standby-room",
        }
    }
}

impl std::fmt::Display for StorageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Abstract persistent storage.
pub trait Storage: Send + Sync {
    fn get(&self, key: StorageKey) -> P2pResult<Option<String>>;
    fn set(&self, key: StorageKey, value: &str) -> P2pResult<()>;
    fn delete(&self, key: StorageKey) -> P2pResult<()>;
}

/// redb-backed storage with a single string-keyed table.
#[derive(Clone)]
pub struct RedbStorage {
    db: Arc<RwLock<Database>>,
}

impl RedbStorage {
    /// Open (or create) the database at `path` and ensure the table exists.
    pub fn new(path: impl AsRef<Path>) -> P2pResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path)?;
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(KV_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self {
            db: Arc::new(RwLock::new(db)),
        })
    }
}

impl Storage for RedbStorage {
    fn get(&self, key: StorageKey) -> P2pResult<Option<String>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(KV_TABLE)?;
        match table.get(key.as_str())? {
            Some(v) => Ok(Some(String::from_utf8_lossy(v.value()).into_owned())),
            None => Ok(None),
        }
    }

    fn set(&self, key: StorageKey, value: &str) -> P2pResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(KV_TABLE)?;
            table.insert(key.as_str(), value.as_bytes())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn delete(&self, key: StorageKey) -> P2pResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(KV_TABLE)?;
            table.remove(key.as_str())?;
        }
        write_txn.commit()?;
        Ok(())
    }
}

/// In-memory storage for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<&'static str, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: StorageKey) -> P2pResult<Option<String>> {
        Ok(self.entries.lock().get(key.as_str()).cloned())
    }

    fn set(&self, key: StorageKey, value: &str) -> P2pResult<()> {
        self.entries.lock().insert(key.as_str(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: StorageKey) -> P2pResult<()> {
        self.entries.lock().remove(key.as_str());
        Ok(())
    }
}
