use alloy::primitives::Address;
use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

/// Failures of the durable key-value layer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("durable store unavailable: {0}")]
    Unavailable(String),
    #[error("corrupt record under `{key}`: {reason}")]
    Corrupt { key: String, reason: String },
}

/// Key-value persistence scoped to this process/device.
///
/// Values are opaque serialized records. Implementations must be usable from
/// the monitoring task and the CLI at the same time.
pub trait DurableStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    fn remove(&self, key: &str) -> Result<(), StoreError>;
}

/// Build a record key of the form `{namespace}_{owner}[_{suffix}]`.
///
/// Owner addresses are lowercased so checksummed and plain spellings of the
/// same account land on the same record.
pub fn store_key(namespace: &str, owner: &Address, suffix: Option<&str>) -> String {
    let owner = owner.to_string().to_lowercase();
    match suffix {
        Some(suffix) => format!("{namespace}_{owner}_{suffix}"),
        None => format!("{namespace}_{owner}"),
    }
}

/// SQLite-backed durable store
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) the database file and initialize schema
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .context("Failed to create database directory")?;
            }
        }

        let conn = Connection::open(path.as_ref())
            .context("Failed to open database")?;

        let db = Database { conn: Mutex::new(conn) };
        db.initialize_schema()?;

        Ok(db)
    }

    /// Create an in-memory database (useful for testing)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .context("Failed to create in-memory database")?;

        let db = Database { conn: Mutex::new(conn) };
        db.initialize_schema()?;

        Ok(db)
    }

    fn initialize_schema(&self) -> Result<()> {
        let conn = self.lock()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS kv_store (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )",
            [],
        ).context("Failed to create kv_store table")?;

        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Unavailable("database connection lock poisoned".to_string()))
    }

    /// Number of records currently stored
    pub fn record_count(&self) -> Result<i64> {
        let conn = self.lock()?;
        let count = conn.query_row("SELECT COUNT(*) FROM kv_store", [], |row| row.get(0))?;
        Ok(count)
    }
}

impl DurableStore for Database {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT value FROM kv_store WHERE key = ?",
            params![key],
            |row| row.get::<_, String>(0),
        )
        .optional()
        .map_err(|e| StoreError::Unavailable(format!("read `{key}`: {e}")))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let now = chrono::Utc::now().timestamp();
        conn.execute(
            "INSERT INTO kv_store (key, value, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, now],
        )
        .map_err(|e| StoreError::Unavailable(format!("write `{key}`: {e}")))?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM kv_store WHERE key = ?", params![key])
            .map_err(|e| StoreError::Unavailable(format!("remove `{key}`: {e}")))?;
        Ok(())
    }
}

/// Process-local store, lost on exit
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> Result<MutexGuard<'_, HashMap<String, String>>, StoreError> {
        self.records
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
    }
}

impl DurableStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.records()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.records()?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.records()?.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_creates_in_memory() {
        let db = Database::in_memory();
        assert!(db.is_ok());
    }

    #[test]
    fn test_set_get_remove() {
        let db = Database::in_memory().unwrap();

        assert_eq!(db.get("missing").unwrap(), None);

        db.set("alpha", "one").unwrap();
        assert_eq!(db.get("alpha").unwrap(), Some("one".to_string()));

        // Overwrite keeps a single row
        db.set("alpha", "two").unwrap();
        assert_eq!(db.get("alpha").unwrap(), Some("two".to_string()));
        assert_eq!(db.record_count().unwrap(), 1);

        db.remove("alpha").unwrap();
        assert_eq!(db.get("alpha").unwrap(), None);

        // Removing a missing key is not an error
        assert!(db.remove("alpha").is_ok());
    }

    #[test]
    fn test_store_key_layout() {
        let owner: Address = "0x8ba1f109551bD432803012645Ac136ddd64DBA72".parse().unwrap();

        assert_eq!(
            store_key("topup_bot_address", &owner, None),
            "topup_bot_address_0x8ba1f109551bd432803012645ac136ddd64dba72"
        );
        assert_eq!(
            store_key("topup_permission", &owner, Some("usdc")),
            "topup_permission_0x8ba1f109551bd432803012645ac136ddd64dba72_usdc"
        );
    }

    #[test]
    fn test_memory_store_round_trip() {
        let store = MemoryStore::new();
        store.set("k", "v").unwrap();
        assert_eq!(store.get("k").unwrap().as_deref(), Some("v"));
        store.remove("k").unwrap();
        assert!(store.get("k").unwrap().is_none());
    }
}
