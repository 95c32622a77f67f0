//! Token Store: `account -> {device_key -> DeviceRecord}` persistence used
//! by the account-fanout path (spec.md §4.5).
//!
//! Two backends share the `TokenStore` trait, selected once at startup by
//! `main.rs` depending on whether cluster contact points are configured
//! (DESIGN NOTES §9): `FileStore` (single-process, spool file) and
//! `ColumnStore` (Cassandra-family, behind the `cassandra` feature).

use crate::models::DeviceRecord;
use async_trait::async_trait;
use dashmap::DashMap;
use indexmap::IndexMap;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait TokenStore: Send + Sync {
    /// All device records registered for `account`. Empty map, not an
    /// error, when the account is unknown.
    async fn get(&self, account: &str) -> Result<IndexMap<String, DeviceRecord>, StoreError>;

    /// Upsert a device record. APNs tokens containing the `#` delimiter
    /// (DESIGN.md's Open Question resolution) are split into
    /// `(token, background_token)` before storage.
    async fn add(&self, account: &str, record: DeviceRecord) -> Result<(), StoreError>;

    /// Remove every device registered for `account`.
    async fn remove_account(&self, account: &str) -> Result<(), StoreError>;

    /// Remove one device. Idempotent: removing an absent device is not an
    /// error (spec.md §8's idempotence invariant is enforced by the
    /// dispatcher, which maps "not present" to 404 before calling this).
    async fn remove_device(&self, account: &str, app_id: &str, device_id: &str) -> Result<(), StoreError>;
}

fn upsert_record(mut record: DeviceRecord) -> DeviceRecord {
    let (token, background_token) = DeviceRecord::split_token(&record.token);
    record.token = token;
    record.background_token = background_token;
    record
}

// =============================================================================
// FileStore
// =============================================================================

/// Single-process file-backed store: load-on-start, rewrite-on-mutation,
/// grounded in the teacher's `Store` (`DashMap`-keyed, `Arc`-shared) for
/// concurrency shape and `pushserver/resources/storage/storage.py`'s
/// `FileStorage` for exact add/remove semantics.
pub struct FileStore {
    accounts: DashMap<String, IndexMap<String, DeviceRecord>>,
    spool_path: PathBuf,
    save_lock: Mutex<()>,
}

impl FileStore {
    pub fn load(spool_path: PathBuf) -> Self {
        let accounts = match std::fs::read(&spool_path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
            Err(_) => DashMap::new(),
        };
        Self { accounts, spool_path, save_lock: Mutex::new(()) }
    }

    async fn save(&self) -> Result<(), StoreError> {
        let _guard = self.save_lock.lock().await;
        let snapshot: HashMap<String, IndexMap<String, DeviceRecord>> =
            self.accounts.iter().map(|e| (e.key().clone(), e.value().clone())).collect();
        let bytes = serde_json::to_vec(&snapshot).map_err(|e| StoreError::Backend(e.to_string()))?;
        if let Some(parent) = self.spool_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| StoreError::Backend(e.to_string()))?;
        }
        tokio::fs::write(&self.spool_path, bytes).await.map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl TokenStore for FileStore {
    async fn get(&self, account: &str) -> Result<IndexMap<String, DeviceRecord>, StoreError> {
        Ok(self.accounts.get(account).map(|e| e.value().clone()).unwrap_or_default())
    }

    async fn add(&self, account: &str, record: DeviceRecord) -> Result<(), StoreError> {
        let record = upsert_record(record);
        let key = DeviceRecord::key(&record.app_id, &record.device_id);
        self.accounts.entry(account.to_string()).or_default().insert(key, record);
        self.save().await
    }

    async fn remove_account(&self, account: &str) -> Result<(), StoreError> {
        self.accounts.remove(account);
        self.save().await
    }

    async fn remove_device(&self, account: &str, app_id: &str, device_id: &str) -> Result<(), StoreError> {
        let key = DeviceRecord::key(app_id, device_id);
        if let Some(mut devices) = self.accounts.get_mut(account) {
            devices.remove(&key);
        }
        self.save().await
    }
}

// =============================================================================
// ColumnStore (Cassandra-family)
// =============================================================================

/// Cassandra-family column-store backend. Partitioned by `(username,
/// domain)` derived from `account = "user@domain"`, clustered by
/// `(device_id, app_id)`, with a companion `OpenSips`-style presence row
/// (spec.md §4.5): set on first add for an account, deleted when the last
/// device is removed. Grounded in
/// `pushserver/resources/storage/storage.py::CassandraStorage`.
#[cfg(feature = "cassandra")]
pub struct ColumnStore {
    session: scylla::Session,
    keyspace: String,
}

#[cfg(feature = "cassandra")]
impl ColumnStore {
    pub async fn connect(contact_points: &[String], keyspace: &str) -> Result<Self, StoreError> {
        let session = scylla::SessionBuilder::new()
            .known_nodes(contact_points)
            .build()
            .await
            .map_err(|e| StoreError::Backend(format!("cannot connect to cassandra contact points: {e}")))?;
        Ok(Self { session, keyspace: keyspace.to_string() })
    }

    fn split_account(account: &str) -> Result<(String, String), StoreError> {
        account
            .split_once('@')
            .map(|(u, d)| (u.to_string(), d.to_string()))
            .ok_or_else(|| StoreError::Backend(format!("'{account}' is not a valid user@domain account")))
    }
}

#[cfg(feature = "cassandra")]
#[async_trait]
impl TokenStore for ColumnStore {
    async fn get(&self, account: &str) -> Result<IndexMap<String, DeviceRecord>, StoreError> {
        let (username, domain) = Self::split_account(account)?;
        let query = format!(
            "SELECT device_id, app_id, platform, device_token, background_token, silent, user_agent \
             FROM {}.push_tokens WHERE username = ? AND domain = ?",
            self.keyspace
        );
        let rows = self
            .session
            .query(query, (username, domain))
            .await
            .map_err(|e| StoreError::Backend(format!("get token(s) failed: {e}")))?;

        let mut out = IndexMap::new();
        if let Some(rows) = rows.rows {
            for row in rows {
                let (device_id, app_id, platform, token, background_token, silent, user_agent): (
                    String,
                    String,
                    String,
                    String,
                    Option<String>,
                    bool,
                    Option<String>,
                ) = row.into_typed().map_err(|e| StoreError::Backend(e.to_string()))?;
                let key = DeviceRecord::key(&app_id, &device_id);
                out.insert(key, DeviceRecord { device_id, app_id, platform, token, background_token, silent, user_agent });
            }
        }
        Ok(out)
    }

    async fn add(&self, account: &str, record: DeviceRecord) -> Result<(), StoreError> {
        let (username, domain) = Self::split_account(account)?;
        let record = upsert_record(record);

        let insert = format!(
            "INSERT INTO {}.push_tokens (username, domain, device_id, app_id, platform, device_token, background_token, silent, user_agent) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            self.keyspace
        );
        self.session
            .query(
                insert,
                (
                    username.clone(),
                    domain.clone(),
                    record.device_id.clone(),
                    record.app_id.clone(),
                    record.platform.clone(),
                    record.token.clone(),
                    record.background_token.clone(),
                    record.silent,
                    record.user_agent.clone(),
                ),
            )
            .await
            .map_err(|e| StoreError::Backend(format!("storing token failed: {e}")))?;

        let presence = format!("INSERT INTO {}.open_sips (opensipskey, opensipsval) VALUES (?, '1')", self.keyspace);
        self.session
            .query(presence, (account.to_string(),))
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn remove_account(&self, account: &str) -> Result<(), StoreError> {
        let (username, domain) = Self::split_account(account)?;
        let query = format!("DELETE FROM {}.push_tokens WHERE username = ? AND domain = ?", self.keyspace);
        self.session
            .query(query, (username, domain))
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let presence = format!("DELETE FROM {}.open_sips WHERE opensipskey = ?", self.keyspace);
        self.session
            .query(presence, (account.to_string(),))
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn remove_device(&self, account: &str, app_id: &str, device_id: &str) -> Result<(), StoreError> {
        let (username, domain) = Self::split_account(account)?;
        let query = format!(
            "DELETE FROM {}.push_tokens WHERE username = ? AND domain = ? AND device_id = ? AND app_id = ?",
            self.keyspace
        );
        self.session
            .query(query, (username, domain, device_id.to_string(), app_id.to_string()))
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        if self.get(account).await?.is_empty() {
            let presence = format!("DELETE FROM {}.open_sips WHERE opensipskey = ?", self.keyspace);
            self.session
                .query(presence, (account.to_string(),))
                .await
                .map_err(|e| StoreError::Backend(e.to_string()))?;
        }
        Ok(())
    }
}

#[cfg(not(feature = "cassandra"))]
pub struct ColumnStore;

#[cfg(not(feature = "cassandra"))]
impl ColumnStore {
    pub async fn connect(_contact_points: &[String], _keyspace: &str) -> Result<Self, StoreError> {
        Err(StoreError::Backend(
            "cassandra contact points configured but this binary was built without the 'cassandra' feature".to_string(),
        ))
    }
}

#[cfg(not(feature = "cassandra"))]
#[async_trait]
impl TokenStore for ColumnStore {
    async fn get(&self, _account: &str) -> Result<IndexMap<String, DeviceRecord>, StoreError> {
        unreachable!("ColumnStore::connect always fails without the cassandra feature")
    }
    async fn add(&self, _account: &str, _record: DeviceRecord) -> Result<(), StoreError> {
        unreachable!("ColumnStore::connect always fails without the cassandra feature")
    }
    async fn remove_account(&self, _account: &str) -> Result<(), StoreError> {
        unreachable!("ColumnStore::connect always fails without the cassandra feature")
    }
    async fn remove_device(&self, _account: &str, _app_id: &str, _device_id: &str) -> Result<(), StoreError> {
        unreachable!("ColumnStore::connect always fails without the cassandra feature")
    }
}

/// Pick a backend at startup: cassandra contact points present -> column
/// store, otherwise the single-process file store (DESIGN NOTES §9).
pub async fn open(contact_points: &[String], keyspace: &str, spool_path: PathBuf) -> Arc<dyn TokenStore> {
    if !contact_points.is_empty() {
        match ColumnStore::connect(contact_points, keyspace).await {
            Ok(store) => {
                debug!("using cassandra for token storage");
                return Arc::new(store);
            }
            Err(e) => warn!(error = %e, "falling back to file store"),
        }
    }
    debug!(path = %spool_path.display(), "using file for token storage");
    Arc::new(FileStore::load(spool_path))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(app_id: &str, device_id: &str, token: &str) -> DeviceRecord {
        DeviceRecord {
            device_id: device_id.to_string(),
            app_id: app_id.to_string(),
            platform: "apple".to_string(),
            token: token.to_string(),
            background_token: None,
            silent: true,
            user_agent: None,
        }
    }

    #[tokio::test]
    async fn add_splits_token_on_hash_delimiter() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::load(dir.path().join("spool"));
        store.add("alice@example.com", device("app1", "dev1", "aaaa#bbbb")).await.unwrap();

        let devices = store.get("alice@example.com").await.unwrap();
        let record = devices.get(&DeviceRecord::key("app1", "dev1")).unwrap();
        assert_eq!(record.token, "aaaa");
        assert_eq!(record.background_token.as_deref(), Some("bbbb"));
    }

    #[tokio::test]
    async fn get_unknown_account_returns_empty_map() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::load(dir.path().join("spool"));
        assert!(store.get("nobody@example.com").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn remove_device_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::load(dir.path().join("spool"));
        store.add("alice@example.com", device("app1", "dev1", "tok")).await.unwrap();
        store.remove_device("alice@example.com", "app1", "dev1").await.unwrap();
        assert!(store.remove_device("alice@example.com", "app1", "dev1").await.is_ok());
        assert!(store.get("alice@example.com").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn data_survives_reload_from_spool_file() {
        let dir = tempfile::tempdir().unwrap();
        let spool = dir.path().join("spool");
        {
            let store = FileStore::load(spool.clone());
            store.add("alice@example.com", device("app1", "dev1", "tok")).await.unwrap();
        }
        let reloaded = FileStore::load(spool);
        assert_eq!(reloaded.get("alice@example.com").await.unwrap().len(), 1);
    }
}
