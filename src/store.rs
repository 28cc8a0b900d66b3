use std::{
    collections::{BTreeMap, HashMap},
    fmt, fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
};

use anyhow::{Context, Result, anyhow, bail};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::debug;

use crate::profile::ProfileId;

/// Persistent key holding the hostname → profile table.
pub const DOMAIN_MAPPINGS_KEY: &str = "domainMappings";
/// Persistent key holding the path-key → profile table.
pub const URL_MAPPINGS_KEY: &str = "urlMappings";

/// A flat mapping of string keys to profiles, as persisted.
pub type MappingTable = BTreeMap<String, ProfileId>;

/// Minimal get/set persistence collaborator.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write every entry or none of them.
    fn set_many(&self, entries: &[(&str, &str)]) -> Result<()>;

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.set_many(&[(key, value)])
    }
}

/// SQLite-backed key-value store.
pub struct SqliteKeyValueStore {
    path: PathBuf,
    conn: Mutex<Connection>,
}

impl SqliteKeyValueStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Unable to create mapping store directory {}", parent.display())
            })?;
        }

        let mut conn = Connection::open(&path)
            .with_context(|| format!("Unable to open mapping store {}", path.display()))?;
        initialize_schema(&mut conn)?;

        Ok(Self {
            path,
            conn: Mutex::new(conn),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("mapping store connection lock poisoned"))
    }
}

impl KeyValueStore for SqliteKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.lock()?;
        conn.query_row("SELECT value FROM kv WHERE key = ?1", [key], |row| {
            row.get(0)
        })
        .optional()
        .with_context(|| format!("Failed to read {key} from {}", self.path.display()))
    }

    fn set_many(&self, entries: &[(&str, &str)]) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let now = Utc::now();
        for (key, value) in entries {
            tx.execute(
                "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![key, value, now],
            )
            .with_context(|| format!("Failed to write {key} to {}", self.path.display()))?;
        }
        tx.commit()
            .with_context(|| format!("Failed to commit mapping store {}", self.path.display()))?;
        Ok(())
    }
}

fn initialize_schema(conn: &mut Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS kv (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        "#,
    )?;
    Ok(())
}

/// Process-local store, used for tests and throwaway sessions.
#[derive(Default)]
pub struct MemoryKeyValueStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let values = self
            .values
            .lock()
            .map_err(|_| anyhow!("memory store lock poisoned"))?;
        Ok(values.get(key).cloned())
    }

    fn set_many(&self, entries: &[(&str, &str)]) -> Result<()> {
        let mut values = self
            .values
            .lock()
            .map_err(|_| anyhow!("memory store lock poisoned"))?;
        for (key, value) in entries {
            values.insert((*key).to_string(), (*value).to_string());
        }
        Ok(())
    }
}

/// Which table a remembered choice belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MappingKind {
    Domain,
    Url,
}

impl MappingKind {
    fn storage_key(self) -> &'static str {
        match self {
            MappingKind::Domain => DOMAIN_MAPPINGS_KEY,
            MappingKind::Url => URL_MAPPINGS_KEY,
        }
    }
}

impl fmt::Display for MappingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            MappingKind::Domain => "domain",
            MappingKind::Url => "url",
        })
    }
}

/// One remembered rule, tagged with its table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MappingEntry {
    pub kind: MappingKind,
    pub key: String,
    pub profile: ProfileId,
}

/// The two remembered-choice tables on top of a [`KeyValueStore`].
///
/// Every mutation publishes the combined entry count on a watch channel so a
/// badge can follow it.
pub struct MappingStore {
    kv: Arc<dyn KeyValueStore>,
    write_lock: Mutex<()>,
    badge: watch::Sender<usize>,
}

impl MappingStore {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Result<Self> {
        let (badge, _) = watch::channel(0);
        let store = Self {
            kv,
            write_lock: Mutex::new(()),
            badge,
        };
        store.refresh_badge()?;
        Ok(store)
    }

    pub fn open_sqlite<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::new(Arc::new(SqliteKeyValueStore::open(path)?))
    }

    pub fn in_memory() -> Result<Self> {
        Self::new(Arc::new(MemoryKeyValueStore::new()))
    }

    pub fn domain_mappings(&self) -> Result<MappingTable> {
        self.table(MappingKind::Domain)
    }

    pub fn set_domain_mapping(&self, domain: &str, profile: &ProfileId) -> Result<()> {
        self.upsert(MappingKind::Domain, domain, profile)
    }

    pub fn remove_domain_mapping(&self, domain: &str) -> Result<bool> {
        self.remove(MappingKind::Domain, domain)
    }

    pub fn url_mappings(&self) -> Result<MappingTable> {
        self.table(MappingKind::Url)
    }

    pub fn set_url_mapping(&self, path_key: &str, profile: &ProfileId) -> Result<()> {
        self.upsert(MappingKind::Url, path_key, profile)
    }

    pub fn remove_url_mapping(&self, path_key: &str) -> Result<bool> {
        self.remove(MappingKind::Url, path_key)
    }

    pub fn set_mapping(&self, kind: MappingKind, key: &str, profile: &ProfileId) -> Result<()> {
        self.upsert(kind, key, profile)
    }

    pub fn remove_mapping(&self, kind: MappingKind, key: &str) -> Result<bool> {
        self.remove(kind, key)
    }

    /// Empty both tables in a single write.
    pub fn clear_all(&self) -> Result<()> {
        let _guard = self.write_guard()?;
        let empty = serde_json::to_string(&MappingTable::new())?;
        self.kv.set_many(&[
            (DOMAIN_MAPPINGS_KEY, empty.as_str()),
            (URL_MAPPINGS_KEY, empty.as_str()),
        ])?;
        self.refresh_badge()?;
        Ok(())
    }

    pub fn mapping_count(&self) -> Result<usize> {
        Ok(self.domain_mappings()?.len() + self.url_mappings()?.len())
    }

    /// Both tables merged and sorted by key.
    pub fn entries(&self) -> Result<Vec<MappingEntry>> {
        let mut entries: Vec<MappingEntry> = Vec::new();
        for kind in [MappingKind::Domain, MappingKind::Url] {
            entries.extend(self.table(kind)?.into_iter().map(|(key, profile)| {
                MappingEntry { kind, key, profile }
            }));
        }
        entries.sort_by(|a, b| a.key.cmp(&b.key).then(a.kind.cmp(&b.kind)));
        Ok(entries)
    }

    /// Receive the mapping count after every change.
    pub fn subscribe_badge(&self) -> watch::Receiver<usize> {
        self.badge.subscribe()
    }

    pub fn badge_count(&self) -> usize {
        *self.badge.borrow()
    }

    fn table(&self, kind: MappingKind) -> Result<MappingTable> {
        let key = kind.storage_key();
        match self.kv.get(key)? {
            Some(raw) => serde_json::from_str(&raw)
                .with_context(|| format!("Malformed {key} table in mapping store")),
            None => Ok(MappingTable::new()),
        }
    }

    fn write_table(&self, kind: MappingKind, table: &MappingTable) -> Result<()> {
        let serialised = serde_json::to_string(table)?;
        self.kv.set(kind.storage_key(), &serialised)
    }

    fn upsert(&self, kind: MappingKind, key: &str, profile: &ProfileId) -> Result<()> {
        if key.trim().is_empty() {
            bail!("refusing to remember an empty {kind} key");
        }
        if profile.as_str().trim().is_empty() {
            bail!("refusing to remember {kind} mapping for {key} without a profile");
        }

        let _guard = self.write_guard()?;
        let mut table = self.table(kind)?;
        table.insert(key.to_string(), profile.clone());
        self.write_table(kind, &table)?;
        debug!(%kind, key, profile = %profile, "saved mapping");
        self.refresh_badge()?;
        Ok(())
    }

    fn remove(&self, kind: MappingKind, key: &str) -> Result<bool> {
        let _guard = self.write_guard()?;
        let mut table = self.table(kind)?;
        let removed = table.remove(key).is_some();
        if removed {
            self.write_table(kind, &table)?;
            debug!(%kind, key, "removed mapping");
        }
        self.refresh_badge()?;
        Ok(removed)
    }

    fn write_guard(&self) -> Result<MutexGuard<'_, ()>> {
        self.write_lock
            .lock()
            .map_err(|_| anyhow!("mapping store write lock poisoned"))
    }

    fn refresh_badge(&self) -> Result<()> {
        let count = self.mapping_count()?;
        self.badge.send_replace(count);
        Ok(())
    }
}
