use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::{
        Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::Context as _;
use async_trait::async_trait;
use rusqlite::{Connection, OpenFlags, params};

use crate::{
    error::RelayError,
    store::{StoreSnapshot, StoredMessage},
};

const SCHEMA_VERSION: i32 = 1;

/// Durable flat key/value map: tab URL to that tab's message list.
///
/// The coordinator mirrors every in-memory mutation here and reads the whole
/// map back once at startup.
#[async_trait]
pub trait DurableStorage: Send + Sync {
    async fn load_all(&self) -> Result<StoreSnapshot, RelayError>;

    /// Replaces the stored list for `tab_url`.
    async fn put(&self, tab_url: &str, messages: Vec<StoredMessage>) -> Result<(), RelayError>;

    async fn remove(&self, tab_url: &str) -> Result<(), RelayError>;

    /// Wipes every key.
    async fn clear(&self) -> Result<(), RelayError>;
}

#[derive(Debug, Clone)]
pub struct SqliteStorage {
    db_path: PathBuf,
}

impl SqliteStorage {
    pub fn open(db_path: PathBuf) -> anyhow::Result<Self> {
        if let Some(parent) = db_path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("create storage dir {}", parent.display()))?;
        }

        let storage = Self { db_path };
        let mut conn = open_connection(&storage.db_path)?;
        migrate(&mut conn)?;
        Ok(storage)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    async fn run_blocking<T, F>(&self, op: &'static str, f: F) -> Result<T, RelayError>
    where
        T: Send + 'static,
        F: FnOnce(&Path) -> anyhow::Result<T> + Send + 'static,
    {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || f(&db_path))
            .await
            .with_context(|| format!("join {op} task"))
            .and_then(|result| result)
            .map_err(RelayError::persistence)
    }
}

#[async_trait]
impl DurableStorage for SqliteStorage {
    async fn load_all(&self) -> Result<StoreSnapshot, RelayError> {
        self.run_blocking("load_all", load_all_blocking).await
    }

    async fn put(&self, tab_url: &str, messages: Vec<StoredMessage>) -> Result<(), RelayError> {
        let tab_url = tab_url.to_owned();
        self.run_blocking("put", move |path| put_blocking(path, &tab_url, &messages))
            .await
    }

    async fn remove(&self, tab_url: &str) -> Result<(), RelayError> {
        let tab_url = tab_url.to_owned();
        self.run_blocking("remove", move |path| remove_blocking(path, &tab_url))
            .await
    }

    async fn clear(&self) -> Result<(), RelayError> {
        self.run_blocking("clear", clear_blocking).await
    }
}

fn open_connection(path: &Path) -> anyhow::Result<Connection> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_URI
        | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let conn = Connection::open_with_flags(path, flags)
        .with_context(|| format!("open sqlite {}", path.display()))?;

    conn.pragma_update(None, "journal_mode", "WAL")
        .context("set PRAGMA journal_mode=WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")
        .context("set PRAGMA synchronous=NORMAL")?;
    conn.busy_timeout(std::time::Duration::from_secs(5))
        .context("set sqlite busy_timeout")?;

    Ok(conn)
}

fn migrate(conn: &mut Connection) -> anyhow::Result<()> {
    let user_version: i32 = conn
        .query_row("PRAGMA user_version;", [], |row| row.get(0))
        .context("read PRAGMA user_version")?;

    match user_version {
        0 => {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS tab_messages (
                  tab_url TEXT PRIMARY KEY NOT NULL,
                  messages_json TEXT NOT NULL,
                  updated_at_unix_ms INTEGER NOT NULL
                );
                "#,
            )
            .context("create sqlite schema v1")?;

            conn.pragma_update(None, "user_version", SCHEMA_VERSION)
                .context("set PRAGMA user_version=1")?;
            Ok(())
        }
        SCHEMA_VERSION => Ok(()),
        _ => anyhow::bail!(
            "unsupported messages db schema version {user_version} (expected {SCHEMA_VERSION})"
        ),
    }
}

fn now_unix_ms() -> anyhow::Result<i64> {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system time before unix epoch")?;
    Ok(i64::try_from(duration.as_millis()).unwrap_or(i64::MAX))
}

fn load_all_blocking(path: &Path) -> anyhow::Result<StoreSnapshot> {
    let conn = open_connection(path)?;
    let mut stmt = conn
        .prepare("SELECT tab_url, messages_json FROM tab_messages")
        .context("prepare load tab messages")?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
        .context("query tab messages")?;

    // A row that does not decode is skipped; the other tabs still load.
    let mut snapshot = BTreeMap::new();
    for row in rows {
        let (tab_url, messages_json) = row.context("read tab messages row")?;
        match serde_json::from_str::<Vec<StoredMessage>>(&messages_json) {
            Ok(messages) => {
                snapshot.insert(tab_url, messages);
            }
            Err(err) => {
                tracing::warn!(tab_url = %tab_url, error = %err, "skipping undecodable messages row");
            }
        }
    }
    Ok(snapshot)
}

fn put_blocking(path: &Path, tab_url: &str, messages: &[StoredMessage]) -> anyhow::Result<()> {
    let conn = open_connection(path)?;
    let messages_json = serde_json::to_string(messages)
        .with_context(|| format!("serialize messages for `{tab_url}`"))?;
    conn.execute(
        r#"
        INSERT INTO tab_messages (tab_url, messages_json, updated_at_unix_ms)
        VALUES (?1, ?2, ?3)
        ON CONFLICT(tab_url) DO UPDATE SET
          messages_json = excluded.messages_json,
          updated_at_unix_ms = excluded.updated_at_unix_ms
        "#,
        params![tab_url, messages_json, now_unix_ms()?],
    )
    .with_context(|| format!("upsert messages for `{tab_url}`"))?;
    Ok(())
}

fn remove_blocking(path: &Path, tab_url: &str) -> anyhow::Result<()> {
    let conn = open_connection(path)?;
    conn.execute(
        "DELETE FROM tab_messages WHERE tab_url = ?1",
        params![tab_url],
    )
    .with_context(|| format!("delete messages for `{tab_url}`"))?;
    Ok(())
}

fn clear_blocking(path: &Path) -> anyhow::Result<()> {
    let conn = open_connection(path)?;
    conn.execute("DELETE FROM tab_messages", [])
        .context("delete all tab messages")?;
    Ok(())
}

/// In-process storage. Writes can be made to fail to exercise the
/// persistence-failure path.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<StoreSnapshot>,
    fail_writes: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entries(entries: StoreSnapshot) -> Self {
        Self {
            entries: Mutex::new(entries),
            fail_writes: AtomicBool::new(false),
        }
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn entries(&self) -> StoreSnapshot {
        self.lock_entries().clone()
    }

    fn lock_entries(&self) -> std::sync::MutexGuard<'_, StoreSnapshot> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_writable(&self) -> Result<(), RelayError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(RelayError::Persistence(
                "memory storage rejected write".to_owned(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl DurableStorage for MemoryStorage {
    async fn load_all(&self) -> Result<StoreSnapshot, RelayError> {
        Ok(self.entries())
    }

    async fn put(&self, tab_url: &str, messages: Vec<StoredMessage>) -> Result<(), RelayError> {
        self.check_writable()?;
        self.lock_entries().insert(tab_url.to_owned(), messages);
        Ok(())
    }

    async fn remove(&self, tab_url: &str) -> Result<(), RelayError> {
        self.check_writable()?;
        self.lock_entries().remove(tab_url);
        Ok(())
    }

    async fn clear(&self) -> Result<(), RelayError> {
        self.check_writable()?;
        self.lock_entries().clear();
        Ok(())
    }
}
