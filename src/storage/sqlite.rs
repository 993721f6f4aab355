//! The embedded relational index.
//!
//! One SQLite database holds registered directories, the file paths indexed
//! under them, interned tokens and fields, and the links tying them together.
//! The store keeps a single long-lived write connection behind an async
//! mutex; every write runs as one IMMEDIATE transaction. Readers open
//! short-lived read-only connections, so queries run in parallel with at most
//! one writer.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::{Connection, OpenFlags, TransactionBehavior};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::whitelist::LinkWhitelist;

mod directory;
mod listing;
mod maintain;
mod search;

pub use directory::{unix_now, validate_base_names, validate_directory_path};
pub use listing::{DirectoryPage, NamedCount, RegisteredFilter};
pub use search::{QueryOptions, QueryPage};

// Bumping this drops and recreates every non-automatic index on open.
const SCHEMA_VERSION: i32 = 1;

/// Knobs fixed at startup.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// How long a connection waits on the write slot before giving up.
    pub busy_timeout: Duration,
    /// Worker count for the metadata loader pool.
    pub concurrency: usize,
    /// When set, each indexed path is itself tokenized under this field.
    pub path_field: Option<String>,
    /// Governs which symbolic links scans may follow.
    pub whitelist: LinkWhitelist,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            busy_timeout: Duration::from_secs(10),
            concurrency: 4,
            path_field: None,
            whitelist: LinkWhitelist::new(),
        }
    }
}

/// A row of the `paths` table, optionally carrying its metadata document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PathRecord {
    #[serde(skip)]
    pub pid: i64,
    pub path: String,
    pub user: String,
    pub time: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// A row of the `dirs` table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DirectoryRecord {
    #[serde(skip)]
    pub did: i64,
    pub path: String,
    pub user: String,
    pub time: i64,
    pub names: Vec<String>,
}

pub struct Store {
    path: PathBuf,
    writer: Mutex<Connection>,
    options: StoreOptions,
}

impl Store {
    /// Open or create the index at `path` and bring its schema up to date.
    pub fn open(path: &Path, options: StoreOptions) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create database directory {}", parent.display())
                })?;
            }
        }

        let mut conn = Connection::open(path)
            .with_context(|| format!("failed to open database {}", path.display()))?;
        configure(&conn, options.busy_timeout)?;
        initialize(&mut conn).context("failed to initialize the database schema")?;

        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(conn),
            options,
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.path
    }

    pub(crate) async fn writer(&self) -> tokio::sync::MutexGuard<'_, Connection> {
        self.writer.lock().await
    }

    /// A fresh read-only connection; readers never contend with the writer
    /// beyond WAL snapshotting.
    pub(crate) fn read_conn(&self) -> Result<Connection> {
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("failed to open database {}", self.path.display()))?;
        conn.busy_timeout(self.options.busy_timeout)
            .context("failed to set busy timeout")?;
        Ok(conn)
    }

    pub(crate) fn options(&self) -> &StoreOptions {
        &self.options
    }
}

fn configure(conn: &Connection, busy_timeout: Duration) -> Result<()> {
    conn.busy_timeout(busy_timeout)
        .context("failed to set busy timeout")?;
    // journal_mode reports the resulting mode as a row.
    conn.pragma_update_and_check(None, "journal_mode", "wal", |_row| Ok(()))
        .context("failed to enable WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")
        .context("failed to set synchronous mode")?;
    conn.pragma_update(None, "foreign_keys", "ON")
        .context("failed to enforce foreign keys")?;
    Ok(())
}

fn initialize(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    tx.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS dirs (
  did INTEGER PRIMARY KEY,
  path TEXT NOT NULL UNIQUE,
  user TEXT NOT NULL,
  time INTEGER NOT NULL,
  names BLOB NOT NULL
);

CREATE TABLE IF NOT EXISTS paths (
  pid INTEGER PRIMARY KEY,
  did INTEGER NOT NULL,
  path TEXT NOT NULL UNIQUE,
  user TEXT NOT NULL,
  time INTEGER NOT NULL,
  metadata BLOB NOT NULL,
  FOREIGN KEY(did) REFERENCES dirs(did) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS tokens (
  tid INTEGER PRIMARY KEY,
  token TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS fields (
  fid INTEGER PRIMARY KEY,
  field TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS links (
  pid INTEGER NOT NULL,
  fid INTEGER NOT NULL,
  tid INTEGER NOT NULL,
  UNIQUE(pid, fid, tid),
  FOREIGN KEY(pid) REFERENCES paths(pid) ON DELETE CASCADE,
  FOREIGN KEY(fid) REFERENCES fields(fid),
  FOREIGN KEY(tid) REFERENCES tokens(tid)
);
"#,
    )
    .context("failed to create tables")?;

    let version: i32 = tx.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if version < SCHEMA_VERSION {
        // Rebuild every non-automatic index so older databases pick up index
        // changes without a dump/reload.
        let stale: Vec<String> = tx
            .prepare("SELECT name FROM sqlite_master WHERE type = 'index' AND sql IS NOT NULL")?
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;
        for name in stale {
            tx.execute_batch(&format!("DROP INDEX \"{name}\""))?;
        }
        tx.execute_batch(
            r#"
CREATE INDEX index_paths_did ON paths(did, path);
CREATE INDEX index_paths_time ON paths(time, pid);
CREATE INDEX index_paths_user ON paths(user);
CREATE INDEX index_links_tid ON links(tid, fid);
CREATE INDEX index_links_fid ON links(fid);
"#,
        )
        .context("failed to create indices")?;
        tx.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    }

    tx.commit()?;
    Ok(())
}
