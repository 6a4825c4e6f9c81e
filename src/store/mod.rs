//! Durable job and task state.
//!
//! The store is the single source of truth of the job manager: every
//! in-memory structure elsewhere is a cache that can be rebuilt from it after
//! a restart. Task records carry a version; writes go through [`StateStore::put`],
//! which only succeeds against the version that was read, so concurrent
//! writers never silently overwrite each other.

mod jobs;
mod tasks;

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::types::Type;
use rusqlite::Connection;

use crate::error::{JobMgrError, Result};

const DB_SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS jobs (
      id TEXT PRIMARY KEY,
      name TEXT NOT NULL,
      spec_json TEXT NOT NULL,
      goal_state TEXT NOT NULL,
      created_at_ms INTEGER NOT NULL,
      updated_at_ms INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS tasks (
      job_id TEXT NOT NULL,
      instance INTEGER NOT NULL,
      actual_state TEXT NOT NULL,
      desired_state TEXT NOT NULL,
      master_handle TEXT,
      run_id INTEGER NOT NULL,
      retry_count INTEGER NOT NULL,
      failure_count INTEGER NOT NULL,
      pending_action TEXT,
      pending_handle TEXT,
      halted INTEGER NOT NULL,
      message TEXT,
      version INTEGER NOT NULL,
      updated_at_ms INTEGER NOT NULL,
      PRIMARY KEY (job_id, instance)
    );

    CREATE INDEX IF NOT EXISTS tasks_by_handle ON tasks(master_handle);
    CREATE INDEX IF NOT EXISTS tasks_by_pending_handle ON tasks(pending_handle);
"#;

#[derive(Debug)]
pub struct StateStore {
    path: Option<PathBuf>,
    conn: Mutex<Connection>,
}

impl StateStore {
    /// Open (creating if needed) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(&path)?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA busy_timeout=5000;
            "#,
        )?;
        let store = Self {
            path: Some(path),
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    /// A store that lives only as long as this value.
    pub fn open_in_memory() -> Result<Self> {
        let store = Self {
            path: None,
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.migrate()?;
        Ok(store)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn migrate(&self) -> Result<()> {
        self.conn()?.execute_batch(DB_SCHEMA)?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| JobMgrError::Internal("state store lock poisoned".into()))
    }
}

fn to_ms(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_ms(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

/// Parse a TEXT column, reporting failures as a column conversion error.
fn parse_column<T>(idx: usize, raw: &str) -> rusqlite::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse::<T>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.to_string().into())
    })
}
