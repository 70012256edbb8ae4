//! SQLite-backed rule store.
//!
//! Rules survive restarts and can be changed while traffic flows; every
//! lookup reads the current row, so a write is visible to the very next
//! request.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tracing::{debug, error, info};

use super::Backend;

/// How often the store asks SQLite to refresh its query planner stats.
pub const OPTIMIZE_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Errors from rule store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("rule store lock poisoned")]
    Poisoned,
}

/// A stored proxy rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRule {
    pub domain: String,
    /// `None` when the stored backend label is not recognized.
    pub backend: Option<Backend>,
    pub updated_at: String,
}

/// A stored redirect rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectRule {
    pub prefix: String,
    pub to_url: String,
    pub updated_at: String,
}

/// SQLite rule store. Cheap to clone; clones share one connection.
#[derive(Clone)]
pub struct RuleStore {
    conn: Arc<Mutex<Connection>>,
}

impl RuleStore {
    /// Open or create a rule store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;

        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;

        Ok(store)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Initialize database schema.
    fn init_schema(&self) -> Result<(), StoreError> {
        self.lock()?.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS proxy_rules (
                domain     TEXT NOT NULL PRIMARY KEY,
                backend    TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS redirect_rules (
                prefix     TEXT NOT NULL PRIMARY KEY,
                to_url     TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            "#,
        )?;

        debug!("Rule store schema initialized");
        Ok(())
    }

    /// Get the proxy rule for a domain.
    pub fn get_proxy_rule(&self, domain: &str) -> Result<Option<ProxyRule>, StoreError> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT domain, backend, updated_at FROM proxy_rules WHERE domain = ?1")?;

        stmt.query_row(params![domain], |row| {
            let backend: String = row.get(1)?;
            Ok(ProxyRule {
                domain: row.get(0)?,
                backend: Backend::parse(&backend),
                updated_at: row.get(2)?,
            })
        })
        .optional()
        .map_err(Into::into)
    }

    /// Insert or replace the proxy rule for a domain.
    pub fn upsert_proxy_rule(&self, domain: &str, backend: Backend) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.lock()?.execute(
            r#"
            INSERT INTO proxy_rules (domain, backend, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(domain) DO UPDATE SET
                backend = excluded.backend,
                updated_at = excluded.updated_at
            "#,
            params![domain, backend.as_str(), now],
        )?;
        Ok(())
    }

    /// Delete the proxy rule for a domain. Returns whether a rule existed.
    pub fn delete_proxy_rule(&self, domain: &str) -> Result<bool, StoreError> {
        let deleted = self
            .lock()?
            .execute("DELETE FROM proxy_rules WHERE domain = ?1", params![domain])?;
        Ok(deleted > 0)
    }

    /// Get the redirect rule for an exact prefix.
    pub fn get_redirect_rule(&self, prefix: &str) -> Result<Option<RedirectRule>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT prefix, to_url, updated_at FROM redirect_rules WHERE prefix = ?1")?;

        stmt.query_row(params![prefix], |row| {
            Ok(RedirectRule {
                prefix: row.get(0)?,
                to_url: row.get(1)?,
                updated_at: row.get(2)?,
            })
        })
        .optional()
        .map_err(Into::into)
    }

    /// Insert or replace a redirect rule.
    pub fn upsert_redirect_rule(&self, prefix: &str, to_url: &str) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.lock()?.execute(
            r#"
            INSERT INTO redirect_rules (prefix, to_url, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(prefix) DO UPDATE SET
                to_url = excluded.to_url,
                updated_at = excluded.updated_at
            "#,
            params![prefix, to_url, now],
        )?;
        Ok(())
    }

    /// Delete a redirect rule. Returns whether a rule existed.
    pub fn delete_redirect_rule(&self, prefix: &str) -> Result<bool, StoreError> {
        let deleted = self.lock()?.execute(
            "DELETE FROM redirect_rules WHERE prefix = ?1",
            params![prefix],
        )?;
        Ok(deleted > 0)
    }

    /// Let SQLite refresh planner statistics.
    pub fn optimize(&self) -> Result<(), StoreError> {
        self.lock()?
            .execute_batch("PRAGMA analysis_limit=500; PRAGMA optimize;")?;
        Ok(())
    }

    /// Run [`RuleStore::optimize`] every [`OPTIMIZE_INTERVAL`] in the background.
    pub fn spawn_optimize_loop(&self) -> tokio::task::JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(OPTIMIZE_INTERVAL);
            // The first tick fires immediately.
            interval.tick().await;
            loop {
                interval.tick().await;
                info!("Rule store optimize started");
                let store = store.clone();
                match tokio::task::spawn_blocking(move || store.optimize()).await {
                    Ok(Ok(())) => info!("Rule store optimize done"),
                    Ok(Err(e)) => error!(error = %e, "Rule store optimize failed"),
                    Err(e) => error!(error = %e, "Rule store optimize task failed"),
                }
            }
        })
    }
}
