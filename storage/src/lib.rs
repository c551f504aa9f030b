//! Embedded SQL storage engine.
//!
//! One SQLite file per instance (`.../data/kecs.db`) behind a deadpool
//! connection pool. Each entity gets a cheap cloneable store handle over
//! the shared pool; multi-row mutations that must be atomic run inside a
//! single transaction via [`Database::with_tx`].

use std::path::Path;

use deadpool_sqlite::{Config, Pool, PoolConfig, Runtime};
use kecs_types::{Error, Result};

pub mod account_settings;
pub mod attributes;
pub mod clusters;
pub mod container_instances;
pub mod elbv2;
pub mod schema;
pub mod services;
pub mod task_definitions;
pub mod task_logs;
pub mod task_sets;
pub mod tasks;
mod token;

pub use account_settings::AccountSettingStore;
pub use attributes::AttributeStore;
pub use clusters::ClusterStore;
pub use container_instances::ContainerInstanceStore;
pub use elbv2::Elbv2Store;
pub use services::ServiceStore;
pub use task_definitions::TaskDefinitionStore;
pub use task_logs::TaskLogStore;
pub use task_sets::TaskSetStore;
pub use tasks::{TaskFilters, TaskStore};

/// Upper bound on pooled connections per instance.
const MAX_CONNECTIONS: usize = 25;
/// Per-connection prepared-statement cache. A cache miss falls back to
/// ad-hoc preparation inside rusqlite, never an error.
const STATEMENT_CACHE_CAPACITY: usize = 64;

#[derive(Clone)]
pub struct Database {
    pool: Pool,
}

impl Database {
    /// Open (creating if necessary) the database file, run schema
    /// initialization and any pending migration, and return the shared
    /// handle.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut cfg = Config::new(path);
        cfg.pool = Some(PoolConfig::new(MAX_CONNECTIONS));
        let pool = cfg
            .create_pool(Runtime::Tokio1)
            .map_err(|e| Error::Database(format!("failed to create pool: {e}")))?;

        let db = Database { pool };
        run(&db.pool, |conn| {
            conn.set_prepared_statement_cache_capacity(STATEMENT_CACHE_CAPACITY);
            conn.pragma_update(None, "journal_mode", "WAL")
                .map_err(db_err)?;
            conn.pragma_update(None, "busy_timeout", 5000).map_err(db_err)?;
            schema::initialize(conn)
        })
        .await?;
        tracing::info!(path = %path.display(), "database initialized");
        Ok(db)
    }

    /// Run a closure against a pooled connection. The closure executes on
    /// the pool's blocking executor; the await is cancellable until the
    /// closure starts.
    pub async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut rusqlite::Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        run(&self.pool, f).await
    }

    /// The shared transaction primitive: the closure receives an open
    /// transaction which is committed when it returns `Ok` and rolled back
    /// (on drop) otherwise.
    pub async fn with_tx<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&rusqlite::Transaction) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        run(&self.pool, move |conn| {
            let tx = conn.transaction().map_err(db_err)?;
            let out = f(&tx)?;
            tx.commit().map_err(db_err)?;
            Ok(out)
        })
        .await
    }

    pub fn clusters(&self) -> ClusterStore {
        ClusterStore::new(self.pool.clone())
    }

    pub fn task_definitions(&self) -> TaskDefinitionStore {
        TaskDefinitionStore::new(self.pool.clone())
    }

    pub fn services(&self) -> ServiceStore {
        ServiceStore::new(self.pool.clone())
    }

    pub fn tasks(&self) -> TaskStore {
        TaskStore::new(self.pool.clone())
    }

    pub fn task_sets(&self) -> TaskSetStore {
        TaskSetStore::new(self.pool.clone())
    }

    pub fn container_instances(&self) -> ContainerInstanceStore {
        ContainerInstanceStore::new(self.pool.clone())
    }

    pub fn attributes(&self) -> AttributeStore {
        AttributeStore::new(self.pool.clone())
    }

    pub fn elbv2(&self) -> Elbv2Store {
        Elbv2Store::new(self.pool.clone())
    }

    pub fn task_logs(&self) -> TaskLogStore {
        TaskLogStore::new(self.pool.clone())
    }

    pub fn account_settings(&self) -> AccountSettingStore {
        AccountSettingStore::new(self.pool.clone())
    }

    /// Cheap liveness probe for the health endpoints.
    pub async fn ping(&self) -> Result<()> {
        run(&self.pool, |conn| {
            conn.query_row("SELECT 1", [], |_| Ok(())).map_err(db_err)
        })
        .await
    }
}

pub(crate) async fn run<T, F>(pool: &Pool, f: F) -> Result<T>
where
    F: FnOnce(&mut rusqlite::Connection) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let conn = pool
        .get()
        .await
        .map_err(|e| Error::Database(format!("failed to get db connection: {e}")))?;
    conn.interact(f)
        .await
        .map_err(|e| Error::Database(format!("db executor failed: {e}")))?
}

pub(crate) fn db_err(e: rusqlite::Error) -> Error {
    Error::Database(e.to_string())
}

/// Serialize a JSON blob column. NULL when absent.
pub(crate) fn to_blob<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| Error::Database(format!("blob encode: {e}")))
}

pub(crate) fn from_blob<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T> {
    serde_json::from_str(raw).map_err(|e| Error::Database(format!("blob decode: {e}")))
}

pub(crate) fn opt_blob<T: serde::Serialize>(value: &Option<T>) -> Result<Option<String>> {
    value.as_ref().map(|v| to_blob(v)).transpose()
}

pub(crate) fn opt_from_blob<T: serde::de::DeserializeOwned>(raw: Option<String>) -> Result<Option<T>> {
    raw.as_deref().map(from_blob).transpose()
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::Database;

    /// A scratch database in a tempdir. Keep the dir handle alive for the
    /// test's duration.
    pub async fn scratch() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::open(&dir.path().join("kecs.db"))
            .await
            .expect("open scratch db");
        (dir, db)
    }
}
