use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use tracing::instrument;

use crate::error::StoreError;
use crate::schema;

pub type Conn = PooledConnection<SqliteConnectionManager>;

/// WAL mode + a generous busy timeout let multiple components (collector,
/// pipeline, tester workers) share one file without `SQLITE_BUSY` errors
/// under normal contention (§4.1, §5: "writers use a `BEGIN IMMEDIATE`
/// transaction... readers never block on writers under WAL").
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// The embedded single-file transactional store (§3, §4.1). Cheaply
/// cloneable: internally an `Arc`-backed connection pool.
#[derive(Clone)]
pub struct Store {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl Store {
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let manager = SqliteConnectionManager::file(path.as_ref()).with_init(init_connection);
        let pool = Pool::builder().max_size(16).build(manager)?;
        let conn = pool.get()?;
        schema::migrate(&conn)?;
        Ok(Store { pool: Arc::new(pool) })
    }

    /// In-memory store for tests. Each call opens its own independent
    /// database (`rusqlite`'s shared in-memory mode is not used, to keep
    /// tests isolated from one another).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let manager = SqliteConnectionManager::memory().with_init(init_connection);
        let pool = Pool::builder().max_size(4).build(manager)?;
        let conn = pool.get()?;
        schema::migrate(&conn)?;
        Ok(Store { pool: Arc::new(pool) })
    }

    pub fn conn(&self) -> Result<Conn, StoreError> {
        Ok(self.pool.get()?)
    }

    pub fn describe_schema(&self) -> Result<schema::SchemaReport, StoreError> {
        schema::describe_schema(&self.conn()?)
    }

    /// Run `f` inside a `BEGIN IMMEDIATE` transaction, committing on
    /// success and rolling back on error. Every multi-statement write in
    /// this crate goes through this helper so writers serialize instead of
    /// racing each other (§4.1, §5).
    pub(crate) fn with_immediate_tx<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }
}

fn init_connection(conn: &mut Connection) -> Result<(), rusqlite::Error> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "busy_timeout", BUSY_TIMEOUT.as_millis() as i64)?;
    conn.pragma_update(None, "foreign_keys", true)?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    Ok(())
}
