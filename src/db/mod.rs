use rusqlite::Connection;
use std::path::Path;
use std::time::Duration;
use tokio::task;
use crate::error::{Result, RelgraphError};

const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

/// Database connection wrapper
#[derive(Debug, Clone)]
pub struct Db {
    path: std::path::PathBuf,
    busy_timeout: Duration,
}

impl Db {
    /// Create a new database connection manager
    pub fn new<P: AsRef<Path>>(db_path: P) -> Self {
        Self {
            path: db_path.as_ref().to_path_buf(),
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        }
    }

    /// Override how long a connection waits on a locked database.
    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    /// Database file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open a new database connection with optimized pragmas
    pub fn open_connection(&self) -> Result<Connection> {
        open(&self.path, self.busy_timeout)
    }

    /// Execute a closure with a database connection in a blocking task
    pub async fn with_connection<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let path = self.path.clone();
        let busy_timeout = self.busy_timeout;
        task::spawn_blocking(move || {
            let mut conn = open(&path, busy_timeout)?;
            f(&mut conn)
        })
        .await
        .map_err(|e| RelgraphError::Task(e.to_string()))?
    }
}

fn open(path: &Path, busy_timeout: Duration) -> Result<Connection> {
    let conn = Connection::open(path)?;

    // Busy timeout first so the pragmas below wait on concurrent writers too.
    conn.busy_timeout(busy_timeout)?;

    // WAL lets traversals read while relation and alarm writes commit.
    conn.execute_batch(
        "PRAGMA journal_mode = WAL; \
         PRAGMA synchronous = NORMAL; \
         PRAGMA foreign_keys = ON; \
         PRAGMA temp_store = MEMORY; \
         PRAGMA cache_size = -65536;"
    )?;

    Ok(conn)
}

pub mod migrate;
