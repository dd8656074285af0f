//! Database handle: connection management and the engine entry points.
//!
//! `Db` wraps a SQLite database (a file, or a named shared-cache in-memory
//! instance for tests) behind a small connection pool. Every pooled
//! connection carries the schema pragmas, the `rarray` table-valued
//! function, and the row-lookup scalar functions backed by the shared
//! segment cache. The loader checks out one connection for a whole load;
//! reads check out connections independently and may run concurrently.

pub mod lifecycle;
pub mod schema;
pub mod sequence;

use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags};

use crate::cache::{self, SegmentCache};
use crate::err::Result;
use crate::loader::{self, LoadRequest, LoadSummary};
use crate::query::ast::{Row, Select};
use crate::query::{self, FetchRequest, FetchResult};

/// Idle connections kept around per pool.
const MAX_IDLE: usize = 8;

static MEMORY_DB_SEQ: AtomicU64 = AtomicU64::new(0);

/// Where the database lives. In-memory instances use a named shared-cache
/// URI so that every connection, including the cache's dedicated reader,
/// observes the same store.
#[derive(Debug, Clone)]
enum Location {
    File(PathBuf),
    Memory(String),
}

impl Location {
    fn connect(&self) -> Result<Connection> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = match self {
            Location::File(path) => Connection::open_with_flags(path, flags)?,
            Location::Memory(uri) => Connection::open_with_flags(uri, flags)?,
        };
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        if let Location::File(_) = self {
            // WAL keeps readers of other datasets from blocking a loader.
            conn.query_row("PRAGMA journal_mode = WAL", [], |_row| Ok(()))?;
        }
        Ok(conn)
    }
}

struct ConnPool {
    location: Location,
    cache: Arc<SegmentCache>,
    idle: Mutex<Vec<Connection>>,
}

impl ConnPool {
    fn checkout(pool: &Arc<Self>) -> Result<PooledConn> {
        let reused = pool.idle.lock().pop();
        let conn = match reused {
            Some(conn) => conn,
            None => {
                let conn = pool.location.connect()?;
                rusqlite::vtab::array::load_module(&conn)?;
                cache::register_functions(&conn, Arc::clone(&pool.cache))?;
                conn
            }
        };
        Ok(PooledConn {
            conn: Some(conn),
            pool: Arc::clone(pool),
        })
    }
}

/// A connection checked out of the pool; returns on drop.
struct PooledConn {
    conn: Option<Connection>,
    pool: Arc<ConnPool>,
}

impl Deref for PooledConn {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("live until drop")
    }
}

impl DerefMut for PooledConn {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("live until drop")
    }
}

impl Drop for PooledConn {
    fn drop(&mut self) {
        let conn = self.conn.take().expect("dropped once");
        // A load that errored out may leave a transaction open.
        if !conn.is_autocommit() {
            let _ = conn.execute_batch("ROLLBACK");
        }
        let mut idle = self.pool.idle.lock();
        if idle.len() < MAX_IDLE {
            idle.push(conn);
        }
    }
}

/// Handle to one column-store database.
pub struct Db {
    pool: Arc<ConnPool>,
}

impl Db {
    /// Open (creating if necessary) a database file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::with_location(Location::File(path.as_ref().to_path_buf()))
    }

    /// Open a fresh private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        let n = MEMORY_DB_SEQ.fetch_add(1, Ordering::Relaxed);
        let uri = format!(
            "file:xena-mem-{}-{}?mode=memory&cache=shared",
            std::process::id(),
            n
        );
        Self::with_location(Location::Memory(uri))
    }

    fn with_location(location: Location) -> Result<Self> {
        // The cache reader doubles as the anchor connection that keeps a
        // shared-cache in-memory database alive.
        let cache_conn = location.connect()?;
        schema::init(&cache_conn)?;
        let cache = Arc::new(SegmentCache::new(cache_conn));
        let pool = Arc::new(ConnPool {
            location,
            cache,
            idle: Mutex::new(Vec::new()),
        });
        Ok(Self { pool })
    }

    /// Load a dataset; see [`loader::run`].
    pub fn write_matrix(&self, req: LoadRequest) -> Result<LoadSummary> {
        let mut conn = ConnPool::checkout(&self.pool)?;
        loader::run(&mut conn, req)
    }

    /// Delete a dataset by name. Missing datasets are not an error.
    pub fn delete_matrix(&self, name: &str) -> Result<()> {
        let mut conn = ConnPool::checkout(&self.pool)?;
        lifecycle::delete_dataset(&mut conn, name)?;
        Ok(())
    }

    /// Remove `source` rows no longer referenced by any dataset.
    pub fn clean_sources(&self) -> Result<usize> {
        let conn = ConnPool::checkout(&self.pool)?;
        lifecycle::clean_sources(&conn)
    }

    /// Run a structured read-only query.
    pub fn run_query(&self, select: &Select) -> Result<Vec<Row>> {
        let conn = ConnPool::checkout(&self.pool)?;
        query::ast::run(&conn, select)
    }

    /// Answer a batch of genomic fetch requests.
    pub fn fetch(&self, requests: Vec<FetchRequest>) -> Result<Vec<FetchResult>> {
        let conn = ConnPool::checkout(&self.pool)?;
        query::fetch(&conn, &self.pool.cache, requests)
    }

    /// Names of rows of the dataset's `position` field overlapping a genomic
    /// interval, resolved through the `name` field's codes.
    pub fn probes_in_range(
        &self,
        dataset: &str,
        chrom: &str,
        start: i64,
        end: i64,
    ) -> Result<Vec<String>> {
        let conn = ConnPool::checkout(&self.pool)?;
        query::probes_in_range(&conn, &self.pool.cache, dataset, chrom, start, end)
    }

    /// Close the handle, dropping pooled connections.
    pub fn close(self) -> Result<()> {
        let mut idle = self.pool.idle.lock();
        while let Some(conn) = idle.pop() {
            conn.close().map_err(|(_, e)| crate::err::Error::from(e))?;
        }
        Ok(())
    }
}
