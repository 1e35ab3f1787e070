//! Per-user collection handle: opens the embedded database file,
//! enforces the write-ahead-log checkpoint discipline, and hands out
//! a single-writer connection guarded by a lock.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use cardsync_core::error::{Error, Result};
use parking_lot::Mutex;
use rusqlite::Connection;
use tracing::{debug, instrument, warn};

use crate::schema::SchemaVersion;

/// A reference-counted handle to one user's collection database.
///
/// Cloning is cheap; the underlying connection is shared behind a
/// mutex so all mutation for a user funnels through a single writer,
/// mirroring the single-writer-per-collection discipline the embedded
/// database requires.
#[derive(Clone)]
pub struct CollectionHandle {
    inner: Arc<CollectionInner>,
}

struct CollectionInner {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl CollectionHandle {
    /// Open (creating if absent) the collection file at `path`, applying
    /// the write-ahead-log pragmas every connection to a shared on-disk
    /// database needs.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&path)
            .map_err(|e| Error::Internal(format!("failed to open collection: {e}")))?;
        prepare_connection(&conn)?;

        debug!("opened collection");
        Ok(Self {
            inner: Arc::new(CollectionInner {
                conn: Mutex::new(conn),
                path,
            }),
        })
    }

    /// Open an in-memory collection, used by tests that don't need a
    /// persisted file.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Internal(format!("failed to open in-memory collection: {e}")))?;
        Ok(Self {
            inner: Arc::new(CollectionInner {
                conn: Mutex::new(conn),
                path: PathBuf::new(),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Run `f` with exclusive access to the underlying connection.
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.inner.conn.lock();
        f(&conn)
    }

    /// Run `f` with exclusive, mutable access to the underlying
    /// connection — used for transactions that write.
    pub fn with_conn_mut<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut conn = self.inner.conn.lock();
        f(&mut conn)
    }

    /// Force a full write-ahead-log checkpoint. Must be called before
    /// any code path deletes or otherwise bypasses the `-wal`/`-shm`
    /// auxiliary files, and before a full download streams the
    /// collection file to a client — an uncheckpointed download can
    /// silently omit committed changes still sitting in the log.
    #[instrument(skip(self))]
    pub fn checkpoint(&self) -> Result<()> {
        let conn = self.inner.conn.lock();
        conn.pragma_update(None, "wal_checkpoint", "RESTART")
            .map_err(|e| Error::Internal(format!("wal checkpoint failed: {e}")))?;
        Ok(())
    }

    /// Read the collection's on-disk schema version marker.
    pub fn schema_version(&self) -> Result<SchemaVersion> {
        self.with_conn(|conn| {
            let raw: i64 = conn
                .query_row("SELECT ver FROM col LIMIT 1", [], |row| row.get(0))
                .map_err(|e| Error::Internal(format!("failed to read schema version: {e}")))?;
            SchemaVersion::from_raw(raw)
        })
    }
}

impl Drop for CollectionInner {
    fn drop(&mut self) {
        if self.path.as_os_str().is_empty() {
            return;
        }
        let conn = self.conn.lock();
        if let Err(e) = conn.pragma_update(None, "wal_checkpoint", "RESTART") {
            warn!(error = %e, "failed to checkpoint collection on close");
        }
    }
}

/// Apply the pragmas a shared, write-ahead-logged collection file needs:
/// WAL journaling with manual checkpointing (never auto-checkpoint,
/// since that could race with a concurrent full-download streaming the
/// file) and a conservative synchronous mode.
fn prepare_connection(conn: &Connection) -> Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")
        .map_err(|e| Error::Internal(format!("failed to set journal_mode: {e}")))?;
    conn.pragma_update(None, "synchronous", "NORMAL")
        .map_err(|e| Error::Internal(format!("failed to set synchronous: {e}")))?;
    conn.pragma_update(None, "wal_autocheckpoint", 0)
        .map_err(|e| Error::Internal(format!("failed to disable wal_autocheckpoint: {e}")))?;
    conn.pragma_update(None, "foreign_keys", "ON")
        .map_err(|e| Error::Internal(format!("failed to enable foreign_keys: {e}")))?;
    Ok(())
}
