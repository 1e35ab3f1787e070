//! The media entry log: one row per filename, tracking its content
//! hash, size, modification time, and an independent USN counter.

use std::path::Path;
use std::sync::Arc;

use cardsync_core::error::{Error, Result};
use cardsync_core::usn::Usn;
use parking_lot::Mutex;
use rusqlite::Connection;
use tracing::instrument;

/// One row of the media log. An empty `sha1` marks a deletion
/// tombstone; no file with `fname` should exist on disk in that case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaEntry {
    pub fname: String,
    pub usn: i64,
    pub sha1: String,
    pub size: i64,
    pub mtime: i64,
}

impl MediaEntry {
    pub fn is_tombstone(&self) -> bool {
        self.sha1.is_empty()
    }
}

/// Reference-counted handle to a user's media log database.
#[derive(Clone)]
pub struct MediaDb {
    conn: Arc<Mutex<Connection>>,
}

impl MediaDb {
    #[instrument(fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path.as_ref())
            .map_err(|e| Error::Internal(format!("failed to open media db: {e}")))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS media (
                fname TEXT PRIMARY KEY,
                usn INTEGER NOT NULL,
                sha1 TEXT NOT NULL,
                size INTEGER NOT NULL,
                mtime INTEGER NOT NULL
            );",
        )
        .map_err(|e| Error::Internal(format!("failed to create media table: {e}")))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Internal(format!("failed to open in-memory media db: {e}")))?;
        conn.execute_batch(
            "CREATE TABLE media (
                fname TEXT PRIMARY KEY,
                usn INTEGER NOT NULL,
                sha1 TEXT NOT NULL,
                size INTEGER NOT NULL,
                mtime INTEGER NOT NULL
            );",
        )
        .map_err(|e| Error::Internal(format!("failed to create media table: {e}")))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// The current media USN: the USN of the most recently applied
    /// change, or zero for a brand-new log.
    pub fn current_usn(&self) -> Result<Usn> {
        let conn = self.conn.lock();
        let max: Option<i64> = conn
            .query_row("SELECT MAX(usn) FROM media", [], |row| row.get(0))
            .map_err(|e| Error::Internal(format!("failed to read current media usn: {e}")))?;
        Ok(Usn(max.unwrap_or(0)))
    }

    /// Entries with `usn` strictly greater than `since`, ordered by
    /// ascending USN.
    pub fn changes_since(&self, since: Usn) -> Result<Vec<MediaEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT fname, usn, sha1, size, mtime FROM media WHERE usn > ?1 ORDER BY usn ASC")
            .map_err(|e| Error::Internal(format!("failed to prepare media changes query: {e}")))?;
        let rows = stmt
            .query_map([since.0], |row| {
                Ok(MediaEntry {
                    fname: row.get(0)?,
                    usn: row.get(1)?,
                    sha1: row.get(2)?,
                    size: row.get(3)?,
                    mtime: row.get(4)?,
                })
            })
            .map_err(|e| Error::Internal(format!("failed to list media changes: {e}")))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(|e| Error::Internal(format!("failed to read media row: {e}")))?);
        }
        Ok(out)
    }

    /// Record one applied write (upload or deletion), assigning it the
    /// next USN. Superseding an existing filename keeps only the newest
    /// row — the log is keyed by filename, not append-only per write.
    pub fn record(&self, fname: &str, sha1: &str, size: i64, mtime: i64) -> Result<Usn> {
        let conn = self.conn.lock();
        let next_usn = {
            let max: Option<i64> = conn
                .query_row("SELECT MAX(usn) FROM media", [], |row| row.get(0))
                .map_err(|e| Error::Internal(format!("failed to read media usn: {e}")))?;
            max.unwrap_or(0) + 1
        };
        conn.execute(
            "INSERT INTO media (fname, usn, sha1, size, mtime) VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT(fname) DO UPDATE SET usn = excluded.usn, sha1 = excluded.sha1, \
             size = excluded.size, mtime = excluded.mtime",
            rusqlite::params![fname, next_usn, sha1, size, mtime],
        )
        .map_err(|e| Error::Internal(format!("failed to record media entry: {e}")))?;
        Ok(Usn(next_usn))
    }

    /// Count of non-tombstone entries, used by the sanity check.
    pub fn file_count(&self) -> Result<i64> {
        let conn = self.conn.lock();
        conn.query_row("SELECT count(*) FROM media WHERE sha1 != ''", [], |row| row.get(0))
            .map_err(|e| Error::Internal(format!("failed to count media files: {e}")))
    }

    pub fn lookup(&self, fname: &str) -> Result<Option<MediaEntry>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT fname, usn, sha1, size, mtime FROM media WHERE fname = ?1",
            [fname],
            |row| {
                Ok(MediaEntry {
                    fname: row.get(0)?,
                    usn: row.get(1)?,
                    sha1: row.get(2)?,
                    size: row.get(3)?,
                    mtime: row.get(4)?,
                })
            },
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(Error::Internal(format!("failed to look up media entry: {other}"))),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_assigns_increasing_usns() {
        let db = MediaDb::open_in_memory().unwrap();
        let u1 = db.record("a.jpg", "abc", 10, 1).unwrap();
        let u2 = db.record("b.mp3", "def", 20, 2).unwrap();
        assert_eq!(u1, Usn(1));
        assert_eq!(u2, Usn(2));
        assert_eq!(db.current_usn().unwrap(), Usn(2));
    }

    #[test]
    fn changes_since_excludes_already_seen_entries() {
        let db = MediaDb::open_in_memory().unwrap();
        db.record("a.jpg", "abc", 10, 1).unwrap();
        db.record("b.mp3", "def", 20, 2).unwrap();
        let changes = db.changes_since(Usn(1)).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].fname, "b.mp3");
    }

    #[test]
    fn tombstone_entries_are_excluded_from_file_count() {
        let db = MediaDb::open_in_memory().unwrap();
        db.record("a.jpg", "abc", 10, 1).unwrap();
        assert_eq!(db.file_count().unwrap(), 1);
        db.record("a.jpg", "", 0, 2).unwrap();
        assert_eq!(db.file_count().unwrap(), 0);
    }
}
