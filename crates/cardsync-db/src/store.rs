//! Maps user keys to on-disk collection directories, and bootstraps a
//! brand-new collection the first time a user syncs.

use std::path::PathBuf;

use cardsync_core::error::{Error, Result};
use cardsync_core::ids::UserKey;
use tracing::instrument;

use crate::collection::CollectionHandle;

/// The minimal, current schema version a freshly bootstrapped
/// collection is created with.
const BOOTSTRAP_SCHEMA_VERSION: i64 = 18;

/// Owns the root directory under which every user's collection
/// subtree lives, and opens/creates collections within it.
pub struct CollectionStore {
    root: PathBuf,
}

impl CollectionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The directory holding everything belonging to `user`.
    pub fn user_dir(&self, user: &UserKey) -> PathBuf {
        self.root.join(sanitize_user_key(user))
    }

    /// Path to the primary collection database file for `user`.
    pub fn collection_path(&self, user: &UserKey) -> PathBuf {
        self.user_dir(user).join("collection.anki2")
    }

    /// Path to the media subtree for `user`.
    pub fn media_dir(&self, user: &UserKey) -> PathBuf {
        self.user_dir(user).join("media")
    }

    /// Path to the media entry log for `user`.
    pub fn media_db_path(&self, user: &UserKey) -> PathBuf {
        self.user_dir(user).join("media.server.db")
    }

    /// Open the user's collection, bootstrapping an empty one with the
    /// minimal sync-relevant schema if none exists yet.
    #[instrument(skip(self))]
    pub fn open_or_create(&self, user: &UserKey) -> Result<CollectionHandle> {
        let path = self.collection_path(user);
        let existed = path.exists();
        let handle = CollectionHandle::open(&path)?;
        if !existed {
            bootstrap_schema(&handle)?;
        }
        Ok(handle)
    }

    /// Whether a collection already exists for `user`.
    pub fn exists(&self, user: &UserKey) -> bool {
        self.collection_path(user).exists()
    }

    /// Atomically replace a user's collection file with uploaded bytes,
    /// used by the full-upload path. The previous file, if any, and its
    /// write-ahead-log auxiliaries are removed after the swap.
    #[instrument(skip(self, bytes))]
    pub fn replace_with_upload(&self, user: &UserKey, bytes: &[u8]) -> Result<()> {
        let dir = self.user_dir(user);
        std::fs::create_dir_all(&dir)?;
        let final_path = self.collection_path(user);
        let staging_path = dir.join("collection.anki2.upload");
        std::fs::write(&staging_path, bytes)?;

        // Validate before swapping in: open read-only and confirm the
        // schema version is one we understand.
        {
            let staged = CollectionHandle::open(&staging_path)?;
            staged.schema_version()?;
            staged.checkpoint()?;
        }

        for suffix in ["", "-wal", "-shm"] {
            let aux = PathBuf::from(format!("{}{suffix}", final_path.display()));
            let _ = std::fs::remove_file(aux);
        }
        std::fs::rename(&staging_path, &final_path)?;
        Ok(())
    }
}

fn sanitize_user_key(user: &UserKey) -> String {
    user.0
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

fn bootstrap_schema(handle: &CollectionHandle) -> Result<()> {
    handle.with_conn_mut(|conn| {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS col (ver INTEGER, mod INTEGER DEFAULT 0, scm INTEGER DEFAULT 0, usn INTEGER DEFAULT 0);
             CREATE TABLE IF NOT EXISTS notes (
                id INTEGER PRIMARY KEY, guid TEXT, mid INTEGER, mod INTEGER, usn INTEGER,
                tags TEXT, flds TEXT, sfld TEXT, csum INTEGER, flags INTEGER, data TEXT);
             CREATE TABLE IF NOT EXISTS cards (
                id INTEGER PRIMARY KEY, nid INTEGER, did INTEGER, ord INTEGER, mod INTEGER,
                usn INTEGER, type INTEGER, queue INTEGER, due INTEGER, ivl INTEGER,
                factor INTEGER, reps INTEGER, lapses INTEGER, left INTEGER, odue INTEGER,
                odid INTEGER, flags INTEGER, data TEXT);
             CREATE TABLE IF NOT EXISTS revlog (
                id INTEGER PRIMARY KEY, cid INTEGER, usn INTEGER, ease INTEGER, ivl INTEGER,
                lastivl INTEGER, factor INTEGER, time INTEGER, type INTEGER);
             CREATE TABLE IF NOT EXISTS decks (
                id INTEGER PRIMARY KEY, name TEXT, mod INTEGER, usn INTEGER, common TEXT, kind TEXT);
             CREATE TABLE IF NOT EXISTS deck_configs (
                id INTEGER PRIMARY KEY, name TEXT, mod INTEGER, usn INTEGER, config TEXT);
             CREATE TABLE IF NOT EXISTS note_types (
                id INTEGER PRIMARY KEY, name TEXT, mod INTEGER, usn INTEGER, config TEXT);
             CREATE TABLE IF NOT EXISTS tags (tag TEXT PRIMARY KEY, usn INTEGER);
             CREATE TABLE IF NOT EXISTS graves (kind TEXT, id INTEGER, usn INTEGER);
             CREATE TABLE IF NOT EXISTS config (key TEXT PRIMARY KEY, val TEXT);",
        )
        .map_err(|e| Error::Internal(format!("failed to bootstrap schema: {e}")))?;
        conn.execute(
            "INSERT INTO col (ver, mod, scm, usn) VALUES (?1, 0, 0, 0)",
            [BOOTSTRAP_SCHEMA_VERSION],
        )
        .map_err(|e| Error::Internal(format!("failed to write bootstrap version: {e}")))?;
        conn.execute(
            "INSERT INTO config (key, val) VALUES ('conf', '{}')",
            [],
        )
        .map_err(|e| Error::Internal(format!("failed to write bootstrap config: {e}")))?;
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstraps_a_fresh_collection_on_first_open() {
        let dir = tempfile::tempdir().unwrap();
        let store = CollectionStore::new(dir.path());
        let user = UserKey("alice".into());
        assert!(!store.exists(&user));

        let handle = store.open_or_create(&user).unwrap();
        assert_eq!(handle.schema_version().unwrap().0, 18);
        assert!(store.exists(&user));
    }

    #[test]
    fn reopening_an_existing_collection_does_not_reset_it() {
        let dir = tempfile::tempdir().unwrap();
        let store = CollectionStore::new(dir.path());
        let user = UserKey("bob".into());

        let handle = store.open_or_create(&user).unwrap();
        handle
            .with_conn_mut(|conn| {
                conn.execute("INSERT INTO notes (id, csum) VALUES (1, 5)", [])
                    .unwrap();
                Ok(())
            })
            .unwrap();
        drop(handle);

        let handle2 = store.open_or_create(&user).unwrap();
        let count: i64 = handle2
            .with_conn(|conn| Ok(conn.query_row("SELECT count(*) FROM notes", [], |r| r.get(0)).unwrap()))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn user_keys_with_unsafe_characters_are_sanitized() {
        let dir = tempfile::tempdir().unwrap();
        let store = CollectionStore::new(dir.path());
        let user = UserKey("weird/../user".into());
        let path = store.user_dir(&user);
        assert!(!path.to_string_lossy().contains(".."));
    }
}
