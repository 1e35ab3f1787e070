//! The media sync engine: the logic backing the `/msync/*` endpoints,
//! independent of how the bytes arrive over the wire.

use cardsync_core::error::Result;
use cardsync_core::usn::Usn;
use tracing::instrument;

use crate::archive::{decode_archive, encode_archive, OutgoingFile};
use crate::db::MediaDb;
use crate::store::{sha1_hex, MediaStore};

/// Result of a successful `begin`.
pub struct BeginResult {
    pub usn: Usn,
}

/// Result of a successful `uploadChanges`.
pub struct UploadResult {
    pub processed: usize,
    pub current_usn: Usn,
}

/// Drives the media log and filesystem bag for one user. Callers are
/// responsible for holding the per-user exclusivity lock before
/// invoking any method here.
pub struct MediaEngine {
    db: MediaDb,
    store: MediaStore,
}

impl MediaEngine {
    pub fn new(db: MediaDb, store: MediaStore) -> Self {
        Self { db, store }
    }

    /// Idempotent: returns the current media USN.
    #[instrument(skip(self))]
    pub fn begin(&self) -> Result<BeginResult> {
        Ok(BeginResult {
            usn: self.db.current_usn()?,
        })
    }

    /// Entries strictly newer than `last_usn`, in the flat array shape
    /// clients expect (not wrapped in an envelope object).
    #[instrument(skip(self))]
    pub fn media_changes(&self, last_usn: Usn) -> Result<Vec<(String, i64, String)>> {
        let entries = self.db.changes_since(last_usn)?;
        Ok(entries
            .into_iter()
            .map(|e| (e.fname, e.usn, e.sha1))
            .collect())
    }

    /// Apply an uploaded batch archive: one USN is consumed per write
    /// (addition or deletion), and the returned USN is that of the last
    /// applied change, not necessarily the log's maximum.
    #[instrument(skip(self, archive_bytes))]
    pub fn upload_changes(&self, archive_bytes: &[u8]) -> Result<UploadResult> {
        let entries = decode_archive(archive_bytes)?;
        let mut processed = 0usize;
        let mut last_usn = self.db.current_usn()?;

        for entry in entries {
            if entry.meta.real_name().is_empty() {
                // Deletion: the filename being removed travels in the
                // `member` slot since there is no zip member to name it.
                let target = entry.meta.member();
                self.store.remove(target)?;
                last_usn = self.db.record(target, "", 0, now_secs())?;
            } else {
                let bytes = entry.bytes.unwrap_or_default();
                let sha1 = sha1_hex(&bytes);
                let normalized = self.store.write(entry.meta.real_name(), &bytes)?;
                last_usn = self.db.record(&normalized, &sha1, bytes.len() as i64, now_secs())?;
            }
            processed += 1;
        }

        Ok(UploadResult {
            processed,
            current_usn: last_usn,
        })
    }

    /// Package the requested filenames into a downloadable archive.
    #[instrument(skip(self))]
    pub fn download_files(&self, filenames: &[String]) -> Result<Vec<u8>> {
        let mut files = Vec::with_capacity(filenames.len());
        for name in filenames {
            let bytes = self.store.read(name)?;
            files.push(OutgoingFile {
                real_name: name.clone(),
                bytes,
            });
        }
        encode_archive(files)
    }

    /// Compare the client's reported local file count against the
    /// server's non-tombstone entry count.
    #[instrument(skip(self))]
    pub fn media_sanity(&self, local_count: i64) -> Result<bool> {
        Ok(self.db.file_count()? == local_count)
    }
}

fn now_secs() -> i64 {
    cardsync_core::time::now_ms() / 1000
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{encode_archive as build_archive, OutgoingFile as ArchiveFile};

    fn setup() -> (MediaEngine, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = MediaDb::open_in_memory().unwrap();
        let store = MediaStore::new(dir.path());
        (MediaEngine::new(db, store), dir)
    }

    #[test]
    fn begin_reports_current_usn() {
        let (engine, _dir) = setup();
        assert_eq!(engine.begin().unwrap().usn, Usn(0));
    }

    #[test]
    fn media_changes_returns_empty_array_when_caught_up() {
        let (engine, _dir) = setup();
        let changes = engine.media_changes(Usn(0)).unwrap();
        assert!(changes.is_empty());
    }

    #[test]
    fn upload_then_changes_reflects_new_entries_in_order() {
        let (engine, _dir) = setup();
        let archive = build_archive(vec![
            ArchiveFile {
                real_name: "a.jpg".into(),
                bytes: b"one".to_vec(),
            },
            ArchiveFile {
                real_name: "b.mp3".into(),
                bytes: b"two".to_vec(),
            },
        ])
        .unwrap();

        let result = engine.upload_changes(&archive).unwrap();
        assert_eq!(result.processed, 2);

        let changes = engine.media_changes(Usn(0)).unwrap();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].0, "a.jpg");
        assert_eq!(changes[1].0, "b.mp3");
    }

    #[test]
    fn media_sanity_matches_non_tombstone_count() {
        let (engine, _dir) = setup();
        let archive = build_archive(vec![ArchiveFile {
            real_name: "a.jpg".into(),
            bytes: b"one".to_vec(),
        }])
        .unwrap();
        engine.upload_changes(&archive).unwrap();

        assert!(engine.media_sanity(1).unwrap());
        assert!(!engine.media_sanity(2).unwrap());
    }
}
