//! The `/msync/*` endpoints. Each request opens (or reuses) the
//! user's media engine and runs under the same per-user exclusivity
//! lock the collection engine uses, so a media sync and a collection
//! sync for the same user never interleave.

use std::collections::HashMap;
use std::sync::Arc;

use cardsync_core::error::Result;
use cardsync_core::ids::UserKey;
use cardsync_core::usn::Usn;
use cardsync_db::CollectionStore;
use cardsync_media::{MediaDb, MediaEngine, MediaStore};
use cardsync_users::UserLocks;
use parking_lot::Mutex;
use tracing::instrument;

use crate::wire::{BeginData, MediaChangeEntry, MediaEnvelope, UploadChangesData};

/// Owns a lazily-opened [`MediaEngine`] per user and the lock that
/// serializes media and collection syncs for that user.
pub struct MediaSyncService {
    store: Arc<CollectionStore>,
    user_locks: UserLocks,
    engines: Mutex<HashMap<UserKey, Arc<MediaEngine>>>,
}

impl MediaSyncService {
    pub fn new(store: Arc<CollectionStore>, user_locks: UserLocks) -> Self {
        Self {
            store,
            user_locks,
            engines: Mutex::new(HashMap::new()),
        }
    }

    fn engine_for(&self, user: &UserKey) -> Result<Arc<MediaEngine>> {
        if let Some(engine) = self.engines.lock().get(user) {
            return Ok(Arc::clone(engine));
        }
        let db = MediaDb::open(self.store.media_db_path(user))?;
        let store = MediaStore::new(self.store.media_dir(user));
        let engine = Arc::new(MediaEngine::new(db, store));
        self.engines.lock().insert(user.clone(), Arc::clone(&engine));
        Ok(engine)
    }

    /// The user's current media USN, without acquiring the per-user sync
    /// lock. Used by [`crate::collection_sync::CollectionSyncEngine::meta`]
    /// to report `musn`, which is a synchronous, read-only query and must
    /// not block on an in-flight media sync for the same user.
    #[instrument(skip(self))]
    pub fn current_media_usn(&self, user: &UserKey) -> Result<Usn> {
        let engine = self.engine_for(user)?;
        Ok(engine.begin()?.usn)
    }

    #[instrument(skip(self))]
    pub async fn begin(&self, user: &UserKey, sk: String) -> Result<MediaEnvelope<BeginData>> {
        let _guard = self.user_locks.try_acquire(user).await?;
        let engine = self.engine_for(user)?;
        let result = engine.begin()?;
        Ok(MediaEnvelope::ok(BeginData { usn: result.usn.0, sk }))
    }

    #[instrument(skip(self))]
    pub async fn media_changes(&self, user: &UserKey, last_usn: i64) -> Result<Vec<MediaChangeEntry>> {
        let _guard = self.user_locks.try_acquire(user).await?;
        let engine = self.engine_for(user)?;
        let changes = engine.media_changes(Usn(last_usn))?;
        Ok(changes
            .into_iter()
            .map(|(fname, usn, sha1)| MediaChangeEntry(fname, usn, sha1))
            .collect())
    }

    #[instrument(skip(self, archive_bytes))]
    pub async fn upload_changes(&self, user: &UserKey, archive_bytes: &[u8]) -> Result<MediaEnvelope<UploadChangesData>> {
        let _guard = self.user_locks.try_acquire(user).await?;
        let engine = self.engine_for(user)?;
        let result = engine.upload_changes(archive_bytes)?;
        Ok(MediaEnvelope::ok(UploadChangesData {
            processed: result.processed,
            current_usn: result.current_usn.0,
        }))
    }

    #[instrument(skip(self))]
    pub async fn download_files(&self, user: &UserKey, filenames: &[String]) -> Result<Vec<u8>> {
        let _guard = self.user_locks.try_acquire(user).await?;
        let engine = self.engine_for(user)?;
        engine.download_files(filenames)
    }

    #[instrument(skip(self))]
    pub async fn media_sanity(&self, user: &UserKey, local_count: i64) -> Result<MediaEnvelope<&'static str>> {
        let _guard = self.user_locks.try_acquire(user).await?;
        let engine = self.engine_for(user)?;
        let ok = engine.media_sanity(local_count)?;
        Ok(MediaEnvelope::ok(if ok { "OK" } else { "FAILED" }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn begin_and_media_changes_round_trip_through_the_service() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CollectionStore::new(dir.path()));
        let service = MediaSyncService::new(store, UserLocks::new());
        let user = UserKey("alice".into());

        let begin = service.begin(&user, "sk".into()).await.unwrap();
        assert_eq!(begin.data.usn, 0);

        let changes = service.media_changes(&user, 0).await.unwrap();
        assert!(changes.is_empty());
    }

    #[tokio::test]
    async fn media_sanity_reflects_uploaded_file_count() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CollectionStore::new(dir.path()));
        let service = MediaSyncService::new(store, UserLocks::new());
        let user = UserKey("alice".into());

        let archive = cardsync_media::archive::encode_archive(vec![cardsync_media::archive::OutgoingFile {
            real_name: "a.jpg".into(),
            bytes: b"hi".to_vec(),
        }])
        .unwrap();
        service.upload_changes(&user, &archive).await.unwrap();

        let sanity = service.media_sanity(&user, 1).await.unwrap();
        assert_eq!(sanity.data, "OK");
    }
}
