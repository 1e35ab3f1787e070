//! Shared application state handed to every handler.

use std::sync::Arc;

use cardsync_core::config::ServerConfig;
use cardsync_db::CollectionStore;
use cardsync_users::{IdentityGateway, SessionRegistry, UserLocks};

use crate::collection_sync::CollectionSyncEngine;
use crate::hostkey::HostKeyService;
use crate::media_sync::MediaSyncService;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub sessions: Arc<SessionRegistry>,
    pub user_locks: UserLocks,
    pub collection_sync: Arc<CollectionSyncEngine>,
    pub media_sync: Arc<MediaSyncService>,
    pub host_key: Arc<HostKeyService>,
}

impl AppState {
    pub fn new(
        config: ServerConfig,
        store: Arc<CollectionStore>,
        sessions: Arc<SessionRegistry>,
        identity: Arc<dyn IdentityGateway>,
    ) -> Self {
        let user_locks = UserLocks::new();
        let media_sync = Arc::new(MediaSyncService::new(Arc::clone(&store), user_locks.clone()));
        Self {
            config: Arc::new(config),
            sessions: Arc::clone(&sessions),
            user_locks: user_locks.clone(),
            collection_sync: Arc::new(CollectionSyncEngine::new(store, Arc::clone(&media_sync))),
            media_sync,
            host_key: Arc::new(HostKeyService::new(identity, sessions)),
        }
    }
}
