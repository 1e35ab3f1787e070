//! Persisted session registry and the per-user exclusivity lock that
//! backs the "busy" error when two syncs for the same user overlap.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use cardsync_core::error::{Error, Result};
use cardsync_core::ids::{HostId, SessionKey, UserKey};
use cardsync_core::time::now_ms;
use parking_lot::Mutex as SyncMutex;
use rusqlite::Connection;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::instrument;

/// A minted session: a bearer key bound to one user and one of their
/// devices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub key: SessionKey,
    pub user: UserKey,
    pub host: HostId,
    pub created_at: i64,
}

/// Session storage, persisted so a server restart does not invalidate
/// a client's in-flight login.
pub struct SessionRegistry {
    conn: Arc<SyncMutex<Connection>>,
}

impl SessionRegistry {
    #[instrument(fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path.as_ref())
            .map_err(|e| Error::Internal(format!("failed to open session db: {e}")))?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(SyncMutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Internal(format!("failed to open in-memory session db: {e}")))?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(SyncMutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sessions (
                session_key TEXT PRIMARY KEY,
                user_key TEXT NOT NULL,
                host_id TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );",
        )
        .map_err(|e| Error::Internal(format!("failed to create sessions table: {e}")))?;
        Ok(())
    }

    /// Mint and persist a new session for `user`/`host`.
    #[instrument(skip(self))]
    pub fn create(&self, user: UserKey, host: HostId) -> Result<Session> {
        let session = Session {
            key: SessionKey::generate(),
            user,
            host,
            created_at: now_ms(),
        };
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO sessions (session_key, user_key, host_id, created_at) VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![session.key.0, session.user.0, session.host.0, session.created_at],
        )
        .map_err(|e| Error::Internal(format!("failed to persist session: {e}")))?;
        Ok(session)
    }

    /// Resolve a session key presented by a client. Unknown or
    /// malformed keys are an "unauthorized" error distinct from the
    /// "expected auth" discovery-probe response.
    #[instrument(skip(self, key))]
    pub fn resolve(&self, key: &SessionKey) -> Result<Session> {
        if key.0.is_empty() {
            return Err(Error::ExpectedAuth);
        }
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT user_key, host_id, created_at FROM sessions WHERE session_key = ?1",
            [&key.0],
            |row| {
                Ok(Session {
                    key: key.clone(),
                    user: UserKey(row.get(0)?),
                    host: HostId(row.get(1)?),
                    created_at: row.get(2)?,
                })
            },
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Error::Unauthorized("unknown session key".into()),
            other => Error::Internal(format!("failed to resolve session: {other}")),
        })
    }
}

/// Enforces "at most one active sync transaction per user" by handing
/// out an owned lock guard; a second concurrent attempt for the same
/// user fails fast with [`Error::Busy`] instead of queueing.
#[derive(Clone, Default)]
pub struct UserLocks {
    locks: Arc<SyncMutex<HashMap<UserKey, Arc<AsyncMutex<()>>>>>,
}

impl UserLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, user: &UserKey) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock();
        locks
            .entry(user.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Acquire the per-user lock without blocking; fails with
    /// [`Error::Busy`] if another transaction already holds it.
    pub async fn try_acquire(&self, user: &UserKey) -> Result<OwnedMutexGuard<()>> {
        let lock = self.lock_for(user);
        lock.try_lock_owned().map_err(|_| Error::Busy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_resolve_round_trips() {
        let registry = SessionRegistry::open_in_memory().unwrap();
        let session = registry
            .create(UserKey("alice".into()), HostId("phone".into()))
            .unwrap();

        let resolved = registry.resolve(&session.key).unwrap();
        assert_eq!(resolved.user, UserKey("alice".into()));
        assert_eq!(resolved.host, HostId("phone".into()));
    }

    #[test]
    fn empty_key_is_expected_auth_not_unauthorized() {
        let registry = SessionRegistry::open_in_memory().unwrap();
        let err = registry.resolve(&SessionKey(String::new())).unwrap_err();
        assert!(matches!(err, Error::ExpectedAuth));
    }

    #[test]
    fn unknown_key_is_unauthorized() {
        let registry = SessionRegistry::open_in_memory().unwrap();
        let err = registry.resolve(&SessionKey("nope".into())).unwrap_err();
        assert!(matches!(err, Error::Unauthorized(_)));
    }

    #[tokio::test]
    async fn second_concurrent_lock_for_same_user_is_busy() {
        let locks = UserLocks::new();
        let user = UserKey("alice".into());
        let _first = locks.try_acquire(&user).await.unwrap();
        let second = locks.try_acquire(&user).await;
        assert!(matches!(second, Err(Error::Busy)));
    }

    #[tokio::test]
    async fn lock_is_released_when_guard_drops() {
        let locks = UserLocks::new();
        let user = UserKey("alice".into());
        {
            let _guard = locks.try_acquire(&user).await.unwrap();
        }
        assert!(locks.try_acquire(&user).await.is_ok());
    }

    #[tokio::test]
    async fn different_users_do_not_contend() {
        let locks = UserLocks::new();
        let _a = locks.try_acquire(&UserKey("alice".into())).await.unwrap();
        let b = locks.try_acquire(&UserKey("bob".into())).await;
        assert!(b.is_ok());
    }
}
