//! Identity verification. The core sync engines never see a raw
//! password; they only ever receive a [`UserKey`] back from a gateway
//! implementation.

use std::path::Path;
use std::sync::Arc;

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use async_trait::async_trait;
use cardsync_core::error::{Error, Result};
use cardsync_core::ids::UserKey;
use parking_lot::Mutex;
use rand::rngs::OsRng;
use rusqlite::Connection;
use tracing::instrument;

/// Translates `(identifier, secret)` into a stable [`UserKey`], or
/// rejects. A real deployment may swap in an external identity
/// provider without the sync engines knowing the difference.
#[async_trait]
pub trait IdentityGateway: Send + Sync {
    async fn authenticate(&self, identifier: &str, secret: &str) -> Result<UserKey>;
}

/// A local identity gateway backed by an argon2-hashed user table.
/// Suitable for a self-hosted single-server deployment.
pub struct LocalIdentityGateway {
    conn: Arc<Mutex<Connection>>,
}

impl LocalIdentityGateway {
    #[instrument(fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path.as_ref())
            .map_err(|e| Error::Internal(format!("failed to open user db: {e}")))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS users (
                identifier TEXT PRIMARY KEY,
                user_key TEXT NOT NULL,
                password_hash TEXT NOT NULL
            );",
        )
        .map_err(|e| Error::Internal(format!("failed to create users table: {e}")))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Internal(format!("failed to open in-memory user db: {e}")))?;
        conn.execute_batch(
            "CREATE TABLE users (
                identifier TEXT PRIMARY KEY,
                user_key TEXT NOT NULL,
                password_hash TEXT NOT NULL
            );",
        )
        .map_err(|e| Error::Internal(format!("failed to create users table: {e}")))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create (or overwrite) a user's credentials.
    pub fn upsert_user(&self, identifier: &str, user_key: &UserKey, password: &str) -> Result<()> {
        let salt = SaltString::generate(&mut OsRng);
        let argon2 = Argon2::default();
        let hash = argon2
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| Error::Internal(format!("failed to hash password: {e}")))?
            .to_string();

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO users (identifier, user_key, password_hash) VALUES (?1, ?2, ?3) \
             ON CONFLICT(identifier) DO UPDATE SET user_key = excluded.user_key, password_hash = excluded.password_hash",
            rusqlite::params![identifier, user_key.0, hash],
        )
        .map_err(|e| Error::Internal(format!("failed to upsert user: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl IdentityGateway for LocalIdentityGateway {
    #[instrument(skip(self, secret))]
    async fn authenticate(&self, identifier: &str, secret: &str) -> Result<UserKey> {
        let row = {
            let conn = self.conn.lock();
            conn.query_row(
                "SELECT user_key, password_hash FROM users WHERE identifier = ?1",
                [identifier],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(Error::Internal(format!("failed to read user: {other}"))),
            })?
        };

        let Some((user_key, hash)) = row else {
            return Err(Error::InvalidCredentials);
        };

        let parsed = PasswordHash::new(&hash)
            .map_err(|e| Error::Internal(format!("corrupt password hash: {e}")))?;
        Argon2::default()
            .verify_password(secret.as_bytes(), &parsed)
            .map_err(|_| Error::InvalidCredentials)?;

        Ok(UserKey(user_key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn correct_password_authenticates() {
        let gateway = LocalIdentityGateway::open_in_memory().unwrap();
        gateway
            .upsert_user("alice", &UserKey("user-alice".into()), "hunter2")
            .unwrap();

        let user = gateway.authenticate("alice", "hunter2").await.unwrap();
        assert_eq!(user, UserKey("user-alice".into()));
    }

    #[tokio::test]
    async fn wrong_password_is_rejected() {
        let gateway = LocalIdentityGateway::open_in_memory().unwrap();
        gateway
            .upsert_user("alice", &UserKey("user-alice".into()), "hunter2")
            .unwrap();

        let err = gateway.authenticate("alice", "wrong").await.unwrap_err();
        assert!(matches!(err, Error::InvalidCredentials));
    }

    #[tokio::test]
    async fn unknown_identifier_is_rejected() {
        let gateway = LocalIdentityGateway::open_in_memory().unwrap();
        let err = gateway.authenticate("ghost", "anything").await.unwrap_err();
        assert!(matches!(err, Error::InvalidCredentials));
    }
}
