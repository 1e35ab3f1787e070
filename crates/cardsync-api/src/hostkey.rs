//! `/sync/hostKey`: login and session minting.

use std::sync::Arc;

use cardsync_core::error::{Error, Result};
use cardsync_core::ids::HostId;
use cardsync_users::{IdentityGateway, SessionRegistry};
use tracing::instrument;

use crate::wire::{HostKeyRequest, HostKeyResponse};

pub struct HostKeyService {
    gateway: Arc<dyn IdentityGateway>,
    sessions: Arc<SessionRegistry>,
}

impl HostKeyService {
    pub fn new(gateway: Arc<dyn IdentityGateway>, sessions: Arc<SessionRegistry>) -> Self {
        Self { gateway, sessions }
    }

    /// An empty body (no `u`/`p`) is a discovery probe: the client is
    /// asking "do you require login", and must be told yes via the
    /// "expected auth" error rather than a hard authentication failure.
    #[instrument(skip(self, req))]
    pub async fn host_key(&self, host: HostId, req: HostKeyRequest) -> Result<HostKeyResponse> {
        let (Some(u), Some(p)) = (req.u, req.p) else {
            return Err(Error::ExpectedAuth);
        };

        let user = self.gateway.authenticate(&u, &p).await?;
        let session = self.sessions.create(user, host)?;
        Ok(HostKeyResponse {
            key: session.key.0,
            host: session.host.0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cardsync_core::ids::UserKey;
    use cardsync_users::LocalIdentityGateway;

    #[tokio::test]
    async fn discovery_probe_with_no_credentials_is_expected_auth() {
        let gateway = Arc::new(LocalIdentityGateway::open_in_memory().unwrap());
        let sessions = Arc::new(SessionRegistry::open_in_memory().unwrap());
        let service = HostKeyService::new(gateway, sessions);

        let err = service
            .host_key(HostId("phone".into()), HostKeyRequest { u: None, p: None })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ExpectedAuth));
    }

    #[tokio::test]
    async fn valid_credentials_mint_a_session() {
        let gateway = Arc::new(LocalIdentityGateway::open_in_memory().unwrap());
        gateway
            .upsert_user("alice", &UserKey("user-alice".into()), "hunter2")
            .unwrap();
        let sessions = Arc::new(SessionRegistry::open_in_memory().unwrap());
        let service = HostKeyService::new(gateway, sessions);

        let resp = service
            .host_key(
                HostId("phone".into()),
                HostKeyRequest {
                    u: Some("alice".into()),
                    p: Some("hunter2".into()),
                },
            )
            .await
            .unwrap();
        assert!(!resp.key.is_empty());
    }
}
