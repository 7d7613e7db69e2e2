// ABOUTME: Per-room OAuth credentials: hands out valid access tokens, refreshing under a per-room lock
// ABOUTME: Links rooms to organizations after the callback and tracks the authorization prompts it posted

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::ids::{MessageId, RoomId};
use crate::metrics;
use crate::pending::PendingAuthRegistry;
use crate::rooms::{ManagedOrg, OAuthToken, RoomStore};
use crate::traits::{MessageContent, Messenger, OrgAdmin, OrgInspection, TokenEndpoint, TokenError};

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("room {0} is not known")]
    UnknownRoom(String),
    #[error("room {0} needs to be authorized again")]
    ReauthorizationRequired(String),
    #[error("token refresh failed: {0}")]
    Refresh(#[source] TokenError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result of handing freshly exchanged tokens to the vault
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkOutcome {
    Linked { org_id: String, org_name: String },
    /// The token works but cannot administer its org, or could not be verified
    NotAdmin,
}

pub fn authorization_prompt(url: &str) -> String {
    format!("To get started, please authorize with your admin account:\n\n[Click here to authorize]({url})")
}

/// Owns every room's OAuth token and the handshake prompts
pub struct CredentialVault {
    store: Arc<RoomStore>,
    endpoint: Arc<dyn TokenEndpoint>,
    org_admin: Arc<dyn OrgAdmin>,
    messenger: Arc<dyn Messenger>,
    pending: Arc<PendingAuthRegistry>,
    bot_name: String,
    refresh_locks: Mutex<HashMap<RoomId, Arc<Mutex<()>>>>,
    /// state token -> prompt message to retract when the callback lands
    prompts: Mutex<HashMap<String, (RoomId, MessageId)>>,
}

impl CredentialVault {
    pub fn new(
        store: Arc<RoomStore>,
        endpoint: Arc<dyn TokenEndpoint>,
        org_admin: Arc<dyn OrgAdmin>,
        messenger: Arc<dyn Messenger>,
        pending: Arc<PendingAuthRegistry>,
    ) -> Self {
        Self {
            store,
            endpoint,
            org_admin,
            messenger,
            pending,
            bot_name: "boardbot".to_string(),
            refresh_locks: Mutex::new(HashMap::new()),
            prompts: Mutex::new(HashMap::new()),
        }
    }

    /// Name used when telling admins how to address the bot
    pub fn with_bot_name(mut self, name: impl Into<String>) -> Self {
        self.bot_name = name.into();
        self
    }

    pub fn pending(&self) -> &Arc<PendingAuthRegistry> {
        &self.pending
    }

    pub fn endpoint(&self) -> &Arc<dyn TokenEndpoint> {
        &self.endpoint
    }

    async fn room_lock(&self, room_id: &RoomId) -> Arc<Mutex<()>> {
        self.refresh_locks
            .lock()
            .await
            .entry(room_id.clone())
            .or_default()
            .clone()
    }

    /// A usable access token for the room, refreshing it first when expired.
    ///
    /// Concurrent callers for one room share a single refresh round trip.
    pub async fn get_valid_token(&self, room_id: &RoomId) -> Result<String, VaultError> {
        let lock = self.room_lock(room_id).await;
        let _guard = lock.lock().await;

        let room = self
            .store
            .get(room_id)
            .await
            .ok_or_else(|| VaultError::UnknownRoom(room_id.to_string()))?;
        let linked = room.managed_org.is_linked();
        let Some(token) = room.managed_org.oauth_tokens.filter(|_| linked) else {
            return Err(VaultError::ReauthorizationRequired(room_id.to_string()));
        };

        let now = Utc::now();
        if token.is_valid_at(now) {
            return Ok(token.access_token);
        }

        let Some(refresh_token) = token.refresh_token() else {
            tracing::warn!(room_id = %room_id, "Access token expired and no refresh token stored");
            metrics::record_token_refresh("missing");
            self.clear_link(room_id).await;
            return Err(VaultError::ReauthorizationRequired(room_id.to_string()));
        };

        tracing::info!(room_id = %room_id, "Access token missing or expired, refreshing");
        match self.endpoint.refresh(refresh_token).await {
            Ok(grant) => {
                let refreshed = OAuthToken {
                    expires_at: grant.expires_at(now).max(token.expires_at),
                    refresh_token: grant
                        .refresh_token
                        .filter(|t| !t.is_empty())
                        .or_else(|| token.refresh_token.clone()),
                    access_token: grant.access_token,
                };
                let access = refreshed.access_token.clone();
                self.store
                    .update(room_id, |room| room.managed_org.oauth_tokens = Some(refreshed))
                    .await
                    .ok_or_else(|| VaultError::UnknownRoom(room_id.to_string()))?;
                self.store.persist().await;
                metrics::record_token_refresh("success");
                Ok(access)
            }
            Err(TokenError::Rejected { status, body }) => {
                tracing::warn!(room_id = %room_id, status, body = %body, "Refresh token rejected");
                metrics::record_token_refresh("rejected");
                self.clear_link(room_id).await;
                Err(VaultError::ReauthorizationRequired(room_id.to_string()))
            }
            Err(e) => {
                tracing::error!(room_id = %room_id, error = %e, "Token refresh failed");
                metrics::record_token_refresh("transport");
                Err(VaultError::Refresh(e))
            }
        }
    }

    /// Link the room to the org behind freshly exchanged tokens.
    ///
    /// Retracts the prompt tied to `state`. A token that cannot administer its
    /// org leaves the room unlinked and posts a new prompt.
    pub async fn store_tokens(
        &self,
        room_id: &RoomId,
        state: &str,
        access_token: String,
        refresh_token: Option<String>,
        expires_at: DateTime<Utc>,
    ) -> Result<LinkOutcome, VaultError> {
        if self.store.get(room_id).await.is_none() {
            return Err(VaultError::UnknownRoom(room_id.to_string()));
        }
        self.retract_prompt(state).await;

        let inspection = match self.org_admin.inspect(&access_token).await {
            Ok(inspection) => Some(inspection),
            Err(e) => {
                tracing::warn!(room_id = %room_id, error = %e, "Could not inspect authorized token");
                None
            }
        };

        let inspection = match inspection {
            Some(i) if i.has_admin_access && !i.org_id.is_empty() => i,
            other => return self.reject_link(room_id, other.as_ref()).await,
        };

        let lock = self.room_lock(room_id).await;
        let _guard = lock.lock().await;
        let OrgInspection {
            admin_name,
            admin_email,
            org_id,
            org_name,
            ..
        } = inspection;
        let managed = ManagedOrg {
            org_id: org_id.clone(),
            org_name: org_name.clone(),
            oauth_tokens: Some(OAuthToken {
                access_token,
                refresh_token,
                expires_at,
            }),
        };
        self.store
            .update(room_id, |room| room.managed_org = managed)
            .await
            .ok_or_else(|| VaultError::UnknownRoom(room_id.to_string()))?;
        self.store.persist().await;

        tracing::info!(room_id = %room_id, org_id = %org_id, org_name = %org_name, "Stored tokens for room");
        self.notify(
            room_id,
            MessageContent::markdown(format!(
                "Successfully authorized organization **{org_name}** with admin {admin_name}({admin_email}).  \
                 You can now request activation codes by saying *@{} hello*.",
                self.bot_name
            )),
        )
        .await;

        Ok(LinkOutcome::Linked { org_id, org_name })
    }

    async fn reject_link(
        &self,
        room_id: &RoomId,
        inspection: Option<&OrgInspection>,
    ) -> Result<LinkOutcome, VaultError> {
        tracing::warn!(room_id = %room_id, "Authorized account lacks org admin rights");
        let who = match inspection {
            Some(i) => format!(
                "{}({}) doesn't have admin rights on organization **{}**",
                i.admin_name, i.admin_email, i.org_name
            ),
            None => "The authorizing account doesn't have admin rights on its organization".to_string(),
        };
        self.notify(
            room_id,
            MessageContent::markdown(format!(
                "{who} or the token is invalid.\nPlease try authorizing again."
            )),
        )
        .await;
        self.clear_link(room_id).await;
        self.request_authorization(room_id).await?;
        Ok(LinkOutcome::NotAdmin)
    }

    /// True when the room manages an org; otherwise posts an authorization prompt and returns false
    pub async fn ensure_linked(&self, room_id: &RoomId) -> Result<bool, VaultError> {
        let room = self
            .store
            .get(room_id)
            .await
            .ok_or_else(|| VaultError::UnknownRoom(room_id.to_string()))?;
        if room.managed_org.is_linked() {
            return Ok(true);
        }
        self.request_authorization(room_id).await?;
        Ok(false)
    }

    /// Start a handshake for the room and post the authorization link. Returns the state token.
    pub async fn request_authorization(&self, room_id: &RoomId) -> Result<String, VaultError> {
        let state = self.pending.create(room_id).await;
        let url = self.endpoint.authorize_url(&state);
        let sent = self
            .messenger
            .send(room_id, MessageContent::markdown(authorization_prompt(&url)))
            .await;
        match sent {
            Ok(message_id) => {
                self.prompts
                    .lock()
                    .await
                    .insert(state.clone(), (room_id.clone(), message_id));
                tracing::info!(room_id = %room_id, "Authorization prompt posted");
                Ok(state)
            }
            Err(e) => {
                self.pending.consume(&state).await;
                Err(VaultError::Other(e.context("Failed to post authorization prompt")))
            }
        }
    }

    /// Drop the org link and tokens; admin and authorized users stay
    pub async fn unlink(&self, room_id: &RoomId) -> Result<(), VaultError> {
        let lock = self.room_lock(room_id).await;
        let _guard = lock.lock().await;
        self.store
            .update(room_id, |room| room.managed_org = ManagedOrg::default())
            .await
            .ok_or_else(|| VaultError::UnknownRoom(room_id.to_string()))?;
        self.store.persist().await;
        tracing::info!(room_id = %room_id, "Removed managed organization from room");
        Ok(())
    }

    /// Discard handshakes, prompts and the lock for a room the bot left
    pub async fn forget_room(&self, room_id: &RoomId) {
        let states = self.pending.forget_room(room_id).await;
        let mut prompts = self.prompts.lock().await;
        for state in states {
            prompts.remove(&state);
        }
        prompts.retain(|_, (room, _)| room != room_id);
        drop(prompts);
        self.refresh_locks.lock().await.remove(room_id);
    }

    /// Expire old handshakes and forget their prompts. Returns how many handshakes were dropped.
    ///
    /// Only prompts of the expired handshakes are dropped; a state consumed by a
    /// callback still in flight keeps its prompt until that callback retracts it.
    pub async fn purge_expired(&self) -> usize {
        let expired = self.pending.purge_expired().await;
        if !expired.is_empty() {
            let mut prompts = self.prompts.lock().await;
            for state in &expired {
                prompts.remove(state);
            }
        }
        expired.len()
    }

    pub async fn prompt_count(&self) -> usize {
        self.prompts.lock().await.len()
    }

    async fn retract_prompt(&self, state: &str) {
        let Some((room_id, message_id)) = self.prompts.lock().await.remove(state) else {
            return;
        };
        if let Err(e) = self.messenger.delete(&message_id).await {
            tracing::warn!(room_id = %room_id, error = %e, "Failed to retract authorization prompt");
        }
    }

    async fn clear_link(&self, room_id: &RoomId) {
        let cleared = self
            .store
            .update(room_id, |room| room.managed_org = ManagedOrg::default())
            .await
            .is_some();
        if cleared {
            tracing::info!(room_id = %room_id, "Room now needs authorization");
            self.store.persist().await;
        }
    }

    async fn notify(&self, room_id: &RoomId, content: MessageContent) {
        if let Err(e) = self.messenger.send(room_id, content).await {
            tracing::warn!(room_id = %room_id, error = %e, "Failed to send credential notice");
        }
    }
}
