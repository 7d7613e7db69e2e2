// ABOUTME: Collaborator traits the core talks to: messaging, room directory, OAuth token endpoint, org admin API
// ABOUTME: Implemented for Webex in the binary crate and by recording doubles in `testing`

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use thiserror::Error;

use crate::ids::{AttachmentActionId, MessageId, PersonId, RoomId};

// =============================================================================
// Message Content Types
// =============================================================================

/// Content that can be posted to a room
#[derive(Debug, Clone, PartialEq)]
pub enum MessageContent {
    Plain(String),
    Markdown(String),
    /// Adaptive card with fallback text for clients that cannot render it
    Card {
        text: String,
        card: serde_json::Value,
    },
}

impl MessageContent {
    pub fn plain(text: impl Into<String>) -> Self {
        Self::Plain(text.into())
    }

    pub fn markdown(text: impl Into<String>) -> Self {
        Self::Markdown(text.into())
    }

    /// The human-readable part, whatever the variant
    pub fn text(&self) -> &str {
        match self {
            Self::Plain(text) | Self::Markdown(text) => text,
            Self::Card { text, .. } => text,
        }
    }
}

/// A message fetched back from the platform after a `post` activity
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub id: MessageId,
    pub room_id: RoomId,
    pub person_id: PersonId,
    pub person_email: Option<String>,
    pub text: Option<String>,
}

/// Inputs submitted from an adaptive card
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CardSubmission {
    pub id: Option<AttachmentActionId>,
    pub inputs: HashMap<String, serde_json::Value>,
}

impl CardSubmission {
    /// Trimmed string input, empty when absent or not a string
    pub fn input(&self, name: &str) -> &str {
        self.inputs
            .get(name)
            .and_then(|v| v.as_str())
            .map(str::trim)
            .unwrap_or("")
    }
}

/// Room metadata from the directory
#[derive(Debug, Clone, PartialEq)]
pub struct RoomDetails {
    pub id: RoomId,
    pub title: String,
    pub is_direct: bool,
    pub creator_id: Option<PersonId>,
}

// =============================================================================
// Messaging and directory
// =============================================================================

/// Posting, retracting and reading back messages
#[async_trait]
pub trait Messenger: Send + Sync {
    async fn send(&self, room: &RoomId, content: MessageContent) -> Result<MessageId>;

    async fn delete(&self, message: &MessageId) -> Result<()>;

    async fn fetch_message(&self, message: &MessageId) -> Result<InboundMessage>;

    async fn fetch_card_action(&self, action: &AttachmentActionId) -> Result<CardSubmission>;
}

/// Room and membership lookups
#[async_trait]
pub trait Directory: Send + Sync {
    async fn room(&self, room: &RoomId) -> Result<RoomDetails>;

    /// The member of `room` with this email, if any
    async fn person_for_email(&self, room: &RoomId, email: &str) -> Result<Option<PersonId>>;

    /// Email of a member of `room`, if they are one
    async fn email_for_person(&self, room: &RoomId, person: &PersonId) -> Result<Option<String>>;

    /// Primary email of any person, used for direct-room creators
    async fn person_email(&self, person: &PersonId) -> Result<Option<String>>;

    /// Every room the bot is currently a member of
    async fn joined_rooms(&self) -> Result<Vec<RoomId>>;
}

// =============================================================================
// OAuth
// =============================================================================

#[derive(Debug, Error)]
pub enum TokenError {
    /// The provider answered and refused (bad code, revoked refresh token)
    #[error("token endpoint rejected the request ({status}): {body}")]
    Rejected { status: u16, body: String },
    /// No usable answer from the provider
    #[error("token endpoint unreachable: {0}")]
    Transport(String),
}

/// Lifetimes beyond ten years are clamped
const MAX_LIFETIME_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// What the token endpoint returns for a code exchange or refresh
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: Option<u64>,
}

impl TokenGrant {
    /// Absolute expiry; a grant without a lifetime is treated as already expired
    pub fn expires_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let secs = self.expires_in.unwrap_or(0).min(MAX_LIFETIME_SECS);
        now + ChronoDuration::seconds(secs as i64)
    }
}

#[async_trait]
pub trait TokenEndpoint: Send + Sync {
    /// Browser URL for the authorization handshake carrying `state`
    fn authorize_url(&self, state: &str) -> String;

    async fn exchange_code(&self, code: &str) -> Result<TokenGrant, TokenError>;

    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, TokenError>;
}

// =============================================================================
// Organization administration
// =============================================================================

/// Who an access token belongs to and whether it can administer their org
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrgInspection {
    pub admin_name: String,
    pub admin_email: String,
    pub org_id: String,
    pub org_name: String,
    pub has_admin_access: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    pub id: String,
    pub display_name: String,
}

#[async_trait]
pub trait OrgAdmin: Send + Sync {
    async fn inspect(&self, access_token: &str) -> Result<OrgInspection>;

    async fn list_workspaces(&self, access_token: &str, org_id: &str) -> Result<Vec<Workspace>>;

    /// Find a workspace by display name, creating it when absent
    async fn ensure_workspace(
        &self,
        access_token: &str,
        org_id: &str,
        display_name: &str,
    ) -> Result<Workspace>;

    async fn activation_code(
        &self,
        access_token: &str,
        org_id: &str,
        workspace_id: &str,
    ) -> Result<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grant_expiry() {
        let now = Utc::now();
        let grant = TokenGrant {
            access_token: "a".into(),
            refresh_token: None,
            expires_in: Some(3600),
        };
        assert_eq!(grant.expires_at(now), now + ChronoDuration::seconds(3600));

        let no_lifetime = TokenGrant {
            expires_in: None,
            ..grant
        };
        assert_eq!(no_lifetime.expires_at(now), now);
    }

    #[test]
    fn test_card_input_trims_and_defaults() {
        let mut submission = CardSubmission::default();
        submission
            .inputs
            .insert("workspace".into(), serde_json::json!("  Lobby  "));
        submission
            .inputs
            .insert("count".into(), serde_json::json!(3));
        assert_eq!(submission.input("workspace"), "Lobby");
        assert_eq!(submission.input("count"), "");
        assert_eq!(submission.input("missing"), "");
    }
}
