// ABOUTME: Bot-token Webex REST client for messages, rooms, memberships and people
// ABOUTME: Implements the Messenger and Directory collaborators used by the core

use anyhow::{Context, Result};
use async_trait::async_trait;
use boardbot_core::{
    AttachmentActionId, CardSubmission, Directory, InboundMessage, MessageContent, MessageId,
    Messenger, PersonId, RoomDetails, RoomId,
};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;

use super::{ensure_success, http_client, join_url, ItemList};

/// Content type Webex expects for adaptive card attachments
pub const ADAPTIVE_CARD_CONTENT_TYPE: &str = "application/vnd.microsoft.card.adaptive";

/// Upper bound on memberships fetched when listing the bot's rooms
const MEMBERSHIP_PAGE_SIZE: &str = "1000";

/// Who the bot token belongs to
#[derive(Debug, Clone)]
pub struct BotIdentity {
    pub id: PersonId,
    pub display_name: String,
    pub email: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersonResponse {
    id: String,
    #[serde(default)]
    display_name: String,
    #[serde(default)]
    emails: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageResponse {
    id: String,
    #[serde(default)]
    room_id: Option<String>,
    #[serde(default)]
    person_id: Option<String>,
    #[serde(default)]
    person_email: Option<String>,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AttachmentActionResponse {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    inputs: HashMap<String, Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RoomResponse {
    id: String,
    #[serde(default)]
    title: String,
    #[serde(rename = "type", default)]
    room_type: String,
    #[serde(default)]
    creator_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Membership {
    #[serde(default)]
    room_id: Option<String>,
    #[serde(default)]
    person_id: Option<String>,
    #[serde(default)]
    person_email: Option<String>,
}

/// Thin typed client over the Webex REST API, authenticated as the bot
#[derive(Clone)]
pub struct WebexClient {
    http: reqwest::Client,
    api_base: String,
    token: String,
}

impl std::fmt::Debug for WebexClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebexClient")
            .field("api_base", &self.api_base)
            .field("token", &"[REDACTED]")
            .finish()
    }
}

impl WebexClient {
    pub fn new(api_base: impl Into<String>, token: impl Into<String>) -> Result<Self> {
        Ok(Self {
            http: http_client()?,
            api_base: api_base.into(),
            token: token.into(),
        })
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> Result<T> {
        let response = self
            .http
            .get(join_url(&self.api_base, path))
            .bearer_auth(&self.token)
            .query(query)
            .send()
            .await
            .with_context(|| format!("GET {path} failed"))?;
        ensure_success(response, &format!("GET {path}"))
            .await?
            .json()
            .await
            .with_context(|| format!("GET {path} returned an unexpected body"))
    }

    /// The person behind the bot token
    pub async fn me(&self) -> Result<BotIdentity> {
        let me: PersonResponse = self.get("people/me", &[]).await?;
        Ok(BotIdentity {
            id: PersonId::parse_or_uuid(&me.id).context("people/me returned a malformed id")?,
            display_name: me.display_name,
            email: me.emails.into_iter().next(),
        })
    }

    async fn memberships(&self, query: &[(&str, &str)]) -> Result<Vec<Membership>> {
        let list: ItemList<Membership> = self.get("memberships", query).await?;
        Ok(list.items)
    }
}

fn message_body(room: &RoomId, content: MessageContent) -> Value {
    match content {
        MessageContent::Plain(text) => json!({ "roomId": room.as_str(), "text": text }),
        MessageContent::Markdown(markdown) => {
            json!({ "roomId": room.as_str(), "markdown": markdown })
        }
        MessageContent::Card { text, card } => json!({
            "roomId": room.as_str(),
            "text": text,
            "attachments": [{ "contentType": ADAPTIVE_CARD_CONTENT_TYPE, "content": card }],
        }),
    }
}

#[async_trait]
impl Messenger for WebexClient {
    async fn send(&self, room: &RoomId, content: MessageContent) -> Result<MessageId> {
        let response = self
            .http
            .post(join_url(&self.api_base, "messages"))
            .bearer_auth(&self.token)
            .json(&message_body(room, content))
            .send()
            .await
            .context("POST messages failed")?;
        let created: MessageResponse = ensure_success(response, "POST messages")
            .await?
            .json()
            .await
            .context("POST messages returned an unexpected body")?;
        Ok(MessageId::parse_or_uuid(&created.id)?)
    }

    async fn delete(&self, message: &MessageId) -> Result<()> {
        let path = format!("messages/{}", message.as_str());
        let response = self
            .http
            .delete(join_url(&self.api_base, &path))
            .bearer_auth(&self.token)
            .send()
            .await
            .with_context(|| format!("DELETE {path} failed"))?;
        ensure_success(response, &format!("DELETE {path}")).await?;
        Ok(())
    }

    async fn fetch_message(&self, message: &MessageId) -> Result<InboundMessage> {
        let raw: MessageResponse = self
            .get(&format!("messages/{}", message.as_str()), &[])
            .await?;
        let room_id = raw.room_id.context("message has no roomId")?;
        let person_id = raw.person_id.context("message has no personId")?;
        Ok(InboundMessage {
            id: MessageId::parse_or_uuid(&raw.id)?,
            room_id: RoomId::parse_or_uuid(&room_id)?,
            person_id: PersonId::parse_or_uuid(&person_id)?,
            person_email: raw.person_email,
            text: raw.text,
        })
    }

    async fn fetch_card_action(&self, action: &AttachmentActionId) -> Result<CardSubmission> {
        let raw: AttachmentActionResponse = self
            .get(&format!("attachment/actions/{}", action.as_str()), &[])
            .await?;
        Ok(CardSubmission {
            id: raw
                .id
                .as_deref()
                .and_then(|id| AttachmentActionId::parse_or_uuid(id).ok()),
            inputs: raw.inputs,
        })
    }
}

#[async_trait]
impl Directory for WebexClient {
    async fn room(&self, room: &RoomId) -> Result<RoomDetails> {
        let raw: RoomResponse = self.get(&format!("rooms/{}", room.as_str()), &[]).await?;
        Ok(RoomDetails {
            id: RoomId::parse_or_uuid(&raw.id)?,
            title: raw.title,
            is_direct: raw.room_type == "direct",
            creator_id: raw
                .creator_id
                .as_deref()
                .and_then(|id| PersonId::parse_or_uuid(id).ok()),
        })
    }

    async fn person_for_email(&self, room: &RoomId, email: &str) -> Result<Option<PersonId>> {
        let memberships = self
            .memberships(&[("roomId", room.as_str()), ("personEmail", email)])
            .await?;
        Ok(memberships
            .into_iter()
            .filter_map(|m| m.person_id)
            .find_map(|id| PersonId::parse_or_uuid(&id).ok()))
    }

    async fn email_for_person(&self, room: &RoomId, person: &PersonId) -> Result<Option<String>> {
        let memberships = self
            .memberships(&[("roomId", room.as_str()), ("personId", person.as_str())])
            .await?;
        Ok(memberships.into_iter().find_map(|m| m.person_email))
    }

    async fn person_email(&self, person: &PersonId) -> Result<Option<String>> {
        let raw: PersonResponse = self
            .get(&format!("people/{}", person.as_str()), &[])
            .await?;
        Ok(raw.emails.into_iter().next())
    }

    async fn joined_rooms(&self) -> Result<Vec<RoomId>> {
        let memberships = self.memberships(&[("max", MEMBERSHIP_PAGE_SIZE)]).await?;
        Ok(memberships
            .into_iter()
            .filter_map(|m| m.room_id)
            .filter_map(|id| RoomId::parse_or_uuid(&id).ok())
            .collect())
    }
}
