// ABOUTME: Recording test doubles for the collaborator traits
// ABOUTME: Used by unit and integration tests here and in the binary crate

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::ids::{AttachmentActionId, MessageId, PersonId, RoomId};
use crate::traits::{
    CardSubmission, Directory, InboundMessage, MessageContent, Messenger, OrgAdmin,
    OrgInspection, RoomDetails, TokenEndpoint, TokenError, TokenGrant, Workspace,
};

// =============================================================================
// Messenger
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    pub id: MessageId,
    pub room_id: RoomId,
    pub content: MessageContent,
}

/// Records sent and deleted messages; serves canned inbound messages and card actions
#[derive(Default)]
pub struct MockMessenger {
    sent: Mutex<Vec<SentMessage>>,
    deleted: Mutex<Vec<MessageId>>,
    inbound: Mutex<HashMap<String, InboundMessage>>,
    card_actions: Mutex<HashMap<String, CardSubmission>>,
    next_id: AtomicUsize,
    fail_sends: AtomicBool,
}

impl MockMessenger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make `fetch_message` return this message for its id
    pub fn add_inbound(&self, message: InboundMessage) {
        self.inbound
            .lock()
            .unwrap()
            .insert(message.id.uuid().to_string(), message);
    }

    pub fn add_card_action(&self, id: &AttachmentActionId, submission: CardSubmission) {
        self.card_actions
            .lock()
            .unwrap()
            .insert(id.uuid().to_string(), submission);
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().unwrap().clone()
    }

    /// Text of every message sent to `room_id`, in order
    pub fn texts_for(&self, room_id: &RoomId) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|m| &m.room_id == room_id)
            .map(|m| m.content.text().to_string())
            .collect()
    }

    pub fn deleted(&self) -> Vec<MessageId> {
        self.deleted.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.sent.lock().unwrap().clear();
        self.deleted.lock().unwrap().clear();
    }
}

#[async_trait]
impl Messenger for MockMessenger {
    async fn send(&self, room: &RoomId, content: MessageContent) -> Result<MessageId> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(anyhow!("send refused by mock"));
        }
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let id = MessageId::from_uuid(&format!("sent-{n}"));
        self.sent.lock().unwrap().push(SentMessage {
            id: id.clone(),
            room_id: room.clone(),
            content,
        });
        Ok(id)
    }

    async fn delete(&self, message: &MessageId) -> Result<()> {
        self.deleted.lock().unwrap().push(message.clone());
        Ok(())
    }

    async fn fetch_message(&self, message: &MessageId) -> Result<InboundMessage> {
        self.inbound
            .lock()
            .unwrap()
            .get(message.uuid())
            .cloned()
            .ok_or_else(|| anyhow!("message {} not found", message.uuid()))
    }

    async fn fetch_card_action(&self, action: &AttachmentActionId) -> Result<CardSubmission> {
        self.card_actions
            .lock()
            .unwrap()
            .get(action.uuid())
            .cloned()
            .ok_or_else(|| anyhow!("attachment action {} not found", action.uuid()))
    }
}

// =============================================================================
// Directory
// =============================================================================

/// In-memory rooms, memberships and people
#[derive(Default)]
pub struct MockDirectory {
    rooms: Mutex<HashMap<RoomId, RoomDetails>>,
    members: Mutex<HashMap<RoomId, Vec<(PersonId, String)>>>,
    people: Mutex<HashMap<PersonId, String>>,
}

impl MockDirectory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_group_room(&self, room_id: &RoomId, title: &str) {
        self.rooms.lock().unwrap().insert(
            room_id.clone(),
            RoomDetails {
                id: room_id.clone(),
                title: title.to_string(),
                is_direct: false,
                creator_id: None,
            },
        );
    }

    /// A direct room whose creator is also registered as a member
    pub fn add_direct_room(&self, room_id: &RoomId, creator: &PersonId, creator_email: &str) {
        self.rooms.lock().unwrap().insert(
            room_id.clone(),
            RoomDetails {
                id: room_id.clone(),
                title: creator_email.to_string(),
                is_direct: true,
                creator_id: Some(creator.clone()),
            },
        );
        self.add_member(room_id, creator, creator_email);
    }

    pub fn add_member(&self, room_id: &RoomId, person: &PersonId, email: &str) {
        self.members
            .lock()
            .unwrap()
            .entry(room_id.clone())
            .or_default()
            .push((person.clone(), email.to_string()));
        self.people
            .lock()
            .unwrap()
            .insert(person.clone(), email.to_string());
    }
}

#[async_trait]
impl Directory for MockDirectory {
    async fn room(&self, room: &RoomId) -> Result<RoomDetails> {
        self.rooms
            .lock()
            .unwrap()
            .get(room)
            .cloned()
            .ok_or_else(|| anyhow!("room {} not found", room.uuid()))
    }

    async fn person_for_email(&self, room: &RoomId, email: &str) -> Result<Option<PersonId>> {
        Ok(self.members.lock().unwrap().get(room).and_then(|members| {
            members
                .iter()
                .find(|(_, e)| e.eq_ignore_ascii_case(email))
                .map(|(p, _)| p.clone())
        }))
    }

    async fn email_for_person(&self, room: &RoomId, person: &PersonId) -> Result<Option<String>> {
        Ok(self.members.lock().unwrap().get(room).and_then(|members| {
            members
                .iter()
                .find(|(p, _)| p == person)
                .map(|(_, e)| e.clone())
        }))
    }

    async fn person_email(&self, person: &PersonId) -> Result<Option<String>> {
        Ok(self.people.lock().unwrap().get(person).cloned())
    }

    async fn joined_rooms(&self) -> Result<Vec<RoomId>> {
        Ok(self.rooms.lock().unwrap().keys().cloned().collect())
    }
}

// =============================================================================
// Token endpoint
// =============================================================================

/// Canned answer for exchange and refresh calls
#[derive(Debug, Clone)]
pub enum TokenOutcome {
    Grant(TokenGrant),
    Rejected,
    Transport,
}

impl TokenOutcome {
    fn into_result(self) -> Result<TokenGrant, TokenError> {
        match self {
            Self::Grant(grant) => Ok(grant),
            Self::Rejected => Err(TokenError::Rejected {
                status: 400,
                body: "invalid_grant".to_string(),
            }),
            Self::Transport => Err(TokenError::Transport("connection reset".to_string())),
        }
    }
}

/// Counts calls and answers with configurable outcomes, optionally after a delay
pub struct MockTokenEndpoint {
    exchange: Mutex<TokenOutcome>,
    refresh: Mutex<TokenOutcome>,
    delay: Mutex<Option<Duration>>,
    exchange_calls: AtomicUsize,
    refresh_calls: AtomicUsize,
    refresh_tokens_seen: Mutex<Vec<String>>,
}

impl MockTokenEndpoint {
    pub fn new() -> Arc<Self> {
        let grant = |access: &str| {
            TokenOutcome::Grant(TokenGrant {
                access_token: access.to_string(),
                refresh_token: Some(format!("{access}-refresh")),
                expires_in: Some(3600),
            })
        };
        Arc::new(Self {
            exchange: Mutex::new(grant("exchanged")),
            refresh: Mutex::new(grant("refreshed")),
            delay: Mutex::new(None),
            exchange_calls: AtomicUsize::new(0),
            refresh_calls: AtomicUsize::new(0),
            refresh_tokens_seen: Mutex::new(Vec::new()),
        })
    }

    pub fn set_exchange(&self, outcome: TokenOutcome) {
        *self.exchange.lock().unwrap() = outcome;
    }

    pub fn set_refresh(&self, outcome: TokenOutcome) {
        *self.refresh.lock().unwrap() = outcome;
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn exchange_calls(&self) -> usize {
        self.exchange_calls.load(Ordering::SeqCst)
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn refresh_tokens_seen(&self) -> Vec<String> {
        self.refresh_tokens_seen.lock().unwrap().clone()
    }

    async fn pause(&self) {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl TokenEndpoint for MockTokenEndpoint {
    fn authorize_url(&self, state: &str) -> String {
        format!("https://auth.test/authorize?state={state}")
    }

    async fn exchange_code(&self, _code: &str) -> Result<TokenGrant, TokenError> {
        self.exchange_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        let outcome = self.exchange.lock().unwrap().clone();
        outcome.into_result()
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, TokenError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        self.refresh_tokens_seen
            .lock()
            .unwrap()
            .push(refresh_token.to_string());
        self.pause().await;
        let outcome = self.refresh.lock().unwrap().clone();
        outcome.into_result()
    }
}

// =============================================================================
// Org admin
// =============================================================================

/// One org with an editable workspace list and a fixed activation code
pub struct MockOrgAdmin {
    inspection: Mutex<Option<OrgInspection>>,
    workspaces: Mutex<Vec<Workspace>>,
    activation_code: Mutex<Option<String>>,
    inspected_tokens: Mutex<Vec<String>>,
    code_requests: Mutex<Vec<String>>,
}

impl MockOrgAdmin {
    /// Tokens inspect as an admin of "Acme" (org-1)
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inspection: Mutex::new(Some(OrgInspection {
                admin_name: "Ada Admin".to_string(),
                admin_email: "ada@acme.test".to_string(),
                org_id: "org-1".to_string(),
                org_name: "Acme".to_string(),
                has_admin_access: true,
            })),
            workspaces: Mutex::new(Vec::new()),
            activation_code: Mutex::new(Some("1234567890123456".to_string())),
            inspected_tokens: Mutex::new(Vec::new()),
            code_requests: Mutex::new(Vec::new()),
        })
    }

    pub fn deny_admin(&self) {
        if let Some(inspection) = self.inspection.lock().unwrap().as_mut() {
            inspection.has_admin_access = false;
        }
    }

    /// Make `inspect` fail outright
    pub fn fail_inspection(&self) {
        *self.inspection.lock().unwrap() = None;
    }

    pub fn add_workspace(&self, id: &str, display_name: &str) {
        self.workspaces.lock().unwrap().push(Workspace {
            id: id.to_string(),
            display_name: display_name.to_string(),
        });
    }

    pub fn fail_activation(&self) {
        *self.activation_code.lock().unwrap() = None;
    }

    pub fn workspaces(&self) -> Vec<Workspace> {
        self.workspaces.lock().unwrap().clone()
    }

    pub fn inspected_tokens(&self) -> Vec<String> {
        self.inspected_tokens.lock().unwrap().clone()
    }

    /// Workspace ids activation codes were requested for
    pub fn code_requests(&self) -> Vec<String> {
        self.code_requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl OrgAdmin for MockOrgAdmin {
    async fn inspect(&self, access_token: &str) -> Result<OrgInspection> {
        self.inspected_tokens
            .lock()
            .unwrap()
            .push(access_token.to_string());
        self.inspection
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| anyhow!("people/me returned 401"))
    }

    async fn list_workspaces(&self, _access_token: &str, _org_id: &str) -> Result<Vec<Workspace>> {
        Ok(self.workspaces())
    }

    async fn ensure_workspace(
        &self,
        _access_token: &str,
        _org_id: &str,
        display_name: &str,
    ) -> Result<Workspace> {
        let mut workspaces = self.workspaces.lock().unwrap();
        if let Some(existing) = workspaces.iter().find(|w| w.display_name == display_name) {
            return Ok(existing.clone());
        }
        let created = Workspace {
            id: format!("ws-{}", workspaces.len() + 1),
            display_name: display_name.to_string(),
        };
        workspaces.push(created.clone());
        Ok(created)
    }

    async fn activation_code(
        &self,
        _access_token: &str,
        _org_id: &str,
        workspace_id: &str,
    ) -> Result<String> {
        self.code_requests
            .lock()
            .unwrap()
            .push(workspace_id.to_string());
        self.activation_code
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| anyhow!("activation code request failed"))
    }
}
