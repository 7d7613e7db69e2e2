// ABOUTME: End-to-end tests for the conversation handler with recording doubles
// ABOUTME: Walks rooms through joining, authorization, commands, card provisioning and leaving

use boardbot::bot::{help_text, BotHandler, MISSING_WORKSPACE, PROVISIONING_FAILED};
use boardbot::platform::webex::BotIdentity;
use boardbot_core::authority::{admin_confirmation, denial_notice, GREETING};
use boardbot_core::ids::{AttachmentActionId, MessageId, PersonId, RoomId};
use boardbot_core::pending::PendingAuthRegistry;
use boardbot_core::rooms::{OAuthToken, RoomStore};
use boardbot_core::testing::{MockDirectory, MockMessenger, MockOrgAdmin, MockTokenEndpoint};
use boardbot_core::traits::{CardSubmission, InboundMessage, MessageContent};
use boardbot_core::{
    CredentialVault, EventDispatcher, EventHandler, RoomAuthority, StreamEvent,
    CONVERSATION_ACTIVITY,
};
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

const PROMPT_PREFIX: &str = "To get started, please authorize";

struct Fixture {
    store: Arc<RoomStore>,
    directory: Arc<MockDirectory>,
    messenger: Arc<MockMessenger>,
    org_admin: Arc<MockOrgAdmin>,
    authority: Arc<RoomAuthority>,
    vault: Arc<CredentialVault>,
    handler: Arc<BotHandler>,
    bot: PersonId,
}

fn fixture() -> Fixture {
    let store = Arc::new(RoomStore::in_memory());
    let directory = MockDirectory::new();
    let messenger = MockMessenger::new();
    let org_admin = MockOrgAdmin::new();
    let endpoint = MockTokenEndpoint::new();

    let authority = Arc::new(RoomAuthority::new(
        store.clone(),
        directory.clone(),
        messenger.clone(),
    ));
    let vault = Arc::new(
        CredentialVault::new(
            store.clone(),
            endpoint,
            org_admin.clone(),
            messenger.clone(),
            Arc::new(PendingAuthRegistry::new()),
        )
        .with_bot_name("Boardy Bot"),
    );

    let bot = PersonId::from_uuid("bot");
    let identity = BotIdentity {
        id: bot.clone(),
        display_name: "Boardy Bot".into(),
        email: Some("boardy@webex.bot".into()),
    };
    let handler = Arc::new(
        BotHandler::new(
            identity,
            authority.clone(),
            vault.clone(),
            messenger.clone(),
            org_admin.clone(),
        )
        .with_support_contact(Some("help@acme.test".into())),
    );

    Fixture {
        store,
        directory,
        messenger,
        org_admin,
        authority,
        vault,
        handler,
        bot,
    }
}

impl Fixture {
    async fn deliver(&self, verb: &str, id: &str, actor: &str, room: &RoomId, object: Option<&str>) {
        let mut activity = json!({
            "id": id,
            "verb": verb,
            "actor": {"id": actor},
            "target": {"id": room.uuid()},
        });
        if let Some(object) = object {
            activity["object"] = json!({"id": object});
        }
        let frame = json!({
            "id": "frame",
            "data": {"eventType": "conversation.activity", "activity": activity},
        });
        let event = StreamEvent::decode(&frame.to_string()).unwrap();
        self.handler.handle(&event).await.unwrap();
    }

    /// Register a message as fetchable and deliver its `post` activity
    async fn post(&self, id: &str, room: &RoomId, author: &PersonId, text: &str) {
        self.messenger.add_inbound(InboundMessage {
            id: MessageId::from_uuid(id),
            room_id: room.clone(),
            person_id: author.clone(),
            person_email: None,
            text: Some(text.to_string()),
        });
        self.deliver("post", id, author.uuid(), room, None).await;
    }

    async fn submit_card(&self, id: &str, room: &RoomId, author: &PersonId, inputs: &[(&str, &str)]) {
        let inputs: HashMap<String, serde_json::Value> = inputs
            .iter()
            .map(|(k, v)| (k.to_string(), json!(v)))
            .collect();
        self.messenger.add_card_action(
            &AttachmentActionId::from_uuid(id),
            CardSubmission { id: None, inputs },
        );
        self.deliver("cardAction", id, author.uuid(), room, None).await;
    }

    /// Group room with `admin` as admin and `others` as plain members
    async fn group_room(&self, uuid: &str, admin: (&PersonId, &str), others: &[(&PersonId, &str)]) -> RoomId {
        let room = RoomId::from_uuid(uuid);
        self.directory.add_group_room(&room, "Facilities");
        self.directory.add_member(&room, admin.0, admin.1);
        for (person, email) in others {
            self.directory.add_member(&room, person, email);
        }
        self.authority.ensure_room(&room).await.unwrap();
        assert!(self.authority.set_admin(&room, admin.1, true).await.unwrap());
        room
    }

    async fn link(&self, room: &RoomId, expires_in_secs: i64, refresh: Option<&str>) {
        self.store
            .update(room, |record| {
                record.managed_org.org_id = "org-1".into();
                record.managed_org.org_name = "Acme".into();
                record.managed_org.oauth_tokens = Some(OAuthToken {
                    access_token: "org-access".into(),
                    refresh_token: refresh.map(str::to_string),
                    expires_at: Utc::now() + ChronoDuration::seconds(expires_in_secs),
                });
            })
            .await
            .unwrap();
    }

    fn texts(&self, room: &RoomId) -> Vec<String> {
        self.messenger.texts_for(room)
    }

    fn last_text(&self, room: &RoomId) -> String {
        self.texts(room).last().cloned().unwrap_or_default()
    }
}

fn ada() -> PersonId {
    PersonId::from_uuid("ada")
}

fn bob() -> PersonId {
    PersonId::from_uuid("bob")
}

// =============================================================================
// Direct rooms
// =============================================================================

#[tokio::test]
async fn test_direct_room_first_message_asks_for_authorization() {
    let f = fixture();
    let room = RoomId::from_uuid("dm");
    let carol = PersonId::from_uuid("carol");
    f.directory.add_direct_room(&room, &carol, "carol@acme.test");

    f.post("m1", &room, &carol, "hello").await;

    // The creator became admin without any confirmation message
    let record = f.store.get(&room).await.unwrap();
    assert_eq!(record.room_admin.email.as_deref(), Some("carol@acme.test"));
    let texts = f.texts(&room);
    assert_eq!(texts.len(), 1);
    assert!(texts[0].starts_with(PROMPT_PREFIX));
    assert!(texts[0].contains("https://auth.test/authorize?state="));
    assert_eq!(f.vault.pending().len().await, 1);
}

#[tokio::test]
async fn test_direct_join_is_silent() {
    let f = fixture();
    let room = RoomId::from_uuid("dm");
    let carol = PersonId::from_uuid("carol");
    f.directory.add_direct_room(&room, &carol, "carol@acme.test");

    f.deliver("add", "a1", carol.uuid(), &room, Some(f.bot.uuid()))
        .await;

    assert!(f.messenger.sent().is_empty());
    let record = f.store.get(&room).await.unwrap();
    assert_eq!(record.room_admin.email.as_deref(), Some("carol@acme.test"));
}

// =============================================================================
// Group rooms
// =============================================================================

#[tokio::test]
async fn test_group_join_greets_promotes_inviter_and_prompts() {
    let f = fixture();
    let room = RoomId::from_uuid("team");
    f.directory.add_group_room(&room, "Facilities");
    f.directory.add_member(&room, &ada(), "ada@acme.test");

    f.deliver("add", "a1", ada().uuid(), &room, Some(f.bot.uuid()))
        .await;

    let texts = f.texts(&room);
    assert_eq!(texts.len(), 3);
    assert_eq!(texts[0], GREETING);
    assert_eq!(texts[1], admin_confirmation("ada@acme.test"));
    assert!(texts[2].starts_with(PROMPT_PREFIX));
    let record = f.store.get(&room).await.unwrap();
    assert_eq!(record.room_name, "Facilities");
    assert!(record.room_admin.is(&ada()));
}

#[tokio::test]
async fn test_other_membership_changes_are_ignored() {
    let f = fixture();
    let room = RoomId::from_uuid("team");
    f.directory.add_group_room(&room, "Facilities");

    f.deliver("add", "a1", ada().uuid(), &room, Some(bob().uuid()))
        .await;

    assert!(f.store.get(&room).await.is_none());
    assert!(f.messenger.sent().is_empty());
}

#[tokio::test]
async fn test_unauthorized_member_is_refused() {
    let f = fixture();
    let eve = PersonId::from_uuid("eve");
    let room = f
        .group_room("team", (&ada(), "ada@acme.test"), &[(&eve, "eve@acme.test")])
        .await;

    f.post("m1", &room, &eve, "Boardy help").await;

    assert_eq!(f.texts(&room), vec![denial_notice("ada@acme.test")]);
}

#[tokio::test]
async fn test_add_help_info_and_remove() {
    let f = fixture();
    let room = f
        .group_room("team", (&ada(), "ada@acme.test"), &[(&bob(), "bob@acme.test")])
        .await;
    f.link(&room, 3600, Some("rt")).await;

    f.post("m1", &room, &ada(), "Boardy add bob@acme.test nobody@acme.test")
        .await;
    let texts = f.texts(&room);
    assert_eq!(texts[0], "User bob@acme.test added successfully.");
    assert_eq!(
        texts[1],
        "Failed to add user nobody@acme.test. Make sure they are in this room."
    );

    // Bob may now use the bot
    f.post("m2", &room, &bob(), "help").await;
    assert_eq!(f.last_text(&room), help_text(Some("help@acme.test")));

    f.post("m3", &room, &ada(), "Boardy info").await;
    let info = f.last_text(&room);
    assert!(info.contains("Organization Name: Acme"));
    assert!(info.contains("Organization ID: org-1"));
    assert!(info.contains("Boardy Bot will only respond"));
    assert!(info.contains("Owner: ada@acme.test"));
    assert!(info.contains("Authorized Users: bob@acme.test"));

    f.post("m4", &room, &ada(), "remove bob@acme.test").await;
    assert_eq!(f.last_text(&room), "User bob@acme.test removed successfully.");
    f.post("m5", &room, &ada(), "remove bob@acme.test").await;
    assert!(f.last_text(&room).starts_with("Failed to remove user bob@acme.test"));

    f.post("m6", &room, &bob(), "help").await;
    assert_eq!(f.last_text(&room), denial_notice("ada@acme.test"));
}

#[tokio::test]
async fn test_add_without_emails_shows_usage() {
    let f = fixture();
    let room = f.group_room("team", (&ada(), "ada@acme.test"), &[]).await;

    f.post("m1", &room, &ada(), "add").await;
    assert_eq!(f.last_text(&room), "Usage: add <email> [email ...]");
}

#[tokio::test]
async fn test_info_defaults_for_unlinked_room() {
    let f = fixture();
    let room = f.group_room("team", (&ada(), "ada@acme.test"), &[]).await;

    f.post("m1", &room, &ada(), "info").await;
    let info = f.last_text(&room);
    assert!(info.contains("Organization Name: N/A"));
    assert!(info.contains("Authorized Users: N/A"));
}

#[tokio::test]
async fn test_reinit_unlinks_but_keeps_people() {
    let f = fixture();
    let room = f
        .group_room("team", (&ada(), "ada@acme.test"), &[(&bob(), "bob@acme.test")])
        .await;
    f.authority
        .add_authorized_user(&room, "bob@acme.test")
        .await
        .unwrap();
    f.link(&room, 3600, Some("rt")).await;

    f.post("m1", &room, &ada(), "Boardy reinit").await;

    let record = f.store.get(&room).await.unwrap();
    assert!(!record.managed_org.is_linked());
    assert!(record.managed_org.oauth_tokens.is_none());
    assert!(record.room_admin.is(&ada()));
    assert_eq!(record.room_authorized_users.len(), 1);
    assert!(f.last_text(&room).starts_with(PROMPT_PREFIX));
}

// =============================================================================
// Provisioning
// =============================================================================

#[tokio::test]
async fn test_linked_room_gets_card_and_activation_code() {
    let f = fixture();
    let room = f.group_room("team", (&ada(), "ada@acme.test"), &[]).await;
    f.link(&room, 3600, Some("rt")).await;
    f.org_admin.add_workspace("ws-existing", "Lobby");

    f.post("m1", &room, &ada(), "Boardy hello").await;
    let sent = f.messenger.sent();
    let MessageContent::Card { text, card } = &sent.last().unwrap().content else {
        panic!("expected a card");
    };
    assert_eq!(text, "Here's your card");
    assert_eq!(card["body"][3]["choices"][0]["value"], "ws-existing");

    f.submit_card("c1", &room, &ada(), &[("workspace", "Atrium")])
        .await;
    assert_eq!(
        f.last_text(&room),
        "Here's your activation code: 1234-5678-9012-3456 for workspace *Atrium*"
    );
    assert_eq!(f.org_admin.code_requests(), vec!["ws-2".to_string()]);
}

#[tokio::test]
async fn test_existing_workspace_choice_is_provisioned() {
    let f = fixture();
    let room = f.group_room("team", (&ada(), "ada@acme.test"), &[]).await;
    f.link(&room, 3600, Some("rt")).await;
    f.org_admin.add_workspace("ws-existing", "Lobby");

    f.submit_card("c1", &room, &ada(), &[("existing-workspace", "ws-existing")])
        .await;
    assert!(f.last_text(&room).ends_with("for workspace *Lobby*"));
    assert_eq!(f.org_admin.code_requests(), vec!["ws-existing".to_string()]);
}

#[tokio::test]
async fn test_card_from_stream_finds_room_stored_in_regional_form() {
    use base64::engine::general_purpose::STANDARD_NO_PAD;
    use base64::Engine;
    use boardbot_core::rooms::{Room, RoomAdmin};

    let f = fixture();
    let regional = |kind: &str, uuid: &str| {
        STANDARD_NO_PAD.encode(format!("ciscospark://urn:TEAM:eu-central-1_k/{kind}/{uuid}"))
    };
    let stored_room = RoomId::parse(&regional("ROOM", "team")).unwrap();
    let mut record = Room::new(&stored_room, "Facilities");
    record.room_admin = RoomAdmin {
        email: Some("ada@acme.test".into()),
        id: Some(regional("PEOPLE", "ada")),
    };
    f.store.insert_if_absent(record).await;

    // The stream only carries the UUIDs
    let room = RoomId::from_uuid("team");
    f.link(&room, 3600, Some("rt")).await;
    f.submit_card("c1", &room, &ada(), &[("workspace", "Atrium")])
        .await;

    assert!(f.last_text(&room).ends_with("for workspace *Atrium*"));
    assert_eq!(f.store.len().await, 1);
    let stored = f.store.get(&room).await.unwrap();
    assert_eq!(stored.room_id, stored_room.as_str());
    assert_eq!(stored.room_admin.id.as_deref(), Some(regional("PEOPLE", "ada").as_str()));
}

#[tokio::test]
async fn test_empty_card_asks_for_workspace() {
    let f = fixture();
    let room = f.group_room("team", (&ada(), "ada@acme.test"), &[]).await;
    f.link(&room, 3600, Some("rt")).await;

    f.submit_card("c1", &room, &ada(), &[("workspace", "   ")]).await;
    assert_eq!(f.last_text(&room), MISSING_WORKSPACE);
    assert!(f.org_admin.code_requests().is_empty());
}

#[tokio::test]
async fn test_activation_failure_is_reported() {
    let f = fixture();
    let room = f.group_room("team", (&ada(), "ada@acme.test"), &[]).await;
    f.link(&room, 3600, Some("rt")).await;
    f.org_admin.fail_activation();

    f.submit_card("c1", &room, &ada(), &[("workspace", "Atrium")])
        .await;
    assert_eq!(f.last_text(&room), PROVISIONING_FAILED);
}

#[tokio::test]
async fn test_expired_token_without_refresh_prompts_again() {
    let f = fixture();
    let room = f.group_room("team", (&ada(), "ada@acme.test"), &[]).await;
    f.link(&room, -60, None).await;

    f.post("m1", &room, &ada(), "Boardy hello").await;

    assert!(f.last_text(&room).starts_with(PROMPT_PREFIX));
    assert!(!f.store.get(&room).await.unwrap().managed_org.is_linked());
}

#[tokio::test]
async fn test_unlinked_card_action_prompts() {
    let f = fixture();
    let room = f.group_room("team", (&ada(), "ada@acme.test"), &[]).await;

    f.submit_card("c1", &room, &ada(), &[("workspace", "Atrium")])
        .await;
    assert!(f.last_text(&room).starts_with(PROMPT_PREFIX));
    assert!(f.org_admin.code_requests().is_empty());
}

// =============================================================================
// Bot traffic and leaving
// =============================================================================

#[tokio::test]
async fn test_bot_messages_are_ignored() {
    let f = fixture();
    let room = f.group_room("team", (&ada(), "ada@acme.test"), &[]).await;
    let bot = f.bot.clone();

    // Not registered with the messenger: fetching it would fail the handler
    f.deliver("post", "own", bot.uuid(), &room, None).await;

    // Reported under another actor but authored by the bot
    f.messenger.add_inbound(InboundMessage {
        id: MessageId::from_uuid("own-2"),
        room_id: room.clone(),
        person_id: bot,
        person_email: None,
        text: Some("Boardy help".into()),
    });
    f.deliver("post", "own-2", ada().uuid(), &room, None).await;

    assert!(f.messenger.sent().is_empty());
}

#[tokio::test]
async fn test_leave_forgets_room_and_handshakes() {
    let f = fixture();
    let room = f.group_room("team", (&ada(), "ada@acme.test"), &[]).await;
    f.vault.request_authorization(&room).await.unwrap();
    assert_eq!(f.vault.prompt_count().await, 1);

    f.deliver("leave", "l1", ada().uuid(), &room, Some(f.bot.uuid()))
        .await;

    assert!(f.store.get(&room).await.is_none());
    assert_eq!(f.vault.prompt_count().await, 0);
    assert!(f.vault.pending().is_empty().await);
}

#[tokio::test]
async fn test_dispatcher_routes_activities_to_handler() {
    let f = fixture();
    let room = f.group_room("team", (&ada(), "ada@acme.test"), &[]).await;
    let dispatcher = EventDispatcher::builder()
        .on(CONVERSATION_ACTIVITY, f.handler.clone())
        .build();

    f.messenger.add_inbound(InboundMessage {
        id: MessageId::from_uuid("m1"),
        room_id: room.clone(),
        person_id: ada(),
        person_email: None,
        text: Some("help".into()),
    });
    let frame = json!({
        "data": {
            "eventType": "conversation.activity",
            "activity": {
                "id": "m1",
                "verb": "post",
                "actor": {"id": "ada"},
                "target": {"id": room.uuid()},
            }
        }
    });
    assert_eq!(dispatcher.dispatch(&frame.to_string()).await, 1);
    assert_eq!(f.last_text(&room), help_text(Some("help@acme.test")));

    // Unknown event types reach no handler
    assert_eq!(dispatcher.dispatch(r#"{"data":{"eventType":"status.start_typing"}}"#).await, 0);
}
