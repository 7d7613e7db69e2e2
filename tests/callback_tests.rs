// ABOUTME: Integration tests for the OAuth callback router
// ABOUTME: Drives the axum router in-process with the core test doubles

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use boardbot::callback;
use boardbot_core::ids::{PersonId, RoomId};
use boardbot_core::pending::PendingAuthRegistry;
use boardbot_core::rooms::{Room, RoomAdmin, RoomStore};
use boardbot_core::testing::{MockMessenger, MockOrgAdmin, MockTokenEndpoint, TokenOutcome};
use boardbot_core::CredentialVault;
use std::sync::Arc;
use tower::ServiceExt;

struct Fixture {
    store: Arc<RoomStore>,
    endpoint: Arc<MockTokenEndpoint>,
    org_admin: Arc<MockOrgAdmin>,
    messenger: Arc<MockMessenger>,
    vault: Arc<CredentialVault>,
    room: RoomId,
}

async fn fixture() -> Fixture {
    let store = Arc::new(RoomStore::in_memory());
    let endpoint = MockTokenEndpoint::new();
    let org_admin = MockOrgAdmin::new();
    let messenger = MockMessenger::new();
    let vault = Arc::new(
        CredentialVault::new(
            store.clone(),
            endpoint.clone(),
            org_admin.clone(),
            messenger.clone(),
            Arc::new(PendingAuthRegistry::new()),
        )
        .with_bot_name("Boardy"),
    );

    let room = RoomId::from_uuid("room-1");
    let mut record = Room::new(&room, "Facilities");
    record.room_admin = RoomAdmin::new("ada@acme.test", &PersonId::from_uuid("ada"));
    store.insert_if_absent(record).await;

    Fixture {
        store,
        endpoint,
        org_admin,
        messenger,
        vault,
        room,
    }
}

fn app(f: &Fixture) -> Router {
    callback::router(f.vault.clone(), "/auth", None)
}

async fn get(app: Router, uri: &str) -> (StatusCode, String) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, String::from_utf8(bytes.to_vec()).unwrap())
}

// =============================================================================
// Rejected callbacks
// =============================================================================

#[tokio::test]
async fn test_provider_error_is_reported() {
    let f = fixture().await;
    let (status, body) = get(
        app(&f),
        "/auth?error=access_denied&error_description=User%20said%20%3Cno%3E",
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.contains("Authorization Failed"));
    assert!(body.contains("Error: access_denied"));
    assert!(body.contains("User said &lt;no&gt;"));
    assert_eq!(f.endpoint.exchange_calls(), 0);
}

#[tokio::test]
async fn test_missing_code_or_state() {
    let f = fixture().await;

    let (status, body) = get(app(&f), "/auth?code=abc").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.contains("Missing Parameters"));

    let (status, _) = get(app(&f), "/auth?state=xyz&code=").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(f.endpoint.exchange_calls(), 0);
}

#[tokio::test]
async fn test_unknown_state_is_refused() {
    let f = fixture().await;
    let (status, body) = get(app(&f), "/auth?code=abc&state=never-issued").await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.contains("Invalid or Expired State"));
    assert_eq!(f.endpoint.exchange_calls(), 0);
}

#[tokio::test]
async fn test_exchange_failure_is_server_error() {
    let f = fixture().await;
    f.endpoint.set_exchange(TokenOutcome::Rejected);
    let state = f.vault.request_authorization(&f.room).await.unwrap();

    let (status, body) = get(app(&f), &format!("/auth?code=abc&state={state}")).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body.contains("Authorization Failed"));
    assert!(!f.store.get(&f.room).await.unwrap().managed_org.is_linked());
}

// =============================================================================
// Successful handshakes
// =============================================================================

#[tokio::test]
async fn test_valid_callback_links_room() {
    let f = fixture().await;
    let state = f.vault.request_authorization(&f.room).await.unwrap();
    let prompt_id = f.messenger.sent()[0].id.clone();

    let (status, body) = get(app(&f), &format!("/auth?code=abc&state={state}")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("Authorization Successful!"));
    assert!(body.contains("window.close()"));

    let room = f.store.get(&f.room).await.unwrap();
    assert_eq!(room.managed_org.org_id, "org-1");
    assert_eq!(room.managed_org.org_name, "Acme");
    let tokens = room.managed_org.oauth_tokens.unwrap();
    assert_eq!(tokens.access_token, "exchanged");
    assert_eq!(tokens.refresh_token.as_deref(), Some("exchanged-refresh"));

    // The prompt is retracted and the room hears about the link
    assert_eq!(f.messenger.deleted(), vec![prompt_id]);
    let texts = f.messenger.texts_for(&f.room);
    assert!(texts.last().unwrap().contains("Successfully authorized organization **Acme**"));
    assert_eq!(f.org_admin.inspected_tokens(), vec!["exchanged".to_string()]);
}

#[tokio::test]
async fn test_state_is_single_use() {
    let f = fixture().await;
    let state = f.vault.request_authorization(&f.room).await.unwrap();
    let uri = format!("/auth?code=abc&state={state}");

    let (first, _) = get(app(&f), &uri).await;
    let (second, body) = get(app(&f), &uri).await;
    assert_eq!(first, StatusCode::OK);
    assert_eq!(second, StatusCode::BAD_REQUEST);
    assert!(body.contains("Invalid or Expired State"));
    assert_eq!(f.endpoint.exchange_calls(), 1);
}

#[tokio::test]
async fn test_non_admin_account_is_forbidden_and_prompted_again() {
    let f = fixture().await;
    f.org_admin.deny_admin();
    let state = f.vault.request_authorization(&f.room).await.unwrap();

    let (status, body) = get(app(&f), &format!("/auth?code=abc&state={state}")).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(body.contains("cannot administer"));

    let room = f.store.get(&f.room).await.unwrap();
    assert!(!room.managed_org.is_linked());
    assert!(room.managed_org.oauth_tokens.is_none());
    // A fresh handshake is outstanding for the room
    assert_eq!(f.vault.prompt_count().await, 1);
    assert!(f.vault.pending().len().await >= 1);
}

#[tokio::test]
async fn test_callback_path_is_configurable() {
    let f = fixture().await;
    let app = callback::router(f.vault.clone(), "/oauth/webex", None);

    let (status, _) = get(app.clone(), "/auth?code=abc&state=x").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = get(app, "/oauth/webex?code=abc&state=x").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
