// ABOUTME: Tests for event dispatch isolation, per-room ordering and cross-room concurrency
// ABOUTME: Handlers report what they saw over channels so lane scheduling can be observed from outside

use anyhow::{bail, Result};
use async_trait::async_trait;
use boardbot_core::{EventDispatcher, EventHandler, StreamEvent, CONVERSATION_ACTIVITY};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};

// =============================================================================
// Handlers
// =============================================================================

/// Sends `(room, activity id)` for every activity it handles
struct Recorder {
    tx: mpsc::UnboundedSender<(String, String)>,
}

fn recorder() -> (Arc<Recorder>, mpsc::UnboundedReceiver<(String, String)>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(Recorder { tx }), rx)
}

#[async_trait]
impl EventHandler for Recorder {
    fn name(&self) -> &'static str {
        "recorder"
    }

    async fn handle(&self, event: &StreamEvent) -> Result<()> {
        if let Some(activity) = &event.activity {
            let room = activity.target.clone().unwrap_or_default();
            let _ = self.tx.send((room, activity.id.clone()));
        }
        Ok(())
    }
}

struct Failing;

#[async_trait]
impl EventHandler for Failing {
    fn name(&self) -> &'static str {
        "failing"
    }

    async fn handle(&self, _event: &StreamEvent) -> Result<()> {
        bail!("store unavailable")
    }
}

struct Panicking;

#[async_trait]
impl EventHandler for Panicking {
    fn name(&self) -> &'static str {
        "panicking"
    }

    async fn handle(&self, _event: &StreamEvent) -> Result<()> {
        panic!("handler blew up");
    }
}

/// Holds events for one room until the test opens the gate
struct Gated {
    room: &'static str,
    gate: Arc<Semaphore>,
}

#[async_trait]
impl EventHandler for Gated {
    fn name(&self) -> &'static str {
        "gated"
    }

    async fn handle(&self, event: &StreamEvent) -> Result<()> {
        if event.lane_key().as_deref() == Some(self.room) {
            self.gate.acquire().await?.forget();
        }
        Ok(())
    }
}

/// Sleeps longer for earlier activities so any reordering would show
struct Staggered;

#[async_trait]
impl EventHandler for Staggered {
    fn name(&self) -> &'static str {
        "staggered"
    }

    async fn handle(&self, event: &StreamEvent) -> Result<()> {
        let index: u64 = event
            .activity
            .as_ref()
            .and_then(|a| a.id.rsplit('-').next())
            .and_then(|n| n.parse().ok())
            .unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(20u64.saturating_sub(index))).await;
        Ok(())
    }
}

fn frame(room: &str, activity_id: &str) -> String {
    serde_json::json!({
        "id": format!("frame-{activity_id}"),
        "data": {
            "eventType": "conversation.activity",
            "activity": {
                "id": activity_id,
                "verb": "post",
                "actor": {"id": "person-1"},
                "target": {"id": room}
            }
        }
    })
    .to_string()
}

async fn next(rx: &mut mpsc::UnboundedReceiver<(String, String)>) -> (String, String) {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("handler was not reached in time")
        .expect("recorder dropped")
}

// =============================================================================
// Isolation
// =============================================================================

#[tokio::test]
async fn test_failing_and_panicking_handlers_do_not_stop_later_ones() {
    let (recorder, mut seen) = recorder();
    let dispatcher = EventDispatcher::builder()
        .on(CONVERSATION_ACTIVITY, Arc::new(Failing))
        .on(CONVERSATION_ACTIVITY, Arc::new(Panicking))
        .on(CONVERSATION_ACTIVITY, recorder)
        .build();

    assert_eq!(dispatcher.dispatch(&frame("room-a", "act-1")).await, 3);
    assert_eq!(next(&mut seen).await.1, "act-1");

    // The dispatcher is still usable for the next event
    assert_eq!(dispatcher.dispatch(&frame("room-a", "act-2")).await, 3);
    assert_eq!(next(&mut seen).await.1, "act-2");
}

#[tokio::test]
async fn test_lane_survives_handler_panics() {
    let (recorder, mut seen) = recorder();
    let dispatcher = EventDispatcher::builder()
        .on(CONVERSATION_ACTIVITY, Arc::new(Panicking))
        .on(CONVERSATION_ACTIVITY, recorder)
        .build();

    dispatcher.submit(&frame("room-a", "act-1"));
    dispatcher.submit(&frame("room-a", "act-2"));
    dispatcher.submit("{ broken");
    dispatcher.submit(&frame("room-a", "act-3"));

    let ids: Vec<String> = vec![
        next(&mut seen).await.1,
        next(&mut seen).await.1,
        next(&mut seen).await.1,
    ];
    assert_eq!(ids, vec!["act-1", "act-2", "act-3"]);
}

// =============================================================================
// Ordering and concurrency
// =============================================================================

#[tokio::test]
async fn test_one_room_is_handled_in_arrival_order() {
    let (recorder, mut seen) = recorder();
    let dispatcher = EventDispatcher::builder()
        .on(CONVERSATION_ACTIVITY, Arc::new(Staggered))
        .on(CONVERSATION_ACTIVITY, recorder)
        .max_concurrent_events(8)
        .build();

    for i in 0..20 {
        dispatcher.submit(&frame("room-a", &format!("act-{i}")));
    }

    let mut ids = Vec::new();
    for _ in 0..20 {
        ids.push(next(&mut seen).await.1);
    }
    let expected: Vec<String> = (0..20).map(|i| format!("act-{i}")).collect();
    assert_eq!(ids, expected);
    assert_eq!(dispatcher.active_lanes(), 1);
}

#[tokio::test]
async fn test_blocked_room_does_not_stall_other_rooms() {
    let gate = Arc::new(Semaphore::new(0));
    let (recorder, mut seen) = recorder();
    let dispatcher = EventDispatcher::builder()
        .on(
            CONVERSATION_ACTIVITY,
            Arc::new(Gated {
                room: "room-a",
                gate: gate.clone(),
            }),
        )
        .on(CONVERSATION_ACTIVITY, recorder)
        .build();

    dispatcher.submit(&frame("room-a", "a-1"));
    dispatcher.submit(&frame("room-a", "a-2"));
    dispatcher.submit(&frame("room-b", "b-1"));

    assert_eq!(next(&mut seen).await, ("room-b".to_string(), "b-1".to_string()));
    assert!(seen.try_recv().is_err());

    gate.add_permits(2);
    assert_eq!(next(&mut seen).await.1, "a-1");
    assert_eq!(next(&mut seen).await.1, "a-2");
}

#[tokio::test]
async fn test_concurrency_cap_bounds_running_rooms() {
    let gate = Arc::new(Semaphore::new(0));
    let (recorder, mut seen) = recorder();
    let dispatcher = EventDispatcher::builder()
        .on(
            CONVERSATION_ACTIVITY,
            Arc::new(Gated {
                room: "room-a",
                gate: gate.clone(),
            }),
        )
        .on(CONVERSATION_ACTIVITY, recorder)
        .max_concurrent_events(1)
        .build();

    dispatcher.submit(&frame("room-a", "a-1"));
    tokio::time::sleep(Duration::from_millis(50)).await;
    dispatcher.submit(&frame("room-b", "b-1"));

    // Room A holds the only permit
    let waiting = tokio::time::timeout(Duration::from_millis(100), seen.recv()).await;
    assert!(waiting.is_err());

    gate.add_permits(1);
    assert_eq!(next(&mut seen).await.1, "a-1");
    assert_eq!(next(&mut seen).await.1, "b-1");
}
