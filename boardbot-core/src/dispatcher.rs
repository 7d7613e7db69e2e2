// ABOUTME: Routes decoded stream events to an explicit, ordered table of handlers
// ABOUTME: Per-room lanes keep one room's events in order while rooms run in parallel under a concurrency cap

use async_trait::async_trait;
use futures_util::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};

use crate::events::StreamEvent;
use crate::metrics;

/// Lanes with nothing to do for this long shut down
const LANE_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Key for events that carry no room
const SHARED_LANE: &str = "";

/// Something that reacts to stream events
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Short identifier used in logs and metrics
    fn name(&self) -> &'static str;

    async fn handle(&self, event: &StreamEvent) -> anyhow::Result<()>;
}

struct Registration {
    event_type: Option<String>,
    handler: Arc<dyn EventHandler>,
}

impl Registration {
    /// Filtered handlers only see events of their type the decoder could classify
    fn matches(&self, event: &StreamEvent) -> bool {
        match &self.event_type {
            None => true,
            Some(event_type) => event_type == &event.event_type && event.raw_verb.is_none(),
        }
    }
}

/// Builds the dispatch table in registration order
pub struct EventDispatcherBuilder {
    registrations: Vec<Registration>,
    max_concurrent_events: usize,
}

impl Default for EventDispatcherBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EventDispatcherBuilder {
    pub fn new() -> Self {
        Self {
            registrations: Vec::new(),
            max_concurrent_events: 16,
        }
    }

    /// Run `handler` for events whose type is `event_type`
    pub fn on(mut self, event_type: impl Into<String>, handler: Arc<dyn EventHandler>) -> Self {
        self.registrations.push(Registration {
            event_type: Some(event_type.into()),
            handler,
        });
        self
    }

    /// Run `handler` for every decoded event
    pub fn on_any(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.registrations.push(Registration {
            event_type: None,
            handler,
        });
        self
    }

    pub fn max_concurrent_events(mut self, limit: usize) -> Self {
        self.max_concurrent_events = limit.max(1);
        self
    }

    pub fn build(self) -> Arc<EventDispatcher> {
        tracing::debug!(
            handlers = self.registrations.len(),
            max_concurrent_events = self.max_concurrent_events,
            "Event dispatcher built"
        );
        Arc::new(EventDispatcher {
            registrations: self.registrations,
            permits: Arc::new(Semaphore::new(self.max_concurrent_events)),
            lanes: Mutex::new(HashMap::new()),
        })
    }
}

/// Decodes frames and fans them out to the registered handlers
pub struct EventDispatcher {
    registrations: Vec<Registration>,
    permits: Arc<Semaphore>,
    lanes: Mutex<HashMap<String, mpsc::UnboundedSender<StreamEvent>>>,
}

impl EventDispatcher {
    pub fn builder() -> EventDispatcherBuilder {
        EventDispatcherBuilder::new()
    }

    pub fn handler_count(&self) -> usize {
        self.registrations.len()
    }

    /// Decode `frame` and run its handlers inline. Returns how many handlers ran.
    pub async fn dispatch(&self, frame: &str) -> usize {
        match decode(frame) {
            Some(event) => self.dispatch_event(&event).await,
            None => 0,
        }
    }

    /// Run every matching handler in registration order.
    ///
    /// Errors and panics are logged per handler; later handlers still run.
    pub async fn dispatch_event(&self, event: &StreamEvent) -> usize {
        metrics::record_event_dispatched(&event.event_type);
        let mut ran = 0;
        for registration in self.registrations.iter().filter(|r| r.matches(event)) {
            ran += 1;
            let handler = &registration.handler;
            let outcome = AssertUnwindSafe(handler.handle(event)).catch_unwind().await;
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::error!(
                        handler = handler.name(),
                        event_type = %event.event_type,
                        error = %format!("{e:#}"),
                        "Event handler failed"
                    );
                    metrics::record_handler_failure(handler.name(), "error");
                }
                Err(panic) => {
                    let message = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "non-string panic payload".to_string());
                    tracing::error!(
                        handler = handler.name(),
                        event_type = %event.event_type,
                        panic = %message,
                        "Event handler panicked"
                    );
                    metrics::record_handler_failure(handler.name(), "panic");
                }
            }
        }
        ran
    }

    /// Queue `frame` on its room's lane without waiting for handlers.
    ///
    /// Malformed frames are logged and dropped.
    pub fn submit(self: &Arc<Self>, frame: &str) {
        metrics::record_frame_received();
        let Some(event) = decode(frame) else {
            return;
        };
        let key = event.lane_key().unwrap_or_else(|| SHARED_LANE.to_string());

        let mut lanes = self.lanes.lock().unwrap_or_else(PoisonError::into_inner);
        let event = match lanes.get(&key) {
            Some(tx) => match tx.send(event) {
                Ok(()) => return,
                Err(mpsc::error::SendError(event)) => event,
            },
            None => event,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        if tx.send(event).is_err() {
            metrics::record_frame_dropped("lane_closed");
            return;
        }
        lanes.insert(key.clone(), tx);
        drop(lanes);

        tokio::spawn(Arc::clone(self).run_lane(key, rx));
    }

    /// Number of rooms with a live lane
    pub fn active_lanes(&self) -> usize {
        self.lanes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    async fn run_lane(self: Arc<Self>, key: String, mut rx: mpsc::UnboundedReceiver<StreamEvent>) {
        loop {
            match tokio::time::timeout(LANE_IDLE_TIMEOUT, rx.recv()).await {
                Ok(Some(event)) => {
                    let Ok(_permit) = Arc::clone(&self.permits).acquire_owned().await else {
                        return;
                    };
                    self.dispatch_event(&event).await;
                }
                Ok(None) => return,
                Err(_) => {
                    // Submitters send while holding this lock, so nothing can slip in after the check
                    let mut lanes = self.lanes.lock().unwrap_or_else(PoisonError::into_inner);
                    if rx.is_empty() {
                        lanes.remove(&key);
                        tracing::trace!(lane = %key, "Idle event lane closed");
                        return;
                    }
                }
            }
        }
    }
}

fn decode(frame: &str) -> Option<StreamEvent> {
    match StreamEvent::decode(frame) {
        Ok(event) => Some(event),
        Err(e) => {
            let preview: String = frame.chars().take(80).collect();
            tracing::warn!(error = %e, frame = %preview, "Dropping undecodable frame");
            metrics::record_frame_dropped("decode");
            None
        }
    }
}
