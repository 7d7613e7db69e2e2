// ABOUTME: Single-use, time-bounded state tokens correlating an OAuth callback with the room that asked
// ABOUTME: Tokens are 32 random bytes in url-safe base64 and expire after ten minutes

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::ids::RoomId;

pub const PENDING_AUTH_TTL: Duration = Duration::from_secs(600);

const STATE_BYTES: usize = 32;

#[derive(Debug, Clone)]
pub struct PendingAuth {
    pub state: String,
    pub room_id: RoomId,
    pub created_at: Instant,
}

/// Outstanding authorization handshakes keyed by state token
pub struct PendingAuthRegistry {
    ttl: Duration,
    entries: Mutex<HashMap<String, PendingAuth>>,
}

impl Default for PendingAuthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingAuthRegistry {
    pub fn new() -> Self {
        Self::with_ttl(PENDING_AUTH_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Register a handshake for `room` and return its fresh state token
    pub async fn create(&self, room: &RoomId) -> String {
        let mut entries = self.entries.lock().await;
        let state = loop {
            let candidate = new_state();
            if !entries.contains_key(&candidate) {
                break candidate;
            }
        };
        entries.insert(
            state.clone(),
            PendingAuth {
                state: state.clone(),
                room_id: room.clone(),
                created_at: Instant::now(),
            },
        );
        tracing::debug!(room_id = %room, pending = entries.len(), "Authorization handshake registered");
        state
    }

    /// Remove the entry for `state` and return its room if it has not expired.
    ///
    /// The entry is gone after this call whatever the outcome, so a state can
    /// be redeemed at most once.
    pub async fn consume(&self, state: &str) -> Option<RoomId> {
        let entry = self.entries.lock().await.remove(state)?;
        if entry.created_at.elapsed() > self.ttl {
            tracing::info!(room_id = %entry.room_id, "Authorization state expired");
            return None;
        }
        Some(entry.room_id)
    }

    /// Drop every expired entry, returning the states that were removed
    pub async fn purge_expired(&self) -> Vec<String> {
        let mut entries = self.entries.lock().await;
        let expired: Vec<String> = entries
            .values()
            .filter(|entry| entry.created_at.elapsed() > self.ttl)
            .map(|entry| entry.state.clone())
            .collect();
        for state in &expired {
            entries.remove(state);
        }
        if !expired.is_empty() {
            tracing::debug!(
                purged = expired.len(),
                remaining = entries.len(),
                "Purged expired authorization states"
            );
        }
        expired
    }

    /// Drop every handshake started for `room`
    pub async fn forget_room(&self, room: &RoomId) -> Vec<String> {
        let mut entries = self.entries.lock().await;
        let states: Vec<String> = entries
            .values()
            .filter(|entry| &entry.room_id == room)
            .map(|entry| entry.state.clone())
            .collect();
        for state in &states {
            entries.remove(state);
        }
        states
    }

    /// Whether `state` is still outstanding (expired entries count until purged)
    pub async fn contains(&self, state: &str) -> bool {
        self.entries.lock().await.contains_key(state)
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn new_state() -> String {
    let mut bytes = [0u8; STATE_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_shape() {
        let state = new_state();
        // 32 bytes -> 43 unpadded base64 chars
        assert_eq!(state.len(), 43);
        assert!(state
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[tokio::test]
    async fn test_states_are_unique() {
        let registry = PendingAuthRegistry::new();
        let room = RoomId::from_uuid("r");
        let a = registry.create(&room).await;
        let b = registry.create(&room).await;
        assert_ne!(a, b);
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test]
    async fn test_forget_room_only_touches_that_room() {
        let registry = PendingAuthRegistry::new();
        let a = RoomId::from_uuid("a");
        let b = RoomId::from_uuid("b");
        let state_a = registry.create(&a).await;
        let state_b = registry.create(&b).await;

        assert_eq!(registry.forget_room(&a).await, vec![state_a.clone()]);
        assert_eq!(registry.consume(&state_a).await, None);
        assert_eq!(registry.consume(&state_b).await, Some(b));
    }
}
