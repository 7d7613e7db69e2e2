// ABOUTME: Room records and the process-wide room store persisted as a JSON document.
// ABOUTME: Migrates the legacy flat room list on load and writes atomically via temp file + rename.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

use crate::ids::{canonical_uuid, PersonId, RoomId};
use crate::metrics;

// =============================================================================
// Room model
// =============================================================================

/// The user allowed to manage a room. Both fields empty means no admin was ever set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomAdmin {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
}

impl RoomAdmin {
    pub fn new(email: impl Into<String>, id: &PersonId) -> Self {
        Self {
            email: Some(email.into()),
            id: Some(id.as_str().to_string()),
        }
    }

    pub fn is_set(&self) -> bool {
        let has = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.is_empty());
        has(&self.email) || has(&self.id)
    }

    pub fn is(&self, person: &PersonId) -> bool {
        self.id.as_deref().is_some_and(|id| person.matches(id))
    }
}

/// OAuth credentials for the organization a room manages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthToken {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(
        default = "epoch",
        deserialize_with = "deserialize_lenient_timestamp"
    )]
    pub expires_at: DateTime<Utc>,
}

impl OAuthToken {
    /// Usable at `now`: present and strictly before expiry
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        !self.access_token.is_empty() && now < self.expires_at
    }

    pub fn refresh_token(&self) -> Option<&str> {
        self.refresh_token.as_deref().filter(|t| !t.is_empty())
    }
}

/// The external organization a room is linked to
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedOrg {
    #[serde(default)]
    pub org_id: String,
    #[serde(default)]
    pub org_name: String,
    #[serde(default, deserialize_with = "deserialize_token_slot")]
    pub oauth_tokens: Option<OAuthToken>,
}

impl ManagedOrg {
    pub fn is_linked(&self) -> bool {
        !self.org_id.is_empty()
    }
}

/// A conversation the bot participates in
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub room_id: String,
    #[serde(default)]
    pub room_name: String,
    #[serde(default)]
    pub room_admin: RoomAdmin,
    #[serde(default)]
    pub room_authorized_users: BTreeSet<String>,
    #[serde(default)]
    pub managed_org: ManagedOrg,
}

impl Room {
    pub fn new(room_id: &RoomId, room_name: impl Into<String>) -> Self {
        Self {
            room_id: room_id.as_str().to_string(),
            room_name: room_name.into(),
            room_admin: RoomAdmin::default(),
            room_authorized_users: BTreeSet::new(),
            managed_org: ManagedOrg::default(),
        }
    }

    /// Admin or member of the authorized set
    pub fn permits(&self, person: &PersonId) -> bool {
        self.room_admin.is(person)
            || self
                .room_authorized_users
                .iter()
                .any(|id| person.matches(id))
    }
}

fn epoch() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

/// Accepts RFC 3339, naive `YYYY-MM-DDTHH:MM:SS[.f]` and bare dates (older files)
fn parse_lenient_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(naive.and_utc());
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|naive| naive.and_utc());
    }
    None
}

fn deserialize_lenient_timestamp<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<DateTime<Utc>, D::Error> {
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw
        .as_deref()
        .and_then(parse_lenient_timestamp)
        .unwrap_or_else(epoch))
}

/// `null`, `{}` and objects without an access token all mean "no tokens"
fn deserialize_token_slot<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<OAuthToken>, D::Error> {
    let value = serde_json::Value::deserialize(deserializer)?;
    match &value {
        serde_json::Value::Null => Ok(None),
        serde_json::Value::Object(map) if !map.contains_key("access_token") => Ok(None),
        _ => serde_json::from_value(value)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

// =============================================================================
// Persisted document
// =============================================================================

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to read room store {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write room store {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("room store is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
}

/// On-disk document: `{"rooms": {<room_id>: Room}, ...}`. Unknown top-level keys are kept.
///
/// In memory `rooms` is keyed by the room's UUID so every encoding of one room
/// lands on the same record; on disk each record is keyed by its own `room_id`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreDocument {
    pub rooms: BTreeMap<String, Room>,
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Serialize for StoreDocument {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let rooms: BTreeMap<&str, &Room> = self
            .rooms
            .values()
            .map(|room| (room.room_id.as_str(), room))
            .collect();
        let mut map = serializer.serialize_map(Some(1 + self.extra.len()))?;
        map.serialize_entry("rooms", &rooms)?;
        for (key, value) in &self.extra {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

/// Store key for a room id in any encoding
pub fn room_key(raw: &str) -> String {
    canonical_uuid(raw)
}

/// Key records by UUID; the first record seen for a room wins
fn keyed_by_uuid(rooms: impl IntoIterator<Item = Room>) -> BTreeMap<String, Room> {
    let mut keyed = BTreeMap::new();
    for room in rooms {
        if room.room_id.is_empty() {
            tracing::warn!("Dropping room entry without room_id");
            continue;
        }
        let key = room_key(&room.room_id);
        if keyed.contains_key(&key) {
            tracing::warn!(room_id = %room.room_id, "Dropping duplicate record for the same room");
            continue;
        }
        keyed.insert(key, room);
    }
    keyed
}

impl StoreDocument {
    /// Parse the document, migrating `rooms: [..]` into the keyed form
    pub fn from_json(raw: &str) -> Result<Self, StoreError> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        let mut top: serde_json::Map<String, serde_json::Value> = serde_json::from_str(raw)?;
        let rooms = match top.remove("rooms") {
            None | Some(serde_json::Value::Null) => BTreeMap::new(),
            Some(serde_json::Value::Array(list)) => {
                let rooms = list
                    .into_iter()
                    .map(serde_json::from_value::<Room>)
                    .collect::<Result<Vec<_>, _>>()?;
                let keyed = keyed_by_uuid(rooms);
                tracing::info!(rooms = keyed.len(), "Migrated legacy room list to keyed map");
                keyed
            }
            Some(other) => {
                let on_disk: BTreeMap<String, Room> = serde_json::from_value(other)?;
                keyed_by_uuid(on_disk.into_iter().map(|(key, mut room)| {
                    if room.room_id.is_empty() {
                        room.room_id = key;
                    }
                    room
                }))
            }
        };
        Ok(Self { rooms, extra: top })
    }

    pub fn to_json(&self) -> Result<String, StoreError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

// =============================================================================
// RoomStore
// =============================================================================

/// Single writer for all room records.
///
/// Mutations run as closures under the write lock so a room is never observed
/// half-updated. Callers must re-fetch after any await.
pub struct RoomStore {
    path: Option<PathBuf>,
    doc: RwLock<StoreDocument>,
    save_lock: Mutex<()>,
}

impl RoomStore {
    /// Store that never touches disk
    pub fn in_memory() -> Self {
        Self::from_document(None, StoreDocument::default())
    }

    pub fn from_document(path: Option<PathBuf>, doc: StoreDocument) -> Self {
        metrics::set_rooms_tracked(doc.rooms.len());
        Self {
            path,
            doc: RwLock::new(doc),
            save_lock: Mutex::new(()),
        }
    }

    /// Load from `path`, starting empty when the file is missing.
    ///
    /// An unreadable document is moved aside with a `.corrupt` extension so the next
    /// save cannot destroy it.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "No room store found, starting empty");
                String::new()
            }
            Err(source) => return Err(StoreError::Read { path, source }),
        };

        let doc = match StoreDocument::from_json(&raw) {
            Ok(doc) => doc,
            Err(e) => {
                let aside = path.with_extension("corrupt");
                tracing::warn!(
                    error = %e,
                    path = %path.display(),
                    moved_to = %aside.display(),
                    "Room store unreadable, starting empty"
                );
                tokio::fs::rename(&path, &aside)
                    .await
                    .map_err(|source| StoreError::Write {
                        path: aside.clone(),
                        source,
                    })?;
                StoreDocument::default()
            }
        };

        tracing::info!(path = %path.display(), rooms = doc.rooms.len(), "Room store loaded");
        Ok(Self::from_document(Some(path), doc))
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub async fn get(&self, room_id: &RoomId) -> Option<Room> {
        self.doc.read().await.rooms.get(room_id.uuid()).cloned()
    }

    pub async fn contains(&self, room_id: &RoomId) -> bool {
        self.doc.read().await.rooms.contains_key(room_id.uuid())
    }

    pub async fn list(&self) -> Vec<Room> {
        self.doc.read().await.rooms.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.doc.read().await.rooms.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Insert unless a record already exists. Returns the stored record and whether it was created.
    pub async fn insert_if_absent(&self, room: Room) -> (Room, bool) {
        let key = room_key(&room.room_id);
        let mut doc = self.doc.write().await;
        if let Some(existing) = doc.rooms.get(&key) {
            return (existing.clone(), false);
        }
        doc.rooms.insert(key, room.clone());
        metrics::set_rooms_tracked(doc.rooms.len());
        (room, true)
    }

    /// Apply `f` to the room under the write lock. None when the room is unknown.
    pub async fn update<T>(&self, room_id: &RoomId, f: impl FnOnce(&mut Room) -> T) -> Option<T> {
        let mut doc = self.doc.write().await;
        doc.rooms.get_mut(room_id.uuid()).map(f)
    }

    pub async fn remove(&self, room_id: &RoomId) -> Option<Room> {
        let mut doc = self.doc.write().await;
        let removed = doc.rooms.remove(room_id.uuid());
        metrics::set_rooms_tracked(doc.rooms.len());
        removed
    }

    pub async fn snapshot(&self) -> StoreDocument {
        self.doc.read().await.clone()
    }

    /// Write the document atomically: serialize, write `<path>.tmp`, rename over `<path>`.
    pub async fn save(&self) -> Result<(), StoreError> {
        let Some(path) = self.path.clone() else {
            return Ok(());
        };
        let _guard = self.save_lock.lock().await;
        let json = self.doc.read().await.to_json()?;

        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, json.as_bytes())
            .await
            .map_err(|source| StoreError::Write {
                path: tmp.clone(),
                source,
            })?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|source| StoreError::Write {
                path: path.clone(),
                source,
            })?;
        tracing::debug!(path = %path.display(), "Room store saved");
        Ok(())
    }

    /// Best-effort save for event handlers: failures are logged, never propagated
    pub async fn persist(&self) {
        if let Err(e) = self.save().await {
            tracing::error!(error = %e, "Failed to persist room store");
        }
    }
}
