// ABOUTME: Typed platform identifiers encoded as unpadded base64 of a ciscospark:// URI
// ABOUTME: One codec for rooms, messages, attachment actions and people so kinds cannot be mixed

use base64::engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD};
use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use thiserror::Error;

/// URI scheme used inside every encoded identifier
const SCHEME: &str = "ciscospark://";

/// Cluster segment used when encoding identifiers from raw activity UUIDs
const DEFAULT_CLUSTER: &str = "us";

/// The kind of object an identifier points at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdKind {
    Room,
    Message,
    AttachmentAction,
    Person,
}

impl IdKind {
    /// Path segment used inside the encoded URI
    pub fn segment(self) -> &'static str {
        match self {
            Self::Room => "ROOM",
            Self::Message => "MESSAGE",
            Self::AttachmentAction => "ATTACHMENT_ACTION",
            Self::Person => "PEOPLE",
        }
    }
}

impl fmt::Display for IdKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.segment())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdError {
    #[error("identifier is empty")]
    Empty,
    #[error("identifier is not valid base64")]
    Base64,
    #[error("identifier is not a ciscospark:// URI: {0}")]
    NotPlatformUri(String),
    #[error("expected a {expected} identifier, found {found}")]
    WrongKind { expected: IdKind, found: String },
}

/// Marker trait tying a zero-sized kind type to its [`IdKind`]
pub trait Kind: Send + Sync + 'static {
    const KIND: IdKind;
}

macro_rules! id_kind {
    ($marker:ident, $kind:expr) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $marker {}

        impl Kind for $marker {
            const KIND: IdKind = $kind;
        }
    };
}

id_kind!(RoomKind, IdKind::Room);
id_kind!(MessageKind, IdKind::Message);
id_kind!(AttachmentActionKind, IdKind::AttachmentAction);
id_kind!(PersonKind, IdKind::Person);

pub type RoomId = PlatformId<RoomKind>;
pub type MessageId = PlatformId<MessageKind>;
pub type AttachmentActionId = PlatformId<AttachmentActionKind>;
pub type PersonId = PlatformId<PersonKind>;

/// An encoded platform identifier of kind `K`.
///
/// Keeps both the encoded form (what the REST API expects) and the trailing
/// UUID (what the event stream carries).
pub struct PlatformId<K: Kind> {
    encoded: String,
    uuid: String,
    _kind: PhantomData<K>,
}

impl<K: Kind> PlatformId<K> {
    /// Build the identifier for a raw UUID as seen on the event stream
    pub fn from_uuid(uuid: &str) -> Self {
        let uri = format!("{SCHEME}{DEFAULT_CLUSTER}/{}/{uuid}", K::KIND.segment());
        Self {
            encoded: STANDARD_NO_PAD.encode(uri.as_bytes()),
            uuid: uuid.to_string(),
            _kind: PhantomData,
        }
    }

    /// Parse an encoded identifier, rejecting other kinds
    pub fn parse(encoded: &str) -> Result<Self, IdError> {
        let (kind, uuid) = decode(encoded)?;
        if kind != K::KIND.segment() {
            return Err(IdError::WrongKind {
                expected: K::KIND,
                found: kind,
            });
        }
        Ok(Self {
            encoded: encoded.trim_end_matches('=').to_string(),
            uuid,
            _kind: PhantomData,
        })
    }

    /// Accept either an encoded identifier or a bare UUID
    pub fn parse_or_uuid(value: &str) -> Result<Self, IdError> {
        match Self::parse(value) {
            Ok(id) => Ok(id),
            Err(IdError::WrongKind { expected, found }) => {
                Err(IdError::WrongKind { expected, found })
            }
            Err(_) if !value.trim().is_empty() => Ok(Self::from_uuid(value.trim())),
            Err(e) => Err(e),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.encoded
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn kind(&self) -> IdKind {
        K::KIND
    }

    /// True when `raw` names the same object: a bare UUID, or an encoding of
    /// this kind from any cluster
    pub fn matches(&self, raw: &str) -> bool {
        match decode(raw) {
            Ok((kind, uuid)) if kind == K::KIND.segment() => uuid == self.uuid,
            _ => raw.trim() == self.uuid,
        }
    }
}

/// The UUID that identifies `raw` regardless of how it was encoded.
///
/// Values that do not decode are assumed to already be bare UUIDs.
pub fn canonical_uuid(raw: &str) -> String {
    match decode(raw) {
        Ok((_, uuid)) => uuid,
        Err(_) => raw.trim().to_string(),
    }
}

/// Split an encoded identifier into its kind segment and UUID
pub fn decode(encoded: &str) -> Result<(String, String), IdError> {
    let trimmed = encoded.trim().trim_end_matches('=');
    if trimmed.is_empty() {
        return Err(IdError::Empty);
    }
    let bytes = STANDARD_NO_PAD
        .decode(trimmed)
        .or_else(|_| URL_SAFE_NO_PAD.decode(trimmed))
        .map_err(|_| IdError::Base64)?;
    let uri = String::from_utf8(bytes).map_err(|_| IdError::Base64)?;
    let rest = uri
        .strip_prefix(SCHEME)
        .ok_or_else(|| IdError::NotPlatformUri(uri.clone()))?;

    // rest = <cluster>/<KIND>/<uuid>
    let mut parts = rest.splitn(3, '/');
    let (Some(_cluster), Some(kind), Some(uuid)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(IdError::NotPlatformUri(uri));
    };
    if uuid.is_empty() {
        return Err(IdError::NotPlatformUri(uri));
    }
    Ok((kind.to_string(), uuid.to_string()))
}

impl<K: Kind> Clone for PlatformId<K> {
    fn clone(&self) -> Self {
        Self {
            encoded: self.encoded.clone(),
            uuid: self.uuid.clone(),
            _kind: PhantomData,
        }
    }
}

impl<K: Kind> PartialEq for PlatformId<K> {
    fn eq(&self, other: &Self) -> bool {
        self.uuid == other.uuid
    }
}

impl<K: Kind> Eq for PlatformId<K> {}

impl<K: Kind> Hash for PlatformId<K> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.uuid.hash(state);
    }
}

impl<K: Kind> fmt::Debug for PlatformId<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", K::KIND, self.uuid)
    }
}

impl<K: Kind> fmt::Display for PlatformId<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encoded)
    }
}

impl<K: Kind> Serialize for PlatformId<K> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.encoded)
    }
}

impl<'de, K: Kind> Deserialize<'de> for PlatformId<K> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_id_matches_known_encoding() {
        // base64("ciscospark://us/ROOM/abc") without padding
        let id = RoomId::from_uuid("abc");
        assert_eq!(id.as_str(), "Y2lzY29zcGFyazovL3VzL1JPT00vYWJj");
        assert_eq!(id.uuid(), "abc");
        assert_eq!(id.kind(), IdKind::Room);
    }

    #[test]
    fn test_parse_accepts_padded_input() {
        let id = PersonId::from_uuid("1234-5678");
        let padded = format!("{}==", id.as_str());
        let parsed = PersonId::parse(&padded).unwrap();
        assert_eq!(parsed, id);
        assert_eq!(parsed.as_str(), id.as_str());
    }

    #[test]
    fn test_parse_rejects_other_kind() {
        let message = MessageId::from_uuid("m-1");
        let err = RoomId::parse(message.as_str()).unwrap_err();
        assert_eq!(
            err,
            IdError::WrongKind {
                expected: IdKind::Room,
                found: "MESSAGE".to_string()
            }
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(RoomId::parse(""), Err(IdError::Empty));
        assert_eq!(RoomId::parse("!!!"), Err(IdError::Base64));
        let not_uri = STANDARD_NO_PAD.encode("hello world");
        assert!(matches!(
            RoomId::parse(&not_uri),
            Err(IdError::NotPlatformUri(_))
        ));
    }

    #[test]
    fn test_parse_or_uuid_falls_back_to_raw_uuid() {
        let id = PersonId::parse_or_uuid("d5c6-uuid").unwrap();
        assert_eq!(id.uuid(), "d5c6-uuid");
        assert_eq!(id, PersonId::from_uuid("d5c6-uuid"));
    }

    #[test]
    fn test_matches_encoded_and_uuid() {
        let bot = PersonId::from_uuid("bot-uuid");
        assert!(bot.matches("bot-uuid"));
        assert!(bot.matches(bot.as_str()));
        assert!(!bot.matches("someone-else"));
    }

    #[test]
    fn test_other_cluster_is_the_same_object() {
        let rest_form = STANDARD_NO_PAD.encode("ciscospark://urn:TEAM:eu-central-1_k/ROOM/abc-123");
        let from_rest = RoomId::parse(&rest_form).unwrap();
        let from_stream = RoomId::from_uuid("abc-123");

        assert_eq!(from_rest, from_stream);
        assert_ne!(from_rest.as_str(), from_stream.as_str());
        assert!(from_stream.matches(&rest_form));
        assert!(from_rest.matches(from_stream.as_str()));
        assert_eq!(canonical_uuid(&rest_form), "abc-123");
        assert_eq!(canonical_uuid("abc-123"), "abc-123");
    }

    #[test]
    fn test_matches_ignores_other_kinds() {
        let person = PersonId::from_uuid("shared");
        let room = RoomId::from_uuid("shared");
        assert!(!person.matches(room.as_str()));
    }

    #[test]
    fn test_attachment_action_segment() {
        let id = AttachmentActionId::from_uuid("act");
        let (kind, uuid) = decode(id.as_str()).unwrap();
        assert_eq!(kind, "ATTACHMENT_ACTION");
        assert_eq!(uuid, "act");
    }

    #[test]
    fn test_serde_uses_encoded_form() {
        let id = RoomId::from_uuid("r1");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.as_str()));
        let back: RoomId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
