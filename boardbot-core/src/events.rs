// ABOUTME: Decoding of raw event-stream frames into typed stream events
// ABOUTME: Classifies conversation activities by verb; anything unrecognised stays an unclassified event

use serde::Deserialize;
use std::fmt;
use thiserror::Error;

use crate::ids::{AttachmentActionId, MessageId, PersonId, RoomId};

pub const CONVERSATION_ACTIVITY: &str = "conversation.activity";

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("frame is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame is not a JSON object")]
    NotAnObject,
}

/// Activity verbs the bot reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Post,
    CardAction,
    Add,
    Leave,
}

impl Verb {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "post" => Some(Self::Post),
            "cardAction" => Some(Self::CardAction),
            "add" => Some(Self::Add),
            "leave" => Some(Self::Leave),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Post => "post",
            Self::CardAction => "cardAction",
            Self::Add => "add",
            Self::Leave => "leave",
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Actor {
    pub id: String,
    pub email: Option<String>,
}

/// A conversation activity with a verb the bot understands
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedActivity {
    pub id: String,
    pub verb: Verb,
    pub actor: Actor,
    pub target: Option<String>,
    pub object: Option<String>,
}

impl ClassifiedActivity {
    pub fn room_id(&self) -> Option<RoomId> {
        self.target
            .as_deref()
            .and_then(|raw| RoomId::parse_or_uuid(raw).ok())
    }

    pub fn actor_id(&self) -> Option<PersonId> {
        PersonId::parse_or_uuid(&self.actor.id).ok()
    }

    /// The person a membership activity is about
    pub fn object_person(&self) -> Option<PersonId> {
        self.object
            .as_deref()
            .and_then(|raw| PersonId::parse_or_uuid(raw).ok())
    }

    pub fn message_id(&self) -> MessageId {
        MessageId::from_uuid(&self.id)
    }

    pub fn attachment_action_id(&self) -> AttachmentActionId {
        AttachmentActionId::from_uuid(&self.id)
    }
}

/// One decoded frame from the event stream
#[derive(Debug, Clone)]
pub struct StreamEvent {
    pub event_type: String,
    pub activity: Option<ClassifiedActivity>,
    /// Verb as sent, kept when it was not one the bot classifies
    pub raw_verb: Option<String>,
    pub payload: serde_json::Value,
}

#[derive(Debug, Default, Deserialize)]
struct RawData {
    #[serde(rename = "eventType", default)]
    event_type: Option<String>,
    #[serde(default)]
    activity: Option<RawActivity>,
}

#[derive(Debug, Default, Deserialize)]
struct RawActivity {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    verb: Option<String>,
    #[serde(default)]
    actor: Option<RawRef>,
    #[serde(default)]
    target: Option<RawRef>,
    #[serde(default)]
    object: Option<RawRef>,
}

#[derive(Debug, Default, Deserialize)]
struct RawRef {
    #[serde(default)]
    id: Option<String>,
    #[serde(rename = "emailAddress", default)]
    email_address: Option<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl StreamEvent {
    /// Decode a text frame. Only malformed JSON is an error; odd shapes become unclassified events.
    pub fn decode(frame: &str) -> Result<Self, DecodeError> {
        let payload: serde_json::Value = serde_json::from_str(frame)?;
        let object = payload.as_object().ok_or(DecodeError::NotAnObject)?;

        let data: RawData = object
            .get("data")
            .cloned()
            .and_then(|d| serde_json::from_value(d).ok())
            .unwrap_or_default();

        let event_type = non_empty(data.event_type)
            .or_else(|| {
                object
                    .get("type")
                    .and_then(|t| t.as_str())
                    .map(str::to_string)
            })
            .unwrap_or_default();

        let mut raw_verb = None;
        let mut activity = None;
        if event_type == CONVERSATION_ACTIVITY {
            if let Some(raw) = data.activity {
                let verb_text = non_empty(raw.verb);
                match (verb_text.as_deref().and_then(Verb::parse), non_empty(raw.id)) {
                    (Some(verb), Some(id)) => {
                        let actor = raw.actor.unwrap_or_default();
                        activity = Some(ClassifiedActivity {
                            id,
                            verb,
                            actor: Actor {
                                id: actor.id.unwrap_or_default(),
                                email: non_empty(actor.email_address),
                            },
                            target: raw.target.and_then(|t| non_empty(t.id)),
                            object: raw.object.and_then(|o| non_empty(o.id)),
                        });
                    }
                    _ => raw_verb = verb_text,
                }
            }
        }

        Ok(Self {
            event_type,
            activity,
            raw_verb,
            payload,
        })
    }

    pub fn verb(&self) -> Option<Verb> {
        self.activity.as_ref().map(|a| a.verb)
    }

    /// Events sharing a key are handled in arrival order; None means the shared lane.
    ///
    /// Keyed by room UUID so both id encodings of one room share a lane.
    pub fn lane_key(&self) -> Option<String> {
        self.activity
            .as_ref()
            .and_then(|a| a.target.as_deref())
            .map(crate::ids::canonical_uuid)
    }
}
