use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    ShotFeedback,
    SessionEnded,
    NotInFrame,
    BackInFrame,
    AngleFeedback,
}

impl MessageKind {
    /// Value of the `type` key on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::ShotFeedback => "shotFeedback",
            MessageKind::SessionEnded => "sessionEnded",
            MessageKind::NotInFrame => "notInFrame",
            MessageKind::BackInFrame => "backInFrame",
            MessageKind::AngleFeedback => "angleFeedback",
        }
    }
}

/// Value of the flat key-value map sent to the wearable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Text(String),
    Flag(bool),
    Number(f64),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Text(s) => write!(f, "{s}"),
            FieldValue::Flag(b) => write!(f, "{b}"),
            FieldValue::Number(n) => write!(f, "{n}"),
        }
    }
}

pub type MessageFields = BTreeMap<String, FieldValue>;

pub const KEY_TYPE: &str = "type";
pub const KEY_ID: &str = "id";
pub const KEY_TIMESTAMP: &str = "timestamp";
pub const KEY_ANGLE: &str = "angle";
pub const KEY_IS_SUCCESSFUL: &str = "isSuccessful";

/// Immutable unit handed to the companion service.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedbackMessage {
    id: Uuid,
    kind: MessageKind,
    /// Unix time in seconds
    timestamp: f64,
    angle: Option<String>,
    is_successful: Option<bool>,
}

impl FeedbackMessage {
    fn new(kind: MessageKind, angle: Option<String>, is_successful: Option<bool>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            timestamp: unix_now(),
            angle,
            is_successful,
        }
    }

    pub fn shot_feedback(angle: impl Into<String>, is_successful: bool) -> Self {
        Self::new(MessageKind::ShotFeedback, Some(angle.into()), Some(is_successful))
    }

    pub fn angle_feedback(angle: impl Into<String>) -> Self {
        Self::new(MessageKind::AngleFeedback, Some(angle.into()), None)
    }

    pub fn session_ended() -> Self {
        Self::new(MessageKind::SessionEnded, None, None)
    }

    pub fn not_in_frame() -> Self {
        Self::new(MessageKind::NotInFrame, None, None)
    }

    pub fn back_in_frame() -> Self {
        Self::new(MessageKind::BackInFrame, None, None)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }

    pub fn angle(&self) -> Option<&str> {
        self.angle.as_deref()
    }

    pub fn is_successful(&self) -> Option<bool> {
        self.is_successful
    }

    /// Flat key-value form sent over the link.
    pub fn to_fields(&self) -> MessageFields {
        let mut fields = MessageFields::new();
        fields.insert(KEY_TYPE.to_string(), FieldValue::Text(self.kind.as_str().to_string()));
        fields.insert(KEY_ID.to_string(), FieldValue::Text(self.id.to_string()));
        fields.insert(KEY_TIMESTAMP.to_string(), FieldValue::Number(self.timestamp));
        if let Some(angle) = &self.angle {
            fields.insert(KEY_ANGLE.to_string(), FieldValue::Text(angle.clone()));
        }
        if let Some(ok) = self.is_successful {
            fields.insert(KEY_IS_SUCCESSFUL.to_string(), FieldValue::Flag(ok));
        }
        fields
    }
}

/// `id` of a received field map, if present.
pub fn message_id(fields: &MessageFields) -> Option<&str> {
    match fields.get(KEY_ID) {
        Some(FieldValue::Text(id)) => Some(id.as_str()),
        _ => None,
    }
}

fn unix_now() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}
