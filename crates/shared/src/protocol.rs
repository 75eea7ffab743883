use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{ConversationId, CorrelationId, MessageId, UserId};

/// A message as the server reports it, over the channel or over HTTP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    #[serde(default)]
    pub sender_display_name: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
}

/// Frames pushed by the server over the persistent conversation channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundFrame {
    Message {
        payload: MessagePayload,
    },
    #[serde(other)]
    Unknown,
}

/// Frames the client writes to the persistent conversation channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    Send {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        correlation_id: Option<CorrelationId>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct UnreadCountResponse {
    pub unread_count: u32,
}

/// Events delivered out-of-band by a background context (push worker,
/// notification daemon) to the foreground client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum NotificationEvent {
    #[serde(rename = "RELOAD_PAGE")]
    RequestDataReload,
    #[serde(rename = "PLAY_NOTIFICATION_SOUND")]
    RequestSoundPlayback,
}

#[derive(Deserialize)]
struct NotificationEnvelope {
    #[serde(rename = "type")]
    kind: String,
}

impl NotificationEvent {
    /// Decodes a `{"type": ...}` envelope. Unknown or malformed events yield `None`.
    pub fn decode(raw: &str) -> Option<Self> {
        let envelope: NotificationEnvelope = serde_json::from_str(raw).ok()?;
        match envelope.kind.as_str() {
            "RELOAD_PAGE" => Some(Self::RequestDataReload),
            "PLAY_NOTIFICATION_SOUND" => Some(Self::RequestSoundPlayback),
            _ => None,
        }
    }
}
