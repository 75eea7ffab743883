use shared::{domain::CorrelationId, error::ApiError};
use thiserror::Error;

/// Failures of the persistent conversation channel. None of them are fatal:
/// transport failures drive the manager into `Reconnecting`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("conversation channel is not connected")]
    NotConnected,
    #[error("connection manager is closed")]
    Closed,
    #[error("failed to open conversation channel: {0}")]
    Connect(String),
    #[error("conversation channel transport failed: {0}")]
    Transport(String),
    #[error("conversation channel closed by peer")]
    ClosedByPeer,
    #[error("invalid conversation channel frame: {0}")]
    Decode(String),
}

/// Failure of a call on the request/response fallback surface.
#[derive(Debug, Clone, Error)]
pub enum RequestError {
    #[error("request to {url} failed: {message}")]
    Transport { url: String, message: String },
    #[error("{url} returned status {status}: {error}")]
    Api {
        url: String,
        status: u16,
        error: ApiError,
    },
    #[error("invalid response from {url}: {message}")]
    Decode { url: String, message: String },
}

#[derive(Debug, Clone, Error)]
pub enum SendError {
    #[error("fallback delivery failed for message {correlation_id}: {source}")]
    Fallback {
        correlation_id: CorrelationId,
        #[source]
        source: RequestError,
    },
    #[error("no failed message with correlation id {0}")]
    UnknownMessage(CorrelationId),
    #[error("message body must not be empty")]
    EmptyBody,
    #[error("conversation session is closed")]
    SessionClosed,
}

impl SendError {
    pub fn correlation_id(&self) -> Option<&CorrelationId> {
        match self {
            Self::Fallback { correlation_id, .. } | Self::UnknownMessage(correlation_id) => {
                Some(correlation_id)
            }
            Self::EmptyBody | Self::SessionClosed => None,
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum UnreadFetchError {
    #[error("failed to fetch unread count: {0}")]
    Request(#[from] RequestError),
    #[error("unread tracker is cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AudioPlaybackError {
    #[error("audio output unavailable: {0}")]
    Unavailable(String),
    #[error("audio playback rejected: {0}")]
    Rejected(String),
}
