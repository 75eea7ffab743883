//! Transport seam for the persistent conversation channel.

use std::pin::Pin;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::{Sink, SinkExt, Stream, StreamExt};
use shared::domain::ConversationId;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

use crate::error::ConnectionError;

pub type FrameSink = Pin<Box<dyn Sink<String, Error = ConnectionError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, ConnectionError>> + Send>>;

/// An open, authenticated channel carrying JSON text frames.
pub struct ChannelLink {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

#[async_trait]
pub trait ChannelTransport: Send + Sync {
    async fn open(&self, conversation_id: ConversationId) -> Result<ChannelLink, ConnectionError>;
}

/// Websocket transport; authenticates with the bearer token as a query parameter.
pub struct WebSocketTransport {
    ws_base: Url,
    auth_token: String,
}

impl WebSocketTransport {
    pub fn new(ws_base: Url, auth_token: impl Into<String>) -> Self {
        Self {
            ws_base,
            auth_token: auth_token.into(),
        }
    }

    pub fn channel_url(&self, conversation_id: ConversationId) -> Result<Url> {
        let mut url = self
            .ws_base
            .join(&format!("ws/conversations/{conversation_id}/"))
            .with_context(|| format!("invalid channel base url: {}", self.ws_base))?;
        url.query_pairs_mut().append_pair("token", &self.auth_token);
        Ok(url)
    }
}

#[async_trait]
impl ChannelTransport for WebSocketTransport {
    async fn open(&self, conversation_id: ConversationId) -> Result<ChannelLink, ConnectionError> {
        let url = self
            .channel_url(conversation_id)
            .map_err(|err| ConnectionError::Connect(err.to_string()))?;
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| ConnectionError::Connect(err.to_string()))?;
        let (writer, reader) = ws_stream.split();

        let sink = writer
            .with(|text: String| async move {
                Ok::<_, tokio_tungstenite::tungstenite::Error>(Message::Text(text))
            })
            .sink_map_err(|err| ConnectionError::Transport(err.to_string()));
        let stream = reader.filter_map(|msg| async move {
            match msg {
                Ok(Message::Text(text)) => Some(Ok(text)),
                Ok(Message::Close(_)) => Some(Err(ConnectionError::ClosedByPeer)),
                Ok(_) => None,
                Err(err) => Some(Err(ConnectionError::Transport(err.to_string()))),
            }
        });

        Ok(ChannelLink {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}

/// Derives the websocket base from the HTTP server url (`http -> ws`, `https -> wss`).
pub fn ws_base_from_server_url(server_url: &str) -> Result<Url> {
    let ws_url = if let Some(rest) = server_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = server_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        return Err(anyhow!("server_url must start with http:// or https://"));
    };
    let ws_url = if ws_url.ends_with('/') {
        ws_url
    } else {
        format!("{ws_url}/")
    };
    Url::parse(&ws_url).with_context(|| format!("invalid websocket url: {ws_url}"))
}
