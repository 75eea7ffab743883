//! In-memory channel and API doubles shared by the crate's tests.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use futures::{channel::mpsc as futures_mpsc, SinkExt};
use shared::{
    domain::{ConversationId, CorrelationId, MessageId, UserId},
    error::{ApiError, ErrorCode},
    protocol::MessagePayload,
};
use tokio::sync::Notify;

use crate::{
    api::ConversationApi,
    error::{ConnectionError, RequestError},
    transport::{ChannelLink, ChannelTransport},
};

/// The server side of an in-memory channel.
pub(crate) struct PeerEnd {
    pub(crate) to_client: futures_mpsc::UnboundedSender<Result<String, ConnectionError>>,
    pub(crate) from_client: futures_mpsc::UnboundedReceiver<String>,
}

pub(crate) fn link_pair() -> (ChannelLink, PeerEnd) {
    let (to_client, client_inbound) = futures_mpsc::unbounded();
    let (client_outbound, from_client) = futures_mpsc::unbounded::<String>();
    let link = ChannelLink {
        sink: Box::pin(
            client_outbound.sink_map_err(|err| ConnectionError::Transport(err.to_string())),
        ),
        stream: Box::pin(client_inbound),
    };
    (
        link,
        PeerEnd {
            to_client,
            from_client,
        },
    )
}

/// Hands out prepared links in order, then refuses connections.
#[derive(Default)]
pub(crate) struct ScriptedTransport {
    links: Mutex<VecDeque<ChannelLink>>,
    open_delay: Duration,
    pub(crate) opens: AtomicUsize,
    in_flight: AtomicUsize,
    pub(crate) max_in_flight: AtomicUsize,
}

impl ScriptedTransport {
    pub(crate) fn with_links(links: Vec<ChannelLink>) -> Arc<Self> {
        Arc::new(Self {
            links: Mutex::new(links.into()),
            ..Self::default()
        })
    }

    pub(crate) fn unreachable(open_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            open_delay,
            ..Self::default()
        })
    }
}

#[async_trait]
impl ChannelTransport for ScriptedTransport {
    async fn open(&self, _conversation_id: ConversationId) -> Result<ChannelLink, ConnectionError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.open_delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        self.links
            .lock()
            .expect("links lock")
            .pop_front()
            .ok_or_else(|| ConnectionError::Connect("connection refused".into()))
    }
}

pub(crate) fn payload(
    id: i64,
    conversation_id: ConversationId,
    sender_id: UserId,
    body: &str,
    correlation_id: Option<CorrelationId>,
) -> MessagePayload {
    MessagePayload {
        id: MessageId(id),
        conversation_id,
        sender_id,
        sender_display_name: format!("user-{}", sender_id.0),
        body: body.to_string(),
        created_at: Utc::now(),
        correlation_id,
    }
}

/// Conversation API backed by memory. Sends are stamped as `sender` and can
/// be made to fail or to wait on `hold_sends`.
pub(crate) struct MockApi {
    pub(crate) sender: UserId,
    pub(crate) history: Mutex<Vec<MessagePayload>>,
    pub(crate) sent: Mutex<Vec<(String, Option<CorrelationId>)>>,
    pub(crate) fail_sends: AtomicBool,
    pub(crate) hold_sends: Mutex<Option<Arc<Notify>>>,
    pub(crate) unread: AtomicU32,
    next_id: AtomicI64,
}

impl MockApi {
    pub(crate) fn new(sender: UserId) -> Arc<Self> {
        Arc::new(Self {
            sender,
            history: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
            fail_sends: AtomicBool::new(false),
            hold_sends: Mutex::new(None),
            unread: AtomicU32::new(0),
            next_id: AtomicI64::new(1_000),
        })
    }

    pub(crate) fn sent_count(&self) -> usize {
        self.sent.lock().expect("sent lock").len()
    }
}

#[async_trait]
impl ConversationApi for MockApi {
    async fn send_message(
        &self,
        conversation_id: ConversationId,
        text: &str,
        correlation_id: Option<&CorrelationId>,
    ) -> Result<MessagePayload, RequestError> {
        let hold = self.hold_sends.lock().expect("hold lock").clone();
        if let Some(hold) = hold {
            hold.notified().await;
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(RequestError::Api {
                url: "mock://send".into(),
                status: 503,
                error: ApiError::new(ErrorCode::Internal, "unavailable"),
            });
        }
        self.sent
            .lock()
            .expect("sent lock")
            .push((text.to_string(), correlation_id.cloned()));
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(payload(
            id,
            conversation_id,
            self.sender,
            text,
            correlation_id.cloned(),
        ))
    }

    async fn fetch_messages(
        &self,
        _conversation_id: ConversationId,
    ) -> Result<Vec<MessagePayload>, RequestError> {
        Ok(self.history.lock().expect("history lock").clone())
    }

    async fn unread_count(&self, _conversation_id: ConversationId) -> Result<u32, RequestError> {
        Ok(self.unread.load(Ordering::SeqCst))
    }

    async fn mark_read(&self, _conversation_id: ConversationId) -> Result<(), RequestError> {
        self.unread.store(0, Ordering::SeqCst);
        Ok(())
    }
}
