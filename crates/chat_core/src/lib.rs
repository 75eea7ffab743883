use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, Weak,
    },
};

use chrono::Utc;
use shared::{
    domain::{ConversationId, CorrelationId, UserId},
    protocol::MessagePayload,
};
use tokio::{
    sync::{broadcast, watch},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

pub mod api;
pub mod config;
pub mod connection;
pub mod error;
pub mod notifications;
pub mod sound;
pub mod store;
pub mod transport;
pub mod unread;

pub use api::{ConversationApi, HttpConversationApi};
pub use connection::{BackoffPolicy, ConnectionEvent, ConnectionManager, ConnectionState};
pub use error::{AudioPlaybackError, ConnectionError, RequestError, SendError, UnreadFetchError};
pub use notifications::{BridgeSignal, NotificationBridge, NotificationSource};
pub use sound::{Interaction, SoundCapability, SoundGate, SoundGateState};
pub use store::{DeliveryState, MergeOutcome, Message, MessageStore};
pub use transport::{ChannelLink, ChannelTransport, WebSocketTransport};
pub use unread::UnreadTracker;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    pub user_id: UserId,
    pub display_name: String,
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    MessagesChanged,
    ConnectionStateChanged(ConnectionState),
    Warning(String),
}

pub struct SessionOptions {
    pub backoff: BackoffPolicy,
    pub mark_read_delay: std::time::Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            mark_read_delay: unread::DEFAULT_MARK_READ_DELAY,
        }
    }
}

/// Everything a mounted conversation view needs: the message log, its live
/// channel with request fallback, and unread tracking. Closing (or dropping)
/// the session tears all of it down; late results are discarded.
pub struct ConversationSession {
    conversation_id: ConversationId,
    identity: SessionIdentity,
    api: Arc<dyn ConversationApi>,
    connection: ConnectionManager,
    unread: UnreadTracker,
    store: Mutex<MessageStore>,
    // Written to the channel, echo not seen yet.
    channel_sends: Mutex<HashSet<CorrelationId>>,
    events: broadcast::Sender<SessionEvent>,
    closed: AtomicBool,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl ConversationSession {
    /// Mounts a conversation: starts the channel and the event pump. History
    /// is loaded separately with [`ConversationSession::refresh`].
    pub fn open(
        conversation_id: ConversationId,
        identity: SessionIdentity,
        api: Arc<dyn ConversationApi>,
        transport: Arc<dyn ChannelTransport>,
        options: SessionOptions,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        let session = Arc::new(Self {
            conversation_id,
            store: Mutex::new(MessageStore::new(conversation_id, identity.user_id)),
            identity,
            unread: UnreadTracker::new(conversation_id, Arc::clone(&api), options.mark_read_delay),
            connection: ConnectionManager::new(conversation_id, transport, options.backoff),
            api,
            channel_sends: Mutex::new(HashSet::new()),
            events,
            closed: AtomicBool::new(false),
            pump: Mutex::new(None),
        });

        let connection_events = session.connection.subscribe();
        let pump = tokio::spawn(pump_connection_events(
            Arc::downgrade(&session),
            connection_events,
        ));
        *session.lock_pump() = Some(pump);

        if let Err(err) = session.connection.connect() {
            warn!(conversation_id = conversation_id.0, error = %err, "chat: channel not started");
        }
        info!(conversation_id = conversation_id.0, "chat: conversation opened");
        session
    }

    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.lock_store().messages().to_vec()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn unread_count(&self) -> u32 {
        self.unread.unread_count()
    }

    pub fn watch_unread(&self) -> watch::Receiver<u32> {
        self.unread.watch()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn lock_store(&self) -> MutexGuard<'_, MessageStore> {
        self.store
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_channel_sends(&self) -> MutexGuard<'_, HashSet<CorrelationId>> {
        self.channel_sends
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_pump(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.pump
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    /// Fetches history and merges it into the log. Returns how many entries changed.
    pub async fn load_history(&self) -> Result<usize, RequestError> {
        let history = self.api.fetch_messages(self.conversation_id).await?;
        if self.is_closed() {
            return Ok(0);
        }
        let changed = self.lock_store().merge_all(history);
        if changed > 0 {
            self.emit(SessionEvent::MessagesChanged);
        }
        Ok(changed)
    }

    /// Reloads history and the unread count. Failures are logged and surfaced
    /// as warnings; the next trigger retries.
    pub async fn refresh(&self) {
        if let Err(err) = self.load_history().await {
            warn!(
                conversation_id = self.conversation_id.0,
                error = %err,
                "chat: failed to load message history"
            );
            self.emit(SessionEvent::Warning(format!(
                "failed to load message history: {err}"
            )));
        }
        let _ = self.unread.fetch_unread_count().await;
    }

    /// Inserts an optimistic entry and delivers it over the channel, or over
    /// the request path when the channel is down.
    pub async fn send(&self, text: &str) -> Result<CorrelationId, SendError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(SendError::EmptyBody);
        }
        if self.is_closed() {
            return Err(SendError::SessionClosed);
        }

        let correlation_id =
            self.lock_store()
                .push_pending(&self.identity.display_name, text, Utc::now());
        self.emit(SessionEvent::MessagesChanged);
        self.deliver(&correlation_id, text).await?;
        Ok(correlation_id)
    }

    /// Re-sends a `Failed` message: a fallback error, or a channel send whose
    /// link dropped before the echo.
    pub async fn retry(&self, correlation_id: &CorrelationId) -> Result<(), SendError> {
        if self.is_closed() {
            return Err(SendError::SessionClosed);
        }
        let body = self
            .lock_store()
            .mark_retrying(correlation_id)
            .ok_or_else(|| SendError::UnknownMessage(correlation_id.clone()))?;
        self.emit(SessionEvent::MessagesChanged);
        self.deliver(correlation_id, &body).await
    }

    async fn deliver(&self, correlation_id: &CorrelationId, text: &str) -> Result<(), SendError> {
        // Registered before the write so a link drop racing the ack still sees it.
        self.lock_channel_sends().insert(correlation_id.clone());
        match self.connection.send(text, Some(correlation_id.clone())).await {
            Ok(()) => {
                debug!(
                    conversation_id = self.conversation_id.0,
                    %correlation_id,
                    "chat: message written to channel"
                );
                return Ok(());
            }
            Err(err) => {
                self.lock_channel_sends().remove(correlation_id);
                debug!(
                    conversation_id = self.conversation_id.0,
                    %correlation_id,
                    reason = %err,
                    "chat: channel unavailable, using request fallback"
                );
            }
        }

        match self
            .api
            .send_message(self.conversation_id, text, Some(correlation_id))
            .await
        {
            Ok(payload) => {
                if !self.is_closed() {
                    self.lock_store().confirm_sent(correlation_id, payload);
                    self.emit(SessionEvent::MessagesChanged);
                }
                Ok(())
            }
            Err(source) => {
                warn!(
                    conversation_id = self.conversation_id.0,
                    %correlation_id,
                    error = %source,
                    "chat: fallback delivery failed"
                );
                if !self.is_closed() {
                    self.lock_store().mark_failed(correlation_id);
                    self.emit(SessionEvent::MessagesChanged);
                }
                Err(SendError::Fallback {
                    correlation_id: correlation_id.clone(),
                    source,
                })
            }
        }
    }

    fn apply_inbound(&self, payload: MessagePayload) -> MergeOutcome {
        if self.is_closed() {
            return MergeOutcome::Ignored;
        }
        let correlation_id = payload.correlation_id.clone();
        let outcome = self.lock_store().merge(payload);
        if let (MergeOutcome::Reconciled, Some(correlation_id)) = (outcome, correlation_id) {
            self.lock_channel_sends().remove(&correlation_id);
        }
        if outcome.changed() {
            self.emit(SessionEvent::MessagesChanged);
        }
        outcome
    }

    /// The link the pending sends were written on is gone; without an echo
    /// there is no telling whether the server got them. They become `Failed`
    /// so they can be retried, and a later history load still reconciles the
    /// ones that did arrive.
    fn fail_unechoed_channel_sends(&self) {
        if self.is_closed() {
            return;
        }
        let written: Vec<CorrelationId> = self.lock_channel_sends().drain().collect();
        if written.is_empty() {
            return;
        }
        let failed = {
            let mut store = self.lock_store();
            written
                .iter()
                .filter(|correlation_id| store.mark_failed(correlation_id))
                .count()
        };
        if failed > 0 {
            warn!(
                conversation_id = self.conversation_id.0,
                failed, "chat: channel dropped before sends were echoed"
            );
            self.emit(SessionEvent::MessagesChanged);
        }
    }

    /// Unmounts the conversation. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.connection.disconnect();
        self.unread.cancel();
        if let Some(pump) = self.lock_pump().take() {
            pump.abort();
        }
        info!(
            conversation_id = self.conversation_id.0,
            "chat: conversation closed"
        );
    }
}

impl Drop for ConversationSession {
    fn drop(&mut self) {
        self.close();
    }
}

async fn pump_connection_events(
    session: Weak<ConversationSession>,
    mut events: broadcast::Receiver<ConnectionEvent>,
) {
    let mut previous = ConnectionState::Disconnected;
    loop {
        let event = events.recv().await;
        let Some(session) = session.upgrade() else {
            return;
        };
        match event {
            Ok(ConnectionEvent::Message(payload)) => {
                let from_peer = payload.sender_id != session.identity.user_id;
                if session.apply_inbound(payload) == MergeOutcome::Inserted && from_peer {
                    let session = Arc::clone(&session);
                    tokio::spawn(async move {
                        let _ = session.unread.fetch_unread_count().await;
                    });
                }
            }
            Ok(ConnectionEvent::StateChanged(state)) => {
                match (previous, state) {
                    (_, ConnectionState::Reconnecting) => session.fail_unechoed_channel_sends(),
                    // Pushes sent during the outage were missed.
                    (ConnectionState::Reconnecting, ConnectionState::Connected) => {
                        info!(
                            conversation_id = session.conversation_id.0,
                            "chat: channel restored, reloading history"
                        );
                        let session = Arc::clone(&session);
                        tokio::spawn(async move {
                            session.refresh().await;
                        });
                    }
                    _ => {}
                }
                previous = state;
                session.emit(SessionEvent::ConnectionStateChanged(state));
            }
            Ok(ConnectionEvent::Error(err)) => {
                session.emit(SessionEvent::Warning(err.to_string()));
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(
                    conversation_id = session.conversation_id.0,
                    skipped, "chat: channel events lagged, reloading history"
                );
                let session = Arc::clone(&session);
                tokio::spawn(async move {
                    session.refresh().await;
                });
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
