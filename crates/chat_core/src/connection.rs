use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use futures::{SinkExt, StreamExt};
use rand::Rng;
use shared::{
    domain::{ConversationId, CorrelationId},
    protocol::{InboundFrame, MessagePayload, OutboundFrame},
};
use tokio::{
    sync::{broadcast, mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    error::ConnectionError,
    transport::{ChannelLink, ChannelTransport},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Message(MessagePayload),
    StateChanged(ConnectionState),
    Error(ConnectionError),
}

/// Exponential reconnect schedule: `base * 2^(attempt - 1)`, capped at `max`,
/// plus uniform jitter in `[0, delay]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base.as_millis() as u64;
        let max_ms = self.max.as_millis() as u64;
        let multiplier = 1u64
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u64::MAX);
        Duration::from_millis(base_ms.saturating_mul(multiplier).min(max_ms))
    }

    pub fn jitter(delay: Duration) -> Duration {
        let delay_ms = delay.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(0..=delay_ms))
    }

    pub fn delay_with_jitter(&self, attempt: u32) -> Duration {
        let delay = self.delay(attempt);
        delay + Self::jitter(delay)
    }
}

struct OutboundRequest {
    frame: OutboundFrame,
    ack: oneshot::Sender<Result<(), ConnectionError>>,
}

struct ManagerState {
    state: ConnectionState,
    outbound: Option<mpsc::UnboundedSender<OutboundRequest>>,
    driver: Option<JoinHandle<()>>,
}

struct Shared {
    conversation_id: ConversationId,
    transport: Arc<dyn ChannelTransport>,
    backoff: BackoffPolicy,
    events: broadcast::Sender<ConnectionEvent>,
    inner: Mutex<ManagerState>,
}

/// Owns the persistent channel of one conversation.
///
/// A single driver task performs every connection attempt in sequence, so a
/// retry can never overlap another one. Dropping the manager closes it.
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    pub fn new(
        conversation_id: ConversationId,
        transport: Arc<dyn ChannelTransport>,
        backoff: BackoffPolicy,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            shared: Arc::new(Shared {
                conversation_id,
                transport,
                backoff,
                events,
                inner: Mutex::new(ManagerState {
                    state: ConnectionState::Disconnected,
                    outbound: None,
                    driver: None,
                }),
            }),
        }
    }

    pub fn conversation_id(&self) -> ConversationId {
        self.shared.conversation_id
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.shared.events.subscribe()
    }

    /// Starts driving the channel. A no-op while already driving.
    pub fn connect(&self) -> Result<(), ConnectionError> {
        {
            let mut guard = self.shared.lock();
            match guard.state {
                ConnectionState::Closed => return Err(ConnectionError::Closed),
                ConnectionState::Disconnected => guard.state = ConnectionState::Connecting,
                _ => return Ok(()),
            }
        }
        let _ = self
            .shared
            .events
            .send(ConnectionEvent::StateChanged(ConnectionState::Connecting));

        let driver = tokio::spawn(drive(Arc::clone(&self.shared)));
        let mut guard = self.shared.lock();
        if guard.state == ConnectionState::Closed {
            driver.abort();
        } else {
            guard.driver = Some(driver);
        }
        Ok(())
    }

    /// Writes a `send` frame. Fails with `NotConnected` unless the channel is
    /// up; the caller is expected to fall back to the request path then.
    pub async fn send(
        &self,
        text: &str,
        correlation_id: Option<CorrelationId>,
    ) -> Result<(), ConnectionError> {
        let outbound = {
            let guard = self.shared.lock();
            match (guard.state, &guard.outbound) {
                (ConnectionState::Connected, Some(outbound)) => outbound.clone(),
                _ => return Err(ConnectionError::NotConnected),
            }
        };

        let (ack, acked) = oneshot::channel();
        outbound
            .send(OutboundRequest {
                frame: OutboundFrame::Send {
                    text: text.to_string(),
                    correlation_id,
                },
                ack,
            })
            .map_err(|_| ConnectionError::NotConnected)?;
        acked.await.unwrap_or(Err(ConnectionError::NotConnected))
    }

    /// Closes the channel and cancels any scheduled retry. Idempotent.
    pub fn disconnect(&self) {
        let driver = {
            let mut guard = self.shared.lock();
            if guard.state == ConnectionState::Closed {
                return;
            }
            guard.state = ConnectionState::Closed;
            guard.outbound = None;
            guard.driver.take()
        };
        if let Some(driver) = driver {
            driver.abort();
        }
        info!(
            conversation_id = self.shared.conversation_id.0,
            "chat: channel closed"
        );
        let _ = self
            .shared
            .events
            .send(ConnectionEvent::StateChanged(ConnectionState::Closed));
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Moves to `next` unless the manager was closed meanwhile.
    fn transition(&self, next: ConnectionState) -> bool {
        {
            let mut guard = self.lock();
            if guard.state == ConnectionState::Closed {
                return false;
            }
            if guard.state == next {
                return true;
            }
            guard.state = next;
            guard.outbound = None;
        }
        let _ = self.events.send(ConnectionEvent::StateChanged(next));
        true
    }

    fn enter_connected(&self, outbound: mpsc::UnboundedSender<OutboundRequest>) -> bool {
        {
            let mut guard = self.lock();
            if guard.state == ConnectionState::Closed {
                return false;
            }
            guard.state = ConnectionState::Connected;
            guard.outbound = Some(outbound);
        }
        let _ = self
            .events
            .send(ConnectionEvent::StateChanged(ConnectionState::Connected));
        true
    }

    fn report(&self, err: ConnectionError) {
        if self.lock().state == ConnectionState::Closed {
            return;
        }
        warn!(
            conversation_id = self.conversation_id.0,
            error = %err,
            "chat: channel failure"
        );
        let _ = self.events.send(ConnectionEvent::Error(err));
    }

    fn dispatch_inbound(&self, text: &str) {
        match serde_json::from_str::<InboundFrame>(text) {
            Ok(InboundFrame::Message { payload }) => {
                let _ = self.events.send(ConnectionEvent::Message(payload));
            }
            Ok(InboundFrame::Unknown) => {
                debug!(
                    conversation_id = self.conversation_id.0,
                    "chat: ignoring unknown channel frame"
                );
            }
            Err(err) => self.report(ConnectionError::Decode(err.to_string())),
        }
    }

    async fn pump(
        &self,
        link: ChannelLink,
        mut requests: mpsc::UnboundedReceiver<OutboundRequest>,
    ) -> ConnectionError {
        let ChannelLink {
            mut sink,
            mut stream,
        } = link;

        loop {
            tokio::select! {
                inbound = stream.next() => match inbound {
                    Some(Ok(text)) => self.dispatch_inbound(&text),
                    Some(Err(err)) => return err,
                    None => return ConnectionError::ClosedByPeer,
                },
                Some(OutboundRequest { frame, ack }) = requests.recv() => {
                    let text = match serde_json::to_string(&frame) {
                        Ok(text) => text,
                        Err(err) => {
                            let _ = ack.send(Err(ConnectionError::Transport(err.to_string())));
                            continue;
                        }
                    };
                    if let Err(err) = sink.send(text).await {
                        // The caller falls back to the request path.
                        let _ = ack.send(Err(ConnectionError::NotConnected));
                        return err;
                    }
                    let _ = ack.send(Ok(()));
                }
            }
        }
    }
}

async fn drive(shared: Arc<Shared>) {
    let conversation_id = shared.conversation_id.0;
    let mut attempt: u32 = 0;

    loop {
        match shared.transport.open(shared.conversation_id).await {
            Ok(link) => {
                let (outbound, requests) = mpsc::unbounded_channel();
                if !shared.enter_connected(outbound) {
                    return;
                }
                if attempt > 0 {
                    info!(conversation_id, attempt, "chat: channel reconnected");
                } else {
                    info!(conversation_id, "chat: channel connected");
                }
                attempt = 0;
                let err = shared.pump(link, requests).await;
                shared.report(err);
            }
            Err(err) => shared.report(err),
        }

        attempt = attempt.saturating_add(1);
        if !shared.transition(ConnectionState::Reconnecting) {
            return;
        }
        let delay = shared.backoff.delay_with_jitter(attempt);
        debug!(
            conversation_id,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "chat: scheduling reconnect"
        );
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;
