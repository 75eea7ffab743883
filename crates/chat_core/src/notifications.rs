//! Bridges out-of-band notification events (push worker, notification daemon)
//! into foreground effects: a sound and a data-reload signal.

use std::sync::{Arc, Mutex};

use futures::{stream::BoxStream, StreamExt};
use shared::protocol::NotificationEvent;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    sync::broadcast,
    task::JoinHandle,
};
use tokio_stream::wrappers::{BroadcastStream, LinesStream};
use tracing::{debug, info, warn};

use crate::sound::SoundCapability;

/// Where notification events come from. `subscribe` returns `None` when the
/// source is unavailable in the current environment.
pub trait NotificationSource: Send + Sync {
    fn subscribe(&self) -> Option<BoxStream<'static, NotificationEvent>>;
}

/// In-process source fed by a background task through a broadcast channel.
pub struct BroadcastNotificationSource {
    tx: broadcast::Sender<NotificationEvent>,
}

impl BroadcastNotificationSource {
    pub fn new(tx: broadcast::Sender<NotificationEvent>) -> Self {
        Self { tx }
    }
}

impl NotificationSource for BroadcastNotificationSource {
    fn subscribe(&self) -> Option<BoxStream<'static, NotificationEvent>> {
        let stream = BroadcastStream::new(self.tx.subscribe()).filter_map(|event| async move {
            match event {
                Ok(event) => Some(event),
                Err(err) => {
                    warn!(error = %err, "notify: lagged behind notification source");
                    None
                }
            }
        });
        Some(stream.boxed())
    }
}

/// Reads `{"type": ...}` JSON lines from a reader, e.g. a FIFO written by a
/// push daemon. The reader is consumed by the first subscription.
pub struct LineNotificationSource {
    reader: Mutex<Option<Box<dyn AsyncRead + Send + Unpin>>>,
}

impl LineNotificationSource {
    pub fn new(reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self {
            reader: Mutex::new(Some(Box::new(reader))),
        }
    }
}

impl NotificationSource for LineNotificationSource {
    fn subscribe(&self) -> Option<BoxStream<'static, NotificationEvent>> {
        let reader = self.reader.lock().ok()?.take()?;
        let lines = LinesStream::new(BufReader::new(reader).lines());
        let stream = lines
            .take_while(|line| futures::future::ready(line.is_ok()))
            .filter_map(|line| async move {
                let line = line.ok()?;
                let event = NotificationEvent::decode(line.trim());
                if event.is_none() && !line.trim().is_empty() {
                    debug!(%line, "notify: ignoring unrecognised notification");
                }
                event
            });
        Some(stream.boxed())
    }
}

/// Unavailable source; the bridge degrades to a no-op.
pub struct NoNotificationSource;

impl NotificationSource for NoNotificationSource {
    fn subscribe(&self) -> Option<BoxStream<'static, NotificationEvent>> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeSignal {
    Reload,
}

pub struct NotificationBridge {
    sound: Arc<dyn SoundCapability>,
    signals: broadcast::Sender<BridgeSignal>,
    listener: Option<JoinHandle<()>>,
}

impl NotificationBridge {
    /// Installs the subscription. An unavailable source leaves the bridge
    /// attached but inert.
    pub fn attach(source: &dyn NotificationSource, sound: Arc<dyn SoundCapability>) -> Self {
        let (signals, _) = broadcast::channel(32);
        let mut bridge = Self {
            sound,
            signals,
            listener: None,
        };

        match source.subscribe() {
            Some(mut events) => {
                let sound = Arc::clone(&bridge.sound);
                let signals = bridge.signals.clone();
                bridge.listener = Some(tokio::spawn(async move {
                    while let Some(event) = events.next().await {
                        dispatch(event, sound.as_ref(), &signals);
                    }
                    debug!("notify: notification source ended");
                }));
            }
            None => info!("notify: notification source unavailable, bridge inactive"),
        }
        bridge
    }

    pub fn is_active(&self) -> bool {
        self.listener
            .as_ref()
            .is_some_and(|listener| !listener.is_finished())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BridgeSignal> {
        self.signals.subscribe()
    }

    /// Handles one event directly, as the subscription task does.
    pub fn dispatch(&self, event: NotificationEvent) {
        dispatch(event, self.sound.as_ref(), &self.signals);
    }

    /// Removes the subscription. Idempotent.
    pub fn detach(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
    }
}

impl Drop for NotificationBridge {
    fn drop(&mut self) {
        self.detach();
    }
}

fn dispatch(
    event: NotificationEvent,
    sound: &dyn SoundCapability,
    signals: &broadcast::Sender<BridgeSignal>,
) {
    match event {
        NotificationEvent::RequestDataReload => {
            debug!("notify: reload requested");
            let _ = signals.send(BridgeSignal::Reload);
        }
        NotificationEvent::RequestSoundPlayback => sound.play(),
    }
}

#[cfg(test)]
#[path = "tests/notifications_tests.rs"]
mod tests;
