use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use chrono::{DateTime, Utc};
use shared::domain::ConversationId;
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, warn};

use crate::{api::ConversationApi, error::UnreadFetchError};

pub const DEFAULT_MARK_READ_DELAY: Duration = Duration::from_secs(2);

struct TrackerState {
    unread_count: u32,
    last_marked_read_at: Option<DateTime<Utc>>,
    timer: Option<JoinHandle<()>>,
    timer_generation: u64,
    cancelled: bool,
}

struct TrackerShared {
    conversation_id: ConversationId,
    api: Arc<dyn ConversationApi>,
    delay: Duration,
    count_tx: watch::Sender<u32>,
    inner: Mutex<TrackerState>,
}

/// Tracks the unread count of one conversation and acknowledges it after the
/// count has been stable for `delay`.
pub struct UnreadTracker {
    shared: Arc<TrackerShared>,
}

impl UnreadTracker {
    pub fn new(
        conversation_id: ConversationId,
        api: Arc<dyn ConversationApi>,
        delay: Duration,
    ) -> Self {
        let (count_tx, _) = watch::channel(0);
        Self {
            shared: Arc::new(TrackerShared {
                conversation_id,
                api,
                delay,
                count_tx,
                inner: Mutex::new(TrackerState {
                    unread_count: 0,
                    last_marked_read_at: None,
                    timer: None,
                    timer_generation: 0,
                    cancelled: false,
                }),
            }),
        }
    }

    pub fn unread_count(&self) -> u32 {
        self.shared.lock().unread_count
    }

    pub fn last_marked_read_at(&self) -> Option<DateTime<Utc>> {
        self.shared.lock().last_marked_read_at
    }

    pub fn has_pending_mark_read(&self) -> bool {
        self.shared.lock().timer.is_some()
    }

    pub fn watch(&self) -> watch::Receiver<u32> {
        self.shared.count_tx.subscribe()
    }

    /// Reads the server count. Failures are logged and returned; the next
    /// natural trigger simply calls this again.
    pub async fn fetch_unread_count(&self) -> Result<u32, UnreadFetchError> {
        self.shared.fetch().await
    }

    /// Applies a count learned from any source.
    pub fn observe_count(&self, count: u32) {
        self.shared.observe(count);
    }

    /// Drops the pending acknowledgement without side effects. Idempotent.
    pub fn cancel(&self) {
        let timer = {
            let mut guard = self.shared.lock();
            guard.cancelled = true;
            guard.timer.take()
        };
        if let Some(timer) = timer {
            timer.abort();
        }
    }
}

impl Drop for UnreadTracker {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl TrackerShared {
    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn fetch(self: &Arc<Self>) -> Result<u32, UnreadFetchError> {
        if self.lock().cancelled {
            return Err(UnreadFetchError::Cancelled);
        }

        match self.api.unread_count(self.conversation_id).await {
            Ok(count) => {
                if self.lock().cancelled {
                    return Err(UnreadFetchError::Cancelled);
                }
                self.observe(count);
                Ok(count)
            }
            Err(err) => {
                warn!(
                    conversation_id = self.conversation_id.0,
                    error = %err,
                    "unread: failed to fetch unread count"
                );
                Err(err.into())
            }
        }
    }

    fn observe(self: &Arc<Self>, count: u32) {
        {
            let mut guard = self.lock();
            if guard.cancelled || guard.unread_count == count {
                return;
            }
            let previous = guard.unread_count;
            guard.unread_count = count;

            // Reset rather than stack: a pending timer restarts on every change.
            if guard.timer.is_some() || (previous == 0 && count > 0) {
                if let Some(timer) = guard.timer.take() {
                    timer.abort();
                }
                guard.timer_generation += 1;
                let generation = guard.timer_generation;
                guard.timer = Some(tokio::spawn(Arc::clone(self).mark_read_after(generation)));
            }
            // Published under the lock so the watch never lags `unread_count`.
            self.count_tx.send_replace(count);
        }
    }

    async fn mark_read_after(self: Arc<Self>, generation: u64) {
        tokio::time::sleep(self.delay).await;

        {
            let mut guard = self.lock();
            if guard.cancelled || guard.timer_generation != generation {
                return;
            }
            guard.timer = None;
            guard.unread_count = 0;
            guard.last_marked_read_at = Some(Utc::now());
            self.count_tx.send_replace(0);
        }

        debug!(
            conversation_id = self.conversation_id.0,
            "unread: marking conversation read"
        );
        if let Err(err) = self.api.mark_read(self.conversation_id).await {
            warn!(
                conversation_id = self.conversation_id.0,
                error = %err,
                "unread: mark-as-read request failed"
            );
        }
        let _ = self.fetch().await;
    }
}

#[cfg(test)]
#[path = "tests/unread_tests.rs"]
mod tests;
