use super::*;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use shared::{domain::CorrelationId, protocol::MessagePayload};
use tokio::time::Instant;

use crate::error::RequestError;

const CONVERSATION: ConversationId = ConversationId(8);

#[derive(Default)]
struct CountingApi {
    server_count: AtomicU32,
    fail_fetch: AtomicBool,
    fetches: AtomicU32,
    mark_read_at: Mutex<Vec<Instant>>,
}

impl CountingApi {
    fn mark_read_calls(&self) -> Vec<Instant> {
        self.mark_read_at.lock().expect("lock").clone()
    }
}

#[async_trait]
impl ConversationApi for CountingApi {
    async fn send_message(
        &self,
        _conversation_id: ConversationId,
        _text: &str,
        _correlation_id: Option<&CorrelationId>,
    ) -> Result<MessagePayload, RequestError> {
        unreachable!("not used by the unread tracker")
    }

    async fn fetch_messages(
        &self,
        _conversation_id: ConversationId,
    ) -> Result<Vec<MessagePayload>, RequestError> {
        Ok(Vec::new())
    }

    async fn unread_count(&self, _conversation_id: ConversationId) -> Result<u32, RequestError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(RequestError::Transport {
                url: "/unread-count/".into(),
                message: "connection reset".into(),
            });
        }
        Ok(self.server_count.load(Ordering::SeqCst))
    }

    async fn mark_read(&self, _conversation_id: ConversationId) -> Result<(), RequestError> {
        self.mark_read_at.lock().expect("lock").push(Instant::now());
        self.server_count.store(0, Ordering::SeqCst);
        Ok(())
    }
}

fn tracker(api: &Arc<CountingApi>) -> UnreadTracker {
    UnreadTracker::new(CONVERSATION, api.clone(), DEFAULT_MARK_READ_DELAY)
}

#[tokio::test(start_paused = true)]
async fn rapid_count_changes_coalesce_into_one_mark_read() {
    let api = Arc::new(CountingApi::default());
    let tracker = tracker(&api);

    tracker.observe_count(3);
    tokio::time::sleep(Duration::from_millis(500)).await;
    tracker.observe_count(0);
    tokio::time::sleep(Duration::from_millis(500)).await;
    tracker.observe_count(5);
    let last_change = Instant::now();

    tokio::time::sleep(Duration::from_secs(30)).await;

    let calls = api.mark_read_calls();
    assert_eq!(calls.len(), 1);
    let waited = calls[0] - last_change;
    assert!(waited >= DEFAULT_MARK_READ_DELAY);
    assert!(waited < DEFAULT_MARK_READ_DELAY + Duration::from_millis(10));
}

#[tokio::test(start_paused = true)]
async fn expiry_clears_count_optimistically_and_refetches() {
    let api = Arc::new(CountingApi::default());
    let tracker = tracker(&api);
    let mut counts = tracker.watch();

    tracker.observe_count(2);
    assert!(tracker.has_pending_mark_read());
    counts.changed().await.expect("count published");
    assert_eq!(*counts.borrow_and_update(), 2);

    tokio::time::sleep(Duration::from_secs(3)).await;

    assert_eq!(api.mark_read_calls().len(), 1);
    assert_eq!(api.fetches.load(Ordering::SeqCst), 1);
    assert_eq!(tracker.unread_count(), 0);
    assert!(tracker.last_marked_read_at().is_some());
    assert!(!tracker.has_pending_mark_read());
    assert_eq!(*counts.borrow(), 0);
}

#[tokio::test(start_paused = true)]
async fn messages_arriving_after_acknowledgement_schedule_another_mark_read() {
    let api = Arc::new(CountingApi::default());
    let tracker = tracker(&api);
    tracker.observe_count(1);
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(api.mark_read_calls().len(), 1);

    // the confirming fetch reports new messages that arrived meanwhile
    api.server_count.store(4, Ordering::SeqCst);
    tracker.fetch_unread_count().await.expect("fetch");
    assert!(tracker.has_pending_mark_read());
    tokio::time::sleep(Duration::from_secs(3)).await;

    assert_eq!(api.mark_read_calls().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn cancel_drops_pending_timer_without_side_effects() {
    let api = Arc::new(CountingApi::default());
    let tracker = tracker(&api);

    tracker.observe_count(4);
    tracker.cancel();
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert!(api.mark_read_calls().is_empty());
    assert_eq!(tracker.unread_count(), 4);
    assert!(matches!(
        tracker.fetch_unread_count().await,
        Err(UnreadFetchError::Cancelled)
    ));
    assert_eq!(api.fetches.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn fetch_failure_is_reported_and_retried_on_next_trigger() {
    let api = Arc::new(CountingApi::default());
    api.server_count.store(6, Ordering::SeqCst);
    api.fail_fetch.store(true, Ordering::SeqCst);
    let tracker = tracker(&api);

    let err = tracker.fetch_unread_count().await.expect_err("must fail");
    assert!(matches!(err, UnreadFetchError::Request(_)));
    assert_eq!(tracker.unread_count(), 0);

    api.fail_fetch.store(false, Ordering::SeqCst);
    assert_eq!(tracker.fetch_unread_count().await.expect("fetch"), 6);
    assert_eq!(tracker.unread_count(), 6);
    assert!(tracker.has_pending_mark_read());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_observations_leave_watch_in_step_with_count() {
    let api = Arc::new(CountingApi::default());
    let tracker = Arc::new(UnreadTracker::new(
        CONVERSATION,
        api.clone(),
        Duration::from_secs(60),
    ));

    for round in 0..50u32 {
        let observers: Vec<_> = (1..=8u32)
            .map(|count| {
                let tracker = Arc::clone(&tracker);
                tokio::spawn(async move { tracker.observe_count(round * 10 + count) })
            })
            .collect();
        for observer in observers {
            observer.await.expect("observer task");
        }
        assert_eq!(*tracker.watch().borrow(), tracker.unread_count());
    }
}
