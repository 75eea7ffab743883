use super::*;
use std::{
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

#[derive(Default)]
struct CountingSound {
    plays: AtomicUsize,
}

impl SoundCapability for CountingSound {
    fn try_unlock(&self) -> bool {
        true
    }

    fn is_unlocked(&self) -> bool {
        true
    }

    fn play(&self) {
        self.plays.fetch_add(1, Ordering::SeqCst);
    }
}

async fn expect_signal(signals: &mut broadcast::Receiver<BridgeSignal>) -> BridgeSignal {
    tokio::time::timeout(Duration::from_secs(1), signals.recv())
        .await
        .expect("signal in time")
        .expect("signal channel open")
}

async fn wait_for_plays(sound: &CountingSound, expected: usize) {
    tokio::time::timeout(Duration::from_secs(1), async {
        while sound.plays.load(Ordering::SeqCst) < expected {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("sound played in time");
}

#[tokio::test]
async fn broadcast_events_trigger_reload_and_sound() {
    let (tx, _) = broadcast::channel(8);
    let source = BroadcastNotificationSource::new(tx.clone());
    let sound = Arc::new(CountingSound::default());
    let bridge = NotificationBridge::attach(&source, sound.clone());
    let mut signals = bridge.subscribe();
    assert!(bridge.is_active());

    tx.send(NotificationEvent::RequestDataReload).expect("send");
    tx.send(NotificationEvent::RequestSoundPlayback).expect("send");
    tx.send(NotificationEvent::RequestSoundPlayback).expect("send");

    assert_eq!(expect_signal(&mut signals).await, BridgeSignal::Reload);
    wait_for_plays(&sound, 2).await;
}

#[tokio::test]
async fn line_source_decodes_json_and_skips_noise() {
    let input: &[u8] =
        b"{\"type\":\"PLAY_NOTIFICATION_SOUND\"}\n\nnot json\n{\"type\":\"RELOAD_PAGE\"}\n";
    let source = LineNotificationSource::new(input);
    let sound = Arc::new(CountingSound::default());
    let bridge = NotificationBridge::attach(&source, sound.clone());
    let mut signals = bridge.subscribe();

    assert_eq!(expect_signal(&mut signals).await, BridgeSignal::Reload);
    wait_for_plays(&sound, 1).await;
    assert!(
        source.subscribe().is_none(),
        "reader is consumed by the first subscription"
    );
}

#[tokio::test]
async fn unavailable_source_is_a_silent_no_op() {
    let sound = Arc::new(CountingSound::default());
    let mut bridge = NotificationBridge::attach(&NoNotificationSource, sound.clone());

    assert!(!bridge.is_active());
    bridge.detach();
    bridge.detach();
    assert_eq!(sound.plays.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn detach_stops_dispatching() {
    let (tx, _) = broadcast::channel(8);
    let source = BroadcastNotificationSource::new(tx.clone());
    let sound = Arc::new(CountingSound::default());
    let mut bridge = NotificationBridge::attach(&source, sound.clone());

    bridge.detach();
    tokio::task::yield_now().await;
    let _ = tx.send(NotificationEvent::RequestSoundPlayback);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(sound.plays.load(Ordering::SeqCst), 0);
    assert!(!bridge.is_active());
}

#[test]
fn direct_dispatch_repeats_effects() {
    let sound = Arc::new(CountingSound::default());
    let bridge = NotificationBridge::attach(&NoNotificationSource, sound.clone());
    let mut signals = bridge.subscribe();

    bridge.dispatch(NotificationEvent::RequestDataReload);
    bridge.dispatch(NotificationEvent::RequestDataReload);
    bridge.dispatch(NotificationEvent::RequestSoundPlayback);
    bridge.dispatch(NotificationEvent::RequestSoundPlayback);

    assert_eq!(signals.try_recv(), Ok(BridgeSignal::Reload));
    assert_eq!(signals.try_recv(), Ok(BridgeSignal::Reload));
    assert_eq!(sound.plays.load(Ordering::SeqCst), 2);
}
