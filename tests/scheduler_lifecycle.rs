//! End-to-end scheduler tests against the in-memory transport
//!
//! Timer-driven tests run with a paused tokio clock so warm-up, interval and
//! stagger delays advance instantly.
//!
//! Run with: cargo test --test scheduler_lifecycle
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lookout::config::SchedulerConfig;
use lookout::store::{MemoryStore, StoreState};
use lookout::subscription::{
    activity_handler, ChannelActivity, ChannelScheduler, CycleOutcome, HistoryMessage,
    LiveHandlers, MemoryTransport, TransportCall,
};

type Notifications = Arc<Mutex<Vec<(String, ChannelActivity)>>>;

fn scheduler_with(
    channels: &[&str],
    last_access: &[(&str, i64)],
    config: SchedulerConfig,
) -> (Arc<MemoryTransport>, ChannelScheduler) {
    let transport = Arc::new(MemoryTransport::new());
    for id in channels {
        transport.add_channel(id, None);
    }
    let store = Arc::new(MemoryStore::with_state(StoreState {
        last_access: last_access
            .iter()
            .map(|(id, ts)| (id.to_string(), *ts))
            .collect::<HashMap<_, _>>(),
        last_opened_channel: None,
    }));
    let scheduler =
        ChannelScheduler::new(transport.clone(), transport.clone(), store, config).unwrap();
    (transport, scheduler)
}

fn fast_config() -> SchedulerConfig {
    SchedulerConfig {
        poll_interval_ms: 10_000,
        warmup_delay_ms: 1_000,
        batch_size: 2,
        stagger_delay_ms: 200,
        min_poll_interval_ms: 0,
        ..Default::default()
    }
}

async fn record_notifications(scheduler: &ChannelScheduler) -> Notifications {
    let seen: Notifications = Arc::default();
    let sink = seen.clone();
    scheduler
        .on_activity(activity_handler(move |id, record| {
            sink.lock().unwrap().push((id.to_string(), *record));
            Ok(())
        }))
        .await;
    seen
}

#[tokio::test(start_paused = true)]
async fn warmup_cycle_reports_new_background_activity() {
    let (transport, scheduler) = scheduler_with(&["ch1", "ch2"], &[("ch1", 100)], fast_config());
    for ts in [90, 110, 120] {
        transport.push_message("ch1", HistoryMessage::new(ts, "m"));
    }
    let seen = record_notifications(&scheduler).await;

    scheduler
        .set_active("ch2", None, LiveHandlers::default())
        .await
        .unwrap();
    assert!(scheduler.start().await);
    tokio::time::sleep(Duration::from_millis(1_500)).await;

    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].0, "ch1");
    assert_eq!(seen[0].1.unread_count, 2);
    assert_eq!(seen[0].1.last_message_time, 120);
    assert_eq!(scheduler.unread_count("ch1").await, 2);
    assert_eq!(transport.fetch_count("ch2"), 0);

    scheduler.cleanup().await;
}

#[tokio::test(start_paused = true)]
async fn failing_channel_does_not_stop_the_timer() {
    let (transport, scheduler) = scheduler_with(&["a", "b"], &[], fast_config());
    transport.set_fetch_failure("a", true);

    scheduler.start().await;
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert_eq!(transport.fetch_count("a"), 1);
    assert_eq!(transport.fetch_count("b"), 1);

    transport.set_fetch_failure("a", false);
    transport.push_message("a", HistoryMessage::new(42, "recovered"));
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert!(scheduler.is_running().await);
    assert_eq!(transport.fetch_count("a"), 2);
    assert_eq!(scheduler.unread_count("a").await, 1);

    scheduler.stop().await;
}

#[tokio::test]
async fn switching_channels_holds_one_live_subscription() {
    let channels = ["a", "b", "c", "d", "e"];
    let config = SchedulerConfig {
        stagger_delay_ms: 0,
        ..fast_config()
    };
    let (transport, scheduler) = scheduler_with(&channels, &[], config);

    for round in 0..3 {
        for id in channels {
            scheduler
                .set_active(id, None, LiveHandlers::default())
                .await
                .unwrap();
            if let CycleOutcome::Completed(report) = scheduler.run_cycle().await {
                assert!(!report.batch.iter().any(|c| c == id), "round {}", round);
            }
            assert_eq!(transport.live_subscriptions(), vec![id.to_string()]);
        }
    }

    assert_eq!(transport.peak_live_subscriptions(), 1);
}

#[tokio::test]
async fn switch_sends_unsubscribe_before_subscribe() {
    let (transport, scheduler) = scheduler_with(&["a", "b"], &[], fast_config());

    scheduler.set_active("a", None, LiveHandlers::default()).await.unwrap();
    scheduler.set_active("b", None, LiveHandlers::default()).await.unwrap();

    let calls = transport.calls();
    let unsub_a = calls
        .iter()
        .position(|c| *c == TransportCall::Unsubscribe("a".to_string()))
        .unwrap();
    let sub_b = calls
        .iter()
        .position(|c| *c == TransportCall::SubscribeFull("b".to_string()))
        .unwrap();
    assert!(unsub_a < sub_b);
    assert_eq!(
        calls
            .iter()
            .filter(|c| matches!(c, TransportCall::Unsubscribe(_)))
            .count(),
        1
    );
}

#[tokio::test]
async fn removing_left_channel_clears_pointer_quietly() {
    let (transport, scheduler) = scheduler_with(&["a", "b"], &[], fast_config());
    scheduler.set_active("a", None, LiveHandlers::default()).await.unwrap();

    // The host leaves the channel: the transport tears it down first
    transport.remove_channel("a");
    transport.clear_calls();
    scheduler.remove_channel("a").await.unwrap();

    assert_eq!(scheduler.active_id().await, None);
    assert!(transport.calls().is_empty());
    assert!(!scheduler.is_active("a").await);
}

#[tokio::test]
async fn force_poll_on_active_channel_fetches_nothing() {
    let (transport, scheduler) = scheduler_with(&["a"], &[], fast_config());
    scheduler.set_active("a", None, LiveHandlers::default()).await.unwrap();

    assert!(scheduler.force_poll("a").await.unwrap().is_none());
    assert_eq!(transport.fetch_count("a"), 0);
}

#[tokio::test(start_paused = true)]
async fn cleanup_cancels_cycle_in_flight() {
    let config = SchedulerConfig {
        warmup_delay_ms: 0,
        ..fast_config()
    };
    let (transport, scheduler) = scheduler_with(&["a", "b"], &[], config);
    transport.set_latency(Duration::from_secs(1));

    scheduler.start().await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    scheduler.cleanup().await;

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(scheduler.activity("a").await.is_none());
    assert!(scheduler.activity("b").await.is_none());
    assert_eq!(transport.fetch_count("b"), 0);

    // The next session gets a clean guard: cycles still never overlap
    let first = tokio::spawn({
        let scheduler = scheduler.clone();
        async move { scheduler.run_cycle().await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(scheduler.run_cycle().await, CycleOutcome::AlreadyRunning);
    assert!(matches!(
        first.await.unwrap(),
        CycleOutcome::Completed(report) if report.checked.len() == 2
    ));
}
