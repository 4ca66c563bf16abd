//! Background poller for non-active channels
//!
//! Runs on a fixed-interval timer (plus one warm-up run shortly after start).
//! Each cycle takes a bounded batch of background channels in round-robin
//! order and checks them one at a time, pausing for the stagger delay between
//! checks. At most one cycle runs at a time; a tick that finds a cycle still in
//! progress is dropped rather than queued.
//!
//! Each cycle is spawned as its own task, so stopping the timer never cuts an
//! in-flight cycle short. `halt` is the hard stop: it also cancels the cycle.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::instrument;

use crate::config::SchedulerConfig;
use crate::error::{require_channel_id, SchedulerError};

use super::activity::{ActivityCheck, ActivityTracker};
use super::controller::SubscriptionController;
use super::transport::{now_millis, ChannelInfo, ChannelRegistry};

/// Channels visited by one completed cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Channel ids selected for this cycle, in visit order
    pub batch: Vec<String>,
    pub checked: Vec<String>,
    /// Still in cool-down, or became active mid-cycle
    pub skipped: Vec<String>,
    pub failed: Vec<String>,
    pub new_messages: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Another cycle held the in-progress guard
    AlreadyRunning,
    /// No background channels to poll
    Idle,
    Completed(CycleReport),
}

/// Pick up to `batch_size` items starting at `cursor`, wrapping around.
///
/// Returns the batch and the cursor for the next cycle. The cursor is taken
/// modulo the current length, so it stays usable when the set shrinks.
pub fn select_batch<T: Clone>(items: &[T], cursor: usize, batch_size: usize) -> (Vec<T>, usize) {
    if items.is_empty() || batch_size == 0 {
        return (Vec::new(), 0);
    }
    let len = items.len();
    let start = cursor % len;
    let take = batch_size.min(len);
    let batch = (0..take).map(|i| items[(start + i) % len].clone()).collect();
    (batch, (start + batch_size) % len)
}

/// Releases the in-progress flag when dropped, including on unwind
struct CycleGuard<'a>(&'a AtomicBool);

impl<'a> CycleGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Clone)]
pub struct BackgroundPoller {
    tracker: ActivityTracker,
    controller: SubscriptionController,
    registry: Arc<dyn ChannelRegistry>,
    config: Arc<RwLock<SchedulerConfig>>,
    cursor: Arc<AtomicUsize>,
    in_progress: Arc<AtomicBool>,
    timer: Arc<Mutex<Option<JoinHandle<()>>>>,
    /// Last cycle spawned by the timer
    cycle: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl BackgroundPoller {
    pub fn new(
        tracker: ActivityTracker,
        controller: SubscriptionController,
        registry: Arc<dyn ChannelRegistry>,
        config: Arc<RwLock<SchedulerConfig>>,
    ) -> Self {
        Self {
            tracker,
            controller,
            registry,
            config,
            cursor: Arc::new(AtomicUsize::new(0)),
            in_progress: Arc::new(AtomicBool::new(false)),
            timer: Arc::new(Mutex::new(None)),
            cycle: Arc::new(Mutex::new(None)),
        }
    }

    pub fn cursor(&self) -> usize {
        self.cursor.load(Ordering::Acquire)
    }

    pub fn is_cycle_in_progress(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    /// Run one poll cycle now. Never fails: per-channel errors are logged.
    #[instrument(
        name = "scheduler.poller.cycle",
        skip(self),
        fields(batch_size, checked, failed)
    )]
    pub async fn run_cycle(&self) -> CycleOutcome {
        let Some(_guard) = CycleGuard::acquire(&self.in_progress) else {
            tracing::debug!("Previous cycle still running, skipping");
            return CycleOutcome::AlreadyRunning;
        };

        let generation = self.tracker.generation();
        let config = self.config.read().await.clone();
        let active = self.controller.active_id().await;
        let background: Vec<ChannelInfo> = self
            .registry
            .list_channels()
            .into_iter()
            .filter(|c| active.as_deref() != Some(c.id.as_str()))
            .collect();

        if background.is_empty() {
            tracing::trace!("No background channels");
            return CycleOutcome::Idle;
        }

        let cursor = self.cursor.load(Ordering::Acquire);
        let (batch, next_cursor) = select_batch(&background, cursor, config.batch_size);
        self.cursor.store(next_cursor, Ordering::Release);

        let mut report = CycleReport {
            batch: batch.iter().map(|c| c.id.clone()).collect(),
            ..Default::default()
        };
        let stagger = config.stagger_delay();

        for (index, channel) in batch.iter().enumerate() {
            if self.tracker.generation() != generation {
                tracing::debug!("Activity records cleared, abandoning cycle");
                break;
            }
            // The host may have activated this channel while earlier checks ran
            if self.controller.is_active(&channel.id).await {
                report.skipped.push(channel.id.clone());
                continue;
            }
            if self
                .in_cooldown(&channel.id, config.min_poll_interval_ms)
                .await
            {
                tracing::trace!(channel = %channel.id, "Channel in cool-down");
                report.skipped.push(channel.id.clone());
                continue;
            }

            match self
                .tracker
                .check_activity(channel, config.activity_page_size)
                .await
            {
                Ok(check) => {
                    report.new_messages += check.new_messages;
                    report.checked.push(channel.id.clone());
                }
                Err(e) => {
                    tracing::warn!(channel = %channel.id, error = %e, "Activity check failed");
                    report.failed.push(channel.id.clone());
                }
            }

            if index + 1 < batch.len() && !stagger.is_zero() {
                tokio::time::sleep(stagger).await;
            }
        }

        let span = tracing::Span::current();
        span.record("batch_size", report.batch.len());
        span.record("checked", report.checked.len());
        span.record("failed", report.failed.len());
        tracing::debug!(
            next_cursor,
            new_messages = report.new_messages,
            "Poll cycle complete"
        );

        CycleOutcome::Completed(report)
    }

    async fn in_cooldown(&self, channel_id: &str, min_poll_interval_ms: u64) -> bool {
        match self.tracker.get(channel_id).await {
            Some(record) => {
                let since = now_millis().saturating_sub(record.last_checked);
                since < i64::try_from(min_poll_interval_ms).unwrap_or(i64::MAX)
            }
            None => false,
        }
    }

    /// Check one channel immediately, outside the batch schedule.
    ///
    /// Ignores the cool-down and leaves the cursor and cycle guard alone, so it
    /// may run alongside a cycle. Returns `Ok(None)` for the active channel,
    /// where nothing is fetched.
    #[instrument(name = "scheduler.poller.force_poll", skip(self))]
    pub async fn force_poll(&self, channel_id: &str) -> Result<Option<ActivityCheck>, SchedulerError> {
        require_channel_id(channel_id)?;

        if self.controller.is_active(channel_id).await {
            tracing::debug!("Channel is active, nothing to poll");
            return Ok(None);
        }

        let channel = self
            .registry
            .get_channel(channel_id)
            .ok_or_else(|| SchedulerError::UnknownChannel(channel_id.to_string()))?;
        let page_size = self.config.read().await.activity_page_size;

        match self.tracker.check_activity(&channel, page_size).await {
            Ok(check) => Ok(Some(check)),
            Err(source) => {
                tracing::warn!(error = %source, "Forced activity check failed");
                Err(SchedulerError::Poll {
                    channel: channel_id.to_string(),
                    source,
                })
            }
        }
    }

    /// Start the timer. Returns false if it was already running.
    pub async fn start(&self) -> bool {
        let mut timer = self.timer.lock().await;
        if timer.as_ref().is_some_and(|handle| !handle.is_finished()) {
            tracing::debug!("Poller already running");
            return false;
        }

        let this = self.clone();
        *timer = Some(tokio::spawn(async move { this.timer_loop().await }));
        tracing::info!("Background poller started");
        true
    }

    /// Stop the timer. An in-flight cycle is left to finish.
    pub async fn stop(&self) -> bool {
        match self.timer.lock().await.take() {
            Some(handle) => {
                handle.abort();
                tracing::info!("Background poller stopped");
                true
            }
            None => false,
        }
    }

    pub async fn is_running(&self) -> bool {
        self.timer
            .lock()
            .await
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Stop the timer and cancel the cycle it spawned, waiting until that
    /// cycle has released the in-progress guard.
    pub async fn halt(&self) {
        self.stop().await;

        let Some(handle) = self.cycle.lock().await.take() else {
            return;
        };
        if !handle.is_finished() {
            handle.abort();
            tracing::debug!("In-flight cycle cancelled");
        }
        if let Err(e) = handle.await {
            if !e.is_cancelled() {
                tracing::error!(error = %e, "Poll cycle task failed");
            }
        }
    }

    /// Rewind the round-robin cursor
    pub fn reset(&self) {
        self.cursor.store(0, Ordering::Release);
    }

    async fn timer_loop(self) {
        let warmup = self.config.read().await.warmup_delay();
        tokio::time::sleep(warmup).await;

        loop {
            self.spawn_cycle().await;
            // Re-read so interval changes apply from the next tick
            let interval = self.config.read().await.poll_interval();
            tokio::time::sleep(interval).await;
        }
    }

    async fn spawn_cycle(&self) {
        let mut cycle = self.cycle.lock().await;
        if cycle.as_ref().is_some_and(|handle| !handle.is_finished()) {
            tracing::debug!("Previous cycle still running, skipping tick");
            return;
        }

        let this = self.clone();
        *cycle = Some(tokio::spawn(async move {
            if let CycleOutcome::Completed(report) = this.run_cycle().await {
                tracing::trace!(?report, "Cycle report");
            }
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::subscription::memory::MemoryTransport;
    use crate::subscription::transport::{HistoryMessage, LiveHandlers};
    use std::time::Duration;

    fn test_config() -> SchedulerConfig {
        SchedulerConfig {
            batch_size: 10,
            stagger_delay_ms: 0,
            min_poll_interval_ms: 0,
            ..Default::default()
        }
    }

    fn setup(
        channels: &[&str],
        config: SchedulerConfig,
    ) -> (Arc<MemoryTransport>, SubscriptionController, BackgroundPoller) {
        let transport = Arc::new(MemoryTransport::new());
        for id in channels {
            transport.add_channel(id, None);
        }
        let store = Arc::new(MemoryStore::new());
        let tracker = ActivityTracker::new(transport.clone(), store.clone());
        let controller =
            SubscriptionController::new(transport.clone(), transport.clone(), store, tracker.clone());
        let poller = BackgroundPoller::new(
            tracker,
            controller.clone(),
            transport.clone(),
            Arc::new(RwLock::new(config)),
        );
        (transport, controller, poller)
    }

    fn completed(outcome: CycleOutcome) -> CycleReport {
        match outcome {
            CycleOutcome::Completed(report) => report,
            other => panic!("expected a completed cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_select_batch_wraps_around() {
        let items = ["a", "b", "c", "d", "e"];
        let (batch, next) = select_batch(&items, 3, 3);
        assert_eq!(batch, vec!["d", "e", "a"]);
        assert_eq!(next, 1);
    }

    #[test]
    fn test_select_batch_larger_than_set() {
        let items = ["a", "b"];
        let (batch, next) = select_batch(&items, 1, 5);
        assert_eq!(batch, vec!["b", "a"]);
        assert_eq!(next, 0);
    }

    #[test]
    fn test_select_batch_empty_set() {
        let items: [&str; 0] = [];
        assert_eq!(select_batch(&items, 4, 3), (vec![], 0));
    }

    #[test]
    fn test_select_batch_stale_cursor_after_shrink() {
        let items = ["a", "b", "c"];
        let (batch, _) = select_batch(&items, 7, 2);
        assert_eq!(batch, vec!["b", "c"]);
    }

    #[test]
    fn test_round_robin_covers_every_channel() {
        for n in 1..12usize {
            for b in 1..6usize {
                let items: Vec<usize> = (0..n).collect();
                let mut seen = vec![false; n];
                let mut cursor = 0;
                for _ in 0..n.div_ceil(b) {
                    let (batch, next) = select_batch(&items, cursor, b);
                    for i in batch {
                        seen[i] = true;
                    }
                    cursor = next;
                }
                assert!(seen.iter().all(|s| *s), "n={} b={} missed a channel", n, b);
            }
        }
    }

    #[tokio::test]
    async fn test_cycle_never_polls_active_channel() {
        let (transport, controller, poller) = setup(&["a", "b", "c"], test_config());
        controller.set_active("b", None, LiveHandlers::default()).await.unwrap();

        let report = completed(poller.run_cycle().await);

        assert_eq!(report.batch, vec!["a".to_string(), "c".to_string()]);
        assert_eq!(transport.fetch_count("b"), 0);
        assert_eq!(transport.fetch_count("a"), 1);
    }

    #[tokio::test]
    async fn test_cycle_idle_when_only_active_channel() {
        let (_transport, controller, poller) = setup(&["a"], test_config());
        controller.set_active("a", None, LiveHandlers::default()).await.unwrap();

        assert_eq!(poller.run_cycle().await, CycleOutcome::Idle);
    }

    #[tokio::test]
    async fn test_batches_rotate_across_cycles() {
        let config = SchedulerConfig {
            batch_size: 2,
            ..test_config()
        };
        let (_transport, _controller, poller) = setup(&["a", "b", "c"], config);

        let first = completed(poller.run_cycle().await);
        let second = completed(poller.run_cycle().await);

        assert_eq!(first.batch, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(second.batch, vec!["c".to_string(), "a".to_string()]);
        assert_eq!(poller.cursor(), 1);
    }

    #[tokio::test]
    async fn test_recently_checked_channel_is_skipped() {
        let config = SchedulerConfig {
            min_poll_interval_ms: 60_000,
            ..test_config()
        };
        let (transport, _controller, poller) = setup(&["a", "b"], config);

        poller.force_poll("a").await.unwrap();
        let report = completed(poller.run_cycle().await);

        assert_eq!(report.skipped, vec!["a".to_string()]);
        assert_eq!(report.checked, vec!["b".to_string()]);
        assert_eq!(transport.fetch_count("a"), 1);
    }

    #[tokio::test]
    async fn test_failed_fetch_does_not_abort_batch() {
        let (transport, _controller, poller) = setup(&["a", "b", "c"], test_config());
        transport.set_fetch_failure("a", true);
        transport.push_message("c", HistoryMessage::new(5, "m"));

        let report = completed(poller.run_cycle().await);

        assert_eq!(report.failed, vec!["a".to_string()]);
        assert_eq!(report.checked, vec!["b".to_string(), "c".to_string()]);
        assert_eq!(report.new_messages, 1);
        assert!(!poller.is_cycle_in_progress());
    }

    #[tokio::test]
    async fn test_failing_channel_waits_out_cool_down() {
        let config = SchedulerConfig {
            min_poll_interval_ms: 60_000,
            ..test_config()
        };
        let (transport, _controller, poller) = setup(&["a"], config);
        transport.set_fetch_failure("a", true);

        completed(poller.run_cycle().await);
        let second = completed(poller.run_cycle().await);

        assert_eq!(second.skipped, vec!["a".to_string()]);
        assert_eq!(transport.fetch_count("a"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stagger_between_checks_only() {
        let config = SchedulerConfig {
            stagger_delay_ms: 500,
            ..test_config()
        };
        let (_transport, _controller, poller) = setup(&["a", "b", "c"], config);

        let started = tokio::time::Instant::now();
        completed(poller.run_cycle().await);
        let elapsed = started.elapsed();

        assert!(elapsed >= Duration::from_millis(1_000), "elapsed {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(1_500), "elapsed {:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_cycle_is_skipped() {
        let (transport, _controller, poller) = setup(&["a", "b"], test_config());
        transport.set_latency(Duration::from_secs(1));

        let running = tokio::spawn({
            let poller = poller.clone();
            async move { poller.run_cycle().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(poller.is_cycle_in_progress());
        assert_eq!(poller.run_cycle().await, CycleOutcome::AlreadyRunning);

        completed(running.await.unwrap());
        assert!(!poller.is_cycle_in_progress());
    }

    #[tokio::test]
    async fn test_force_poll_skips_active_channel() {
        let (transport, controller, poller) = setup(&["a"], test_config());
        controller.set_active("a", None, LiveHandlers::default()).await.unwrap();

        assert_eq!(poller.force_poll("a").await.unwrap(), None);
        assert_eq!(transport.fetch_count("a"), 0);
    }

    #[tokio::test]
    async fn test_force_poll_reports_fetch_failure() {
        let (transport, _controller, poller) = setup(&["a"], test_config());
        transport.set_fetch_failure("a", true);

        let err = poller.force_poll("a").await.unwrap_err();

        assert!(matches!(err, SchedulerError::Poll { ref channel, .. } if channel == "a"));
        assert_eq!(transport.fetch_count("a"), 1);
    }

    #[tokio::test]
    async fn test_huge_cool_down_still_applies() {
        let config = SchedulerConfig {
            min_poll_interval_ms: u64::MAX,
            ..test_config()
        };
        let (transport, _controller, poller) = setup(&["a"], config);

        poller.force_poll("a").await.unwrap();
        let report = completed(poller.run_cycle().await);

        assert_eq!(report.skipped, vec!["a".to_string()]);
        assert_eq!(transport.fetch_count("a"), 1);
    }

    #[tokio::test]
    async fn test_just_downgraded_channel_waits_out_cool_down() {
        let config = SchedulerConfig {
            min_poll_interval_ms: 60_000,
            ..test_config()
        };
        let (transport, controller, poller) = setup(&["a", "b"], config);
        controller.set_active("a", None, LiveHandlers::default()).await.unwrap();
        controller.set_active("b", None, LiveHandlers::default()).await.unwrap();

        let report = completed(poller.run_cycle().await);

        assert_eq!(report.batch, vec!["a".to_string()]);
        assert_eq!(report.skipped, vec!["a".to_string()]);
        assert_eq!(transport.fetch_count("a"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_halt_cancels_running_cycle() {
        let config = SchedulerConfig {
            warmup_delay_ms: 0,
            ..test_config()
        };
        let (transport, _controller, poller) = setup(&["a", "b"], config);
        transport.set_latency(Duration::from_secs(1));

        poller.start().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(poller.is_cycle_in_progress());

        poller.halt().await;

        assert!(!poller.is_running().await);
        assert!(!poller.is_cycle_in_progress());
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(transport.fetch_count("a"), 1);
        assert_eq!(transport.fetch_count("b"), 0);
    }

    #[tokio::test]
    async fn test_force_poll_leaves_cursor_alone() {
        let (transport, _controller, poller) = setup(&["a", "b"], test_config());
        transport.push_message("b", HistoryMessage::new(1, "m"));

        let check = poller.force_poll("b").await.unwrap().unwrap();

        assert_eq!(check.new_messages, 1);
        assert_eq!(poller.cursor(), 0);
        assert!(matches!(
            poller.force_poll("missing").await,
            Err(SchedulerError::UnknownChannel(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_is_idempotent_and_runs_warmup() {
        let config = SchedulerConfig {
            warmup_delay_ms: 2_000,
            poll_interval_ms: 30_000,
            ..test_config()
        };
        let (transport, _controller, poller) = setup(&["a"], config);

        assert!(poller.start().await);
        assert!(!poller.start().await);
        assert!(poller.is_running().await);

        tokio::time::sleep(Duration::from_millis(2_100)).await;
        assert_eq!(transport.fetch_count("a"), 1);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(transport.fetch_count("a"), 2);

        assert!(poller.stop().await);
        assert!(!poller.is_running().await);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(transport.fetch_count("a"), 2);
    }
}
