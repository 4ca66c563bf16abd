//! Channel scheduler
//!
//! Wires the activity tracker, the state controller and the background poller
//! into the single object a host application talks to. One instance per
//! application session; `cleanup()` returns it to a blank state on logout.

use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::instrument;

use crate::config::{ConfigUpdate, SchedulerConfig};
use crate::error::{require_channel_id, SchedulerError};

use super::activity::{ActivityCheck, ActivityHandler, ActivityTracker, ChannelActivity};
use super::controller::SubscriptionController;
use super::poller::{BackgroundPoller, CycleOutcome};
use super::transport::{
    now_millis, ChannelRegistry, Credentials, LastAccessStore, LiveHandlers, Transport,
};

#[derive(Clone)]
pub struct ChannelScheduler {
    tracker: ActivityTracker,
    controller: SubscriptionController,
    poller: BackgroundPoller,
    registry: Arc<dyn ChannelRegistry>,
    store: Arc<dyn LastAccessStore>,
    config: Arc<RwLock<SchedulerConfig>>,
}

impl ChannelScheduler {
    pub fn new(
        transport: Arc<dyn Transport>,
        registry: Arc<dyn ChannelRegistry>,
        store: Arc<dyn LastAccessStore>,
        config: SchedulerConfig,
    ) -> Result<Self, SchedulerError> {
        config.validate()?;

        let config = Arc::new(RwLock::new(config));
        let tracker = ActivityTracker::new(transport.clone(), store.clone());
        let controller = SubscriptionController::new(
            transport,
            registry.clone(),
            store.clone(),
            tracker.clone(),
        );
        let poller = BackgroundPoller::new(
            tracker.clone(),
            controller.clone(),
            registry.clone(),
            config.clone(),
        );

        Ok(Self {
            tracker,
            controller,
            poller,
            registry,
            store,
            config,
        })
    }

    // -------------------------------------------------------------------------
    // Active channel
    // -------------------------------------------------------------------------

    /// Give `channel_id` the full live subscription, downgrading whichever
    /// channel held it. Subscription failures are returned to the caller.
    pub async fn set_active(
        &self,
        channel_id: &str,
        credentials: Option<Credentials>,
        handlers: LiveHandlers,
    ) -> Result<(), SchedulerError> {
        self.controller
            .set_active(channel_id, credentials, handlers)
            .await
    }

    pub async fn clear_active(&self) -> Option<String> {
        self.controller.clear_active().await
    }

    pub async fn is_active(&self, channel_id: &str) -> bool {
        self.controller.is_active(channel_id).await
    }

    pub async fn active_id(&self) -> Option<String> {
        self.controller.active_id().await
    }

    /// Channel that was active when the previous session ended
    pub fn last_opened_channel(&self) -> Option<String> {
        self.store.last_opened_channel()
    }

    // -------------------------------------------------------------------------
    // Activity
    // -------------------------------------------------------------------------

    pub async fn on_activity(&self, handler: ActivityHandler) {
        self.tracker.on_activity(handler).await;
    }

    pub async fn off_activity(&self, handler: &ActivityHandler) -> bool {
        self.tracker.off_activity(handler).await
    }

    /// Activity record as the host should see it: the live channel is read
    pub async fn activity(&self, channel_id: &str) -> Option<ChannelActivity> {
        let mut record = self.tracker.get(channel_id).await?;
        if self.is_active(channel_id).await {
            record.unread_count = 0;
        }
        Some(record)
    }

    pub async fn unread_count(&self, channel_id: &str) -> u64 {
        self.activity(channel_id)
            .await
            .map_or(0, |record| record.unread_count)
    }

    /// Mark a channel as viewed: zero its unread count and store the view time
    /// as its last access. Channels without a record are left untouched.
    pub async fn clear_unread(&self, channel_id: &str) -> Result<bool, SchedulerError> {
        require_channel_id(channel_id)?;

        let cleared = self.tracker.clear_unread(channel_id).await;
        if cleared {
            if let Err(e) = self.store.set_last_access(channel_id, now_millis()) {
                tracing::warn!(channel = %channel_id, error = %e, "Failed to persist last access");
            }
        }
        Ok(cleared)
    }

    /// Stop tracking a channel the host has left. If it was active the pointer
    /// is cleared without an unsubscribe; the transport already dropped it.
    #[instrument(name = "scheduler.remove_channel", skip(self))]
    pub async fn remove_channel(&self, channel_id: &str) -> Result<bool, SchedulerError> {
        require_channel_id(channel_id)?;

        let removed = self.tracker.remove(channel_id).await.is_some();
        let was_active = self.controller.forget(channel_id).await;
        tracing::debug!(removed, was_active, "Channel removed from tracking");
        Ok(removed || was_active)
    }

    pub async fn force_poll(
        &self,
        channel_id: &str,
    ) -> Result<Option<ActivityCheck>, SchedulerError> {
        self.poller.force_poll(channel_id).await
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Seed activity records for the registry's channels and start polling.
    /// Returns false if the poller was already running.
    pub async fn start(&self) -> bool {
        let channels = self.registry.list_channels();
        self.tracker
            .seed(channels.iter().map(|c| c.id.as_str()))
            .await;
        self.poller.start().await
    }

    pub async fn stop(&self) -> bool {
        self.poller.stop().await
    }

    pub async fn is_running(&self) -> bool {
        self.poller.is_running().await
    }

    /// Run one poll cycle immediately
    pub async fn run_cycle(&self) -> CycleOutcome {
        self.poller.run_cycle().await
    }

    /// Full teardown: stop polling, cancel a running cycle, release the live
    /// subscription and forget all records, observers and poll position. The
    /// persisted last-opened channel is kept.
    #[instrument(name = "scheduler.cleanup", skip(self))]
    pub async fn cleanup(&self) {
        self.poller.halt().await;
        self.controller.release_active(false).await;
        self.tracker.clear().await;
        self.poller.reset();
        tracing::info!("Scheduler state cleared");
    }

    // -------------------------------------------------------------------------
    // Configuration
    // -------------------------------------------------------------------------

    pub async fn config(&self) -> SchedulerConfig {
        self.config.read().await.clone()
    }

    /// Merge a partial update into the running config. Invalid updates are
    /// rejected as a whole. Timer changes apply from the next tick.
    pub async fn update_config(
        &self,
        update: ConfigUpdate,
    ) -> Result<SchedulerConfig, SchedulerError> {
        let mut config = self.config.write().await;
        let next = config.merged(&update)?;
        *config = next.clone();
        tracing::info!(?update, "Scheduler config updated");
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::subscription::activity::activity_handler;
    use crate::subscription::memory::{MemoryTransport, TransportCall};
    use crate::subscription::transport::HistoryMessage;

    fn setup(channels: &[&str]) -> (Arc<MemoryTransport>, Arc<MemoryStore>, ChannelScheduler) {
        let transport = Arc::new(MemoryTransport::new());
        for id in channels {
            transport.add_channel(id, None);
        }
        let store = Arc::new(MemoryStore::new());
        let config = SchedulerConfig {
            stagger_delay_ms: 0,
            min_poll_interval_ms: 0,
            ..Default::default()
        };
        let scheduler =
            ChannelScheduler::new(transport.clone(), transport.clone(), store.clone(), config)
                .unwrap();
        (transport, store, scheduler)
    }

    #[tokio::test]
    async fn test_active_channel_reports_no_unread() {
        let (transport, _store, scheduler) = setup(&["a"]);
        transport.push_message("a", HistoryMessage::new(10, "m"));
        scheduler.force_poll("a").await.unwrap();
        assert_eq!(scheduler.unread_count("a").await, 1);

        scheduler.set_active("a", None, LiveHandlers::default()).await.unwrap();

        assert_eq!(scheduler.unread_count("a").await, 0);
        assert_eq!(scheduler.activity("a").await.unwrap().unread_count, 0);
    }

    #[tokio::test]
    async fn test_remove_active_channel_skips_unsubscribe() {
        let (transport, _store, scheduler) = setup(&["a"]);
        scheduler.set_active("a", None, LiveHandlers::default()).await.unwrap();
        transport.clear_calls();

        assert!(scheduler.remove_channel("a").await.unwrap());

        assert_eq!(scheduler.active_id().await, None);
        assert!(!transport
            .calls()
            .iter()
            .any(|c| matches!(c, TransportCall::Unsubscribe(_))));
        assert!(scheduler.activity("a").await.is_none());
    }

    #[tokio::test]
    async fn test_clear_unread_records_last_access() {
        let (transport, store, scheduler) = setup(&["a"]);
        transport.push_message("a", HistoryMessage::new(10, "m"));
        scheduler.force_poll("a").await.unwrap();

        assert!(scheduler.clear_unread("a").await.unwrap());

        assert_eq!(scheduler.unread_count("a").await, 0);
        assert!(store.all_last_access().contains_key("a"));
        assert!(matches!(
            scheduler.clear_unread("").await,
            Err(SchedulerError::EmptyChannelId)
        ));
    }

    #[tokio::test]
    async fn test_clear_unread_unknown_channel_persists_nothing() {
        let (_transport, store, scheduler) = setup(&["a"]);

        assert!(!scheduler.clear_unread("typo").await.unwrap());

        assert!(store.all_last_access().is_empty());
    }

    #[tokio::test]
    async fn test_update_config_rejects_invalid_values() {
        let (_transport, _store, scheduler) = setup(&[]);

        let updated = scheduler
            .update_config(ConfigUpdate {
                batch_size: Some(7),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(updated.batch_size, 7);

        let err = scheduler
            .update_config(ConfigUpdate {
                batch_size: Some(1),
                max_concurrent_subscriptions: Some(3),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::Config(_)));
        assert_eq!(scheduler.config().await.batch_size, 7);
    }

    #[tokio::test]
    async fn test_cleanup_resets_everything_but_last_opened() {
        let (transport, store, scheduler) = setup(&["a", "b"]);
        scheduler
            .on_activity(activity_handler(|_, _| Ok(())))
            .await;
        scheduler.set_active("a", None, LiveHandlers::default()).await.unwrap();
        scheduler.start().await;
        scheduler.run_cycle().await;

        scheduler.cleanup().await;

        assert!(!scheduler.is_running().await);
        assert_eq!(scheduler.active_id().await, None);
        assert!(transport.live_subscriptions().is_empty());
        assert!(scheduler.activity("b").await.is_none());
        assert_eq!(scheduler.tracker.observer_count().await, 0);
        assert_eq!(scheduler.poller.cursor(), 0);
        assert_eq!(store.last_opened_channel().as_deref(), Some("a"));
    }
}
