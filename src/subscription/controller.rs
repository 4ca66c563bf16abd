//! Active/background state controller
//!
//! Holds the single active-channel pointer. Exactly one channel may own a full
//! live subscription; switching channels downgrades the previous one to
//! background (snapshot its activity, then release the subscription) before
//! the new one is subscribed. Transitions are serialized so concurrent callers
//! can never leave two live subscriptions behind.

use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::instrument;

use crate::error::{require_channel_id, SchedulerError};

use super::activity::{ActivityTracker, ChannelActivity};
use super::transport::{
    now_millis, ChannelRegistry, Credentials, LastAccessStore, LiveHandlers, Transport,
};

#[derive(Clone)]
pub struct SubscriptionController {
    active: Arc<RwLock<Option<String>>>,
    /// Held for the whole of a state transition
    transition: Arc<Mutex<()>>,
    transport: Arc<dyn Transport>,
    registry: Arc<dyn ChannelRegistry>,
    store: Arc<dyn LastAccessStore>,
    tracker: ActivityTracker,
}

impl SubscriptionController {
    pub fn new(
        transport: Arc<dyn Transport>,
        registry: Arc<dyn ChannelRegistry>,
        store: Arc<dyn LastAccessStore>,
        tracker: ActivityTracker,
    ) -> Self {
        Self {
            active: Arc::new(RwLock::new(None)),
            transition: Arc::new(Mutex::new(())),
            transport,
            registry,
            store,
            tracker,
        }
    }

    pub async fn is_active(&self, channel_id: &str) -> bool {
        self.active.read().await.as_deref() == Some(channel_id)
    }

    pub async fn active_id(&self) -> Option<String> {
        self.active.read().await.clone()
    }

    /// Make `channel_id` the one fully subscribed channel.
    ///
    /// The pointer is set before the subscribe request so poll cycles exclude
    /// the channel immediately. If the subscribe fails the pointer stays set
    /// and the error is returned; the caller decides whether to retry or to
    /// call [`clear_active`](Self::clear_active).
    #[instrument(name = "scheduler.controller.set_active", skip(self, credentials, handlers))]
    pub async fn set_active(
        &self,
        channel_id: &str,
        credentials: Option<Credentials>,
        handlers: LiveHandlers,
    ) -> Result<(), SchedulerError> {
        require_channel_id(channel_id)?;
        let _transition = self.transition.lock().await;

        let previous = self.active_id().await;
        if previous.as_deref() == Some(channel_id) {
            tracing::debug!("Channel already active");
            return Ok(());
        }

        if let Some(previous) = previous {
            self.downgrade(&previous).await;
        }

        *self.active.write().await = Some(channel_id.to_string());
        if let Err(e) = self.store.set_last_opened_channel(Some(channel_id)) {
            tracing::warn!(error = %e, "Failed to persist last opened channel");
        }

        let credentials = credentials.or_else(|| {
            self.registry
                .get_channel(channel_id)
                .and_then(|c| c.credentials)
        });

        self.transport
            .subscribe_full(channel_id, credentials.as_ref(), handlers)
            .await
            .map_err(|source| {
                tracing::error!(error = %source, "Full subscription failed");
                SchedulerError::Subscribe {
                    channel: channel_id.to_string(),
                    source,
                }
            })?;

        tracing::info!("Channel active");
        Ok(())
    }

    /// Downgrade the active channel, if any, and clear the pointer
    pub async fn clear_active(&self) -> Option<String> {
        self.release_active(true).await
    }

    /// Clear the active channel. With `persist` false the stored
    /// last-opened channel is left as is, so it can be restored next session.
    pub(crate) async fn release_active(&self, persist: bool) -> Option<String> {
        let _transition = self.transition.lock().await;

        let previous = self.active_id().await?;
        self.downgrade(&previous).await;
        *self.active.write().await = None;

        if persist {
            if let Err(e) = self.store.set_last_opened_channel(None) {
                tracing::warn!(error = %e, "Failed to clear last opened channel");
            }
        }
        tracing::info!(channel = %previous, "Active channel cleared");
        Some(previous)
    }

    /// ACTIVE → BACKGROUND transition for one channel.
    ///
    /// The newest message known from the live subscription becomes the
    /// channel's baseline and its unread count is reset, then the live
    /// subscription is released. Release is best effort: a failed unsubscribe
    /// is logged and the channel is still treated as background.
    #[instrument(name = "scheduler.controller.downgrade", skip(self))]
    pub async fn downgrade(&self, channel_id: &str) -> ChannelActivity {
        let latest = self
            .registry
            .get_channel(channel_id)
            .and_then(|c| c.latest_message_time);
        let record = self
            .tracker
            .snapshot_on_downgrade(channel_id, latest, now_millis())
            .await;

        if let Err(e) = self.transport.unsubscribe(channel_id).await {
            tracing::warn!(error = %e, "Unsubscribe failed, treating channel as background");
        }

        tracing::debug!(
            last_message_time = record.last_message_time,
            "Channel moved to background"
        );
        record
    }

    /// Drop the pointer for a channel the transport already tore down.
    /// No unsubscribe is sent. Returns true if the channel was active.
    pub async fn forget(&self, channel_id: &str) -> bool {
        let _transition = self.transition.lock().await;

        let mut active = self.active.write().await;
        if active.as_deref() != Some(channel_id) {
            return false;
        }
        *active = None;
        drop(active);

        if self.store.last_opened_channel().as_deref() == Some(channel_id) {
            if let Err(e) = self.store.set_last_opened_channel(None) {
                tracing::warn!(error = %e, "Failed to clear last opened channel");
            }
        }
        tracing::info!(channel = %channel_id, "Active channel removed");
        true
    }
}
