//! Per-channel activity records and observer notification
//!
//! Owns the `ChannelActivity` map and the observer registry. Background
//! channels are checked by fetching a small page of recent history and
//! comparing it against the newest message time already seen; newer entries
//! are added to the unread count and reported to observers.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::instrument;

use crate::config::PRIMARY_PARTITION;
use crate::error::TransportError;

use super::transport::{
    now_millis, ChannelInfo, HistoryRequest, LastAccessStore, Timestamp, Transport,
};

/// Activity state tracked for one channel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChannelActivity {
    /// Timestamp of the newest message observed
    pub last_message_time: Timestamp,
    /// Messages seen since the channel was last viewed
    pub unread_count: u64,
    /// Time of the last poll attempt, successful or not
    pub last_checked: Timestamp,
}

/// Result returned by an activity observer
pub type ObserverResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Callback receiving `(channel_id, record)` when new activity is found
pub type ActivityHandler = Arc<dyn Fn(&str, &ChannelActivity) -> ObserverResult + Send + Sync>;

/// Wrap a closure as an [`ActivityHandler`]
pub fn activity_handler<F>(handler: F) -> ActivityHandler
where
    F: Fn(&str, &ChannelActivity) -> ObserverResult + Send + Sync + 'static,
{
    Arc::new(handler)
}

/// Outcome of one successful activity check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivityCheck {
    pub record: ChannelActivity,
    pub new_messages: u64,
}

/// Activity records plus the observers interested in them
#[derive(Clone)]
pub struct ActivityTracker {
    records: Arc<RwLock<HashMap<String, ChannelActivity>>>,
    observers: Arc<RwLock<Vec<ActivityHandler>>>,
    /// Bumped by `clear`; checks started under an older value are discarded
    generation: Arc<AtomicU64>,
    transport: Arc<dyn Transport>,
    store: Arc<dyn LastAccessStore>,
}

impl ActivityTracker {
    pub fn new(transport: Arc<dyn Transport>, store: Arc<dyn LastAccessStore>) -> Self {
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
            observers: Arc::new(RwLock::new(Vec::new())),
            generation: Arc::new(AtomicU64::new(0)),
            transport,
            store,
        }
    }

    /// Register an observer. Observers are called in registration order.
    pub async fn on_activity(&self, handler: ActivityHandler) {
        self.observers.write().await.push(handler);
    }

    /// Remove an observer by identity. Returns false if it was not registered.
    pub async fn off_activity(&self, handler: &ActivityHandler) -> bool {
        let mut observers = self.observers.write().await;
        match observers.iter().position(|h| Arc::ptr_eq(h, handler)) {
            Some(index) => {
                observers.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub async fn observer_count(&self) -> usize {
        self.observers.read().await.len()
    }

    pub async fn get(&self, channel_id: &str) -> Option<ChannelActivity> {
        self.records.read().await.get(channel_id).copied()
    }

    pub async fn unread_count(&self, channel_id: &str) -> u64 {
        self.get(channel_id).await.map_or(0, |r| r.unread_count)
    }

    /// Reset the unread counter. Returns false if the channel has no record.
    pub async fn clear_unread(&self, channel_id: &str) -> bool {
        match self.records.write().await.get_mut(channel_id) {
            Some(record) => {
                record.unread_count = 0;
                true
            }
            None => false,
        }
    }

    pub async fn remove(&self, channel_id: &str) -> Option<ChannelActivity> {
        self.records.write().await.remove(channel_id)
    }

    /// Drop every record and observer. Checks still in flight will not
    /// write their results back.
    pub async fn clear(&self) {
        let mut records = self.records.write().await;
        self.generation.fetch_add(1, Ordering::AcqRel);
        records.clear();
        drop(records);
        self.observers.write().await.clear();
    }

    /// Create missing records from persisted last-access times.
    /// Existing records are left as they are.
    pub async fn seed<'a>(&self, channel_ids: impl IntoIterator<Item = &'a str>) {
        let persisted = self.store.all_last_access();
        let mut records = self.records.write().await;
        for id in channel_ids {
            records
                .entry(id.to_string())
                .or_insert_with(|| fresh_record(&persisted, id));
        }
    }

    /// Record the state of a channel leaving its full subscription: the newest
    /// known message becomes the baseline and the channel counts as read.
    pub async fn snapshot_on_downgrade(
        &self,
        channel_id: &str,
        latest_message_time: Option<Timestamp>,
        now: Timestamp,
    ) -> ChannelActivity {
        let persisted = self.store.all_last_access();
        let mut records = self.records.write().await;
        let record = records
            .entry(channel_id.to_string())
            .or_insert_with(|| fresh_record(&persisted, channel_id));
        if let Some(latest) = latest_message_time {
            record.last_message_time = record.last_message_time.max(latest);
        }
        record.unread_count = 0;
        record.last_checked = now;
        *record
    }

    async fn mark_checked(&self, channel_id: &str, now: Timestamp, generation: u64) {
        let persisted = self.store.all_last_access();
        let mut records = self.records.write().await;
        if self.generation() != generation {
            return;
        }
        records
            .entry(channel_id.to_string())
            .or_insert_with(|| fresh_record(&persisted, channel_id))
            .last_checked = now;
    }

    /// Fetch the newest messages of a channel and fold them into its record.
    ///
    /// The fetch always asks for the most recent page; the stored
    /// `last_message_time` is only used to filter the result locally. On
    /// failure `last_checked` is still advanced so the per-channel cool-down
    /// applies to failing channels too.
    #[instrument(
        name = "scheduler.activity.check",
        skip(self, channel),
        fields(channel = %channel.id, new_messages)
    )]
    pub async fn check_activity(
        &self,
        channel: &ChannelInfo,
        page_size: usize,
    ) -> Result<ActivityCheck, TransportError> {
        let generation = self.generation();
        let request = HistoryRequest {
            partition: PRIMARY_PARTITION,
            before: now_millis(),
            limit: page_size,
            credentials: channel.credentials.clone(),
        };

        let page = match self
            .transport
            .fetch_recent_history(&channel.id, request)
            .await
        {
            Ok(page) => page,
            Err(e) => {
                self.mark_checked(&channel.id, now_millis(), generation).await;
                return Err(e);
            }
        };

        let persisted = self.store.all_last_access();
        let check = {
            let mut records = self.records.write().await;
            if self.generation() != generation {
                tracing::debug!("Records cleared during check, result dropped");
                return Ok(ActivityCheck {
                    record: ChannelActivity::default(),
                    new_messages: 0,
                });
            }
            let record = records
                .entry(channel.id.clone())
                .or_insert_with(|| fresh_record(&persisted, &channel.id));

            // Compare against the record as it is now, not as it was before the
            // fetch, so an overlapping check cannot count a message twice.
            let baseline = record.last_message_time;
            let mut newest = baseline;
            let mut new_messages = 0u64;
            for message in &page.messages {
                if message.timestamp > baseline {
                    new_messages += 1;
                }
                newest = newest.max(message.timestamp);
            }

            record.last_message_time = newest;
            record.unread_count += new_messages;
            record.last_checked = now_millis();

            ActivityCheck {
                record: *record,
                new_messages,
            }
        };

        tracing::Span::current().record("new_messages", check.new_messages);

        if check.new_messages > 0 {
            self.notify(&channel.id, &check.record).await;
        }

        Ok(check)
    }

    /// Call every observer; failures are logged and do not stop the others.
    async fn notify(&self, channel_id: &str, record: &ChannelActivity) {
        // Snapshot so observers may (un)register without deadlocking
        let observers: Vec<ActivityHandler> = self.observers.read().await.clone();

        for (index, observer) in observers.iter().enumerate() {
            match catch_unwind(AssertUnwindSafe(|| observer(channel_id, record))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(
                        channel = %channel_id,
                        observer = index,
                        error = %e,
                        "Activity observer failed"
                    );
                }
                Err(_) => {
                    tracing::error!(
                        channel = %channel_id,
                        observer = index,
                        "Activity observer panicked"
                    );
                }
            }
        }
    }
}

fn fresh_record(persisted: &HashMap<String, Timestamp>, channel_id: &str) -> ChannelActivity {
    ChannelActivity {
        last_message_time: persisted.get(channel_id).copied().unwrap_or(0),
        unread_count: 0,
        last_checked: 0,
    }
}
