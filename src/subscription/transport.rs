//! Collaborator interfaces consumed by the scheduler
//!
//! The scheduler never talks to a network or a disk directly. It drives a
//! [`Transport`] (full subscriptions and history fetches), reads channel
//! metadata from a [`ChannelRegistry`], and reads persisted last-access state
//! from a [`LastAccessStore`]. Reference implementations live in
//! `subscription::memory` and `store`.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{StoreError, TransportError};

/// Milliseconds since the Unix epoch
pub type Timestamp = i64;

/// Current wall-clock time as a [`Timestamp`]
pub fn now_millis() -> Timestamp {
    chrono::Utc::now().timestamp_millis()
}

/// Secret material needed to read a channel
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub secret: Option<String>,
}

impl Credentials {
    pub fn with_secret(secret: impl Into<String>) -> Self {
        Self {
            secret: Some(secret.into()),
        }
    }
}

/// A message as returned by a history fetch or delivered live
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub timestamp: Timestamp,
    pub sender: Option<String>,
    pub content: String,
}

impl HistoryMessage {
    pub fn new(timestamp: Timestamp, content: impl Into<String>) -> Self {
        Self {
            timestamp,
            sender: None,
            content: content.into(),
        }
    }
}

/// Page of recent history
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryPage {
    pub messages: Vec<HistoryMessage>,
}

/// Parameters for a recent-history fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryRequest {
    pub partition: u32,
    /// Only messages at or before this time are returned
    pub before: Timestamp,
    pub limit: usize,
    pub credentials: Option<Credentials>,
}

/// Callback invoked for each live message on a full subscription
pub type MessageHandler = Arc<dyn Fn(&str, &HistoryMessage) + Send + Sync>;

/// Live event handlers attached to a full subscription
#[derive(Clone, Default)]
pub struct LiveHandlers {
    pub on_message: Option<MessageHandler>,
}

impl LiveHandlers {
    pub fn on_message<F>(handler: F) -> Self
    where
        F: Fn(&str, &HistoryMessage) + Send + Sync + 'static,
    {
        Self {
            on_message: Some(Arc::new(handler)),
        }
    }
}

impl fmt::Debug for LiveHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveHandlers")
            .field("on_message", &self.on_message.is_some())
            .finish()
    }
}

/// Channel metadata as known to the host application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    pub id: String,
    pub stream_id: String,
    /// Newest message time held in memory (only known while fully subscribed)
    pub latest_message_time: Option<Timestamp>,
    pub credentials: Option<Credentials>,
}

/// Pub/sub transport used for full subscriptions and history polling
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a live subscription including history delivery
    async fn subscribe_full(
        &self,
        channel_id: &str,
        credentials: Option<&Credentials>,
        handlers: LiveHandlers,
    ) -> Result<(), TransportError>;

    /// Release a live subscription
    async fn unsubscribe(&self, channel_id: &str) -> Result<(), TransportError>;

    /// Fetch the most recent messages of one partition without subscribing
    async fn fetch_recent_history(
        &self,
        channel_id: &str,
        request: HistoryRequest,
    ) -> Result<HistoryPage, TransportError>;
}

/// Host-side list of channels the user follows
pub trait ChannelRegistry: Send + Sync {
    fn get_channel(&self, channel_id: &str) -> Option<ChannelInfo>;

    /// All tracked channels in stable display order
    fn list_channels(&self) -> Vec<ChannelInfo>;
}

/// Persisted per-channel access state
pub trait LastAccessStore: Send + Sync {
    fn all_last_access(&self) -> HashMap<String, Timestamp>;

    fn set_last_access(&self, channel_id: &str, at: Timestamp) -> Result<(), StoreError>;

    fn last_opened_channel(&self) -> Option<String>;

    fn set_last_opened_channel(&self, channel_id: Option<&str>) -> Result<(), StoreError>;
}
