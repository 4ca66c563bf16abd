//! In-memory transport and channel registry
//!
//! Serves channels from process memory. Used by the CLI host to simulate a
//! pub/sub backend and by tests, which rely on the recorded call log, the
//! live-subscription high-water mark and per-channel failure injection.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::TransportError;

use super::transport::{
    ChannelInfo, ChannelRegistry, Credentials, HistoryMessage, HistoryPage, HistoryRequest,
    LiveHandlers, Transport,
};

/// Transport operation as recorded in the call log
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    SubscribeFull(String),
    Unsubscribe(String),
    FetchRecentHistory(String),
}

#[derive(Debug)]
struct MemoryChannel {
    id: String,
    stream_id: String,
    credentials: Option<Credentials>,
    messages: Vec<HistoryMessage>,
}

#[derive(Default)]
struct MemoryState {
    /// Channels in insertion order
    channels: Vec<MemoryChannel>,
    live: HashMap<String, LiveHandlers>,
    calls: Vec<TransportCall>,
    failing_fetch: HashSet<String>,
    failing_subscribe: HashSet<String>,
    failing_unsubscribe: HashSet<String>,
    /// Highest number of simultaneous live subscriptions observed
    peak_live: usize,
    latency: Duration,
}

impl MemoryState {
    fn channel(&self, channel_id: &str) -> Option<&MemoryChannel> {
        self.channels.iter().find(|c| c.id == channel_id)
    }

    fn info(&self, channel: &MemoryChannel) -> ChannelInfo {
        let latest_message_time = if self.live.contains_key(&channel.id) {
            channel.messages.iter().map(|m| m.timestamp).max()
        } else {
            None
        };
        ChannelInfo {
            id: channel.id.clone(),
            stream_id: channel.stream_id.clone(),
            latest_message_time,
            credentials: channel.credentials.clone(),
        }
    }
}

/// Transport and registry backed by process memory
#[derive(Default)]
pub struct MemoryTransport {
    state: Mutex<MemoryState>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a channel whose stream id equals its channel id
    pub fn add_channel(&self, channel_id: &str, credentials: Option<Credentials>) {
        self.add_channel_with_stream(channel_id, channel_id, credentials);
    }

    pub fn add_channel_with_stream(
        &self,
        channel_id: &str,
        stream_id: &str,
        credentials: Option<Credentials>,
    ) {
        let mut state = self.lock();
        if state.channel(channel_id).is_some() {
            return;
        }
        state.channels.push(MemoryChannel {
            id: channel_id.to_string(),
            stream_id: stream_id.to_string(),
            credentials,
            messages: Vec::new(),
        });
    }

    /// Forget a channel entirely, including any live subscription
    pub fn remove_channel(&self, channel_id: &str) {
        let mut state = self.lock();
        state.channels.retain(|c| c.id != channel_id);
        state.live.remove(channel_id);
    }

    /// Append a message and deliver it to a live subscriber, if any
    pub fn push_message(&self, channel_id: &str, message: HistoryMessage) -> bool {
        let handler = {
            let mut state = self.lock();
            let Some(channel) = state.channels.iter_mut().find(|c| c.id == channel_id) else {
                return false;
            };
            channel.messages.push(message.clone());
            state
                .live
                .get(channel_id)
                .and_then(|handlers| handlers.on_message.clone())
        };

        if let Some(handler) = handler {
            handler(channel_id, &message);
        }
        true
    }

    pub fn set_fetch_failure(&self, channel_id: &str, fail: bool) {
        toggle(&mut self.lock().failing_fetch, channel_id, fail);
    }

    pub fn set_subscribe_failure(&self, channel_id: &str, fail: bool) {
        toggle(&mut self.lock().failing_subscribe, channel_id, fail);
    }

    pub fn set_unsubscribe_failure(&self, channel_id: &str, fail: bool) {
        toggle(&mut self.lock().failing_unsubscribe, channel_id, fail);
    }

    /// Delay applied to every transport call
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn fetch_count(&self, channel_id: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| matches!(c, TransportCall::FetchRecentHistory(id) if id == channel_id))
            .count()
    }

    /// Channels currently holding a live subscription, sorted
    pub fn live_subscriptions(&self) -> Vec<String> {
        let mut live: Vec<String> = self.lock().live.keys().cloned().collect();
        live.sort();
        live
    }

    pub fn peak_live_subscriptions(&self) -> usize {
        self.lock().peak_live
    }

    async fn simulate_latency(&self) {
        let latency = self.lock().latency;
        if latency.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(latency).await;
        }
    }
}

fn toggle(set: &mut HashSet<String>, channel_id: &str, on: bool) {
    if on {
        set.insert(channel_id.to_string());
    } else {
        set.remove(channel_id);
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn subscribe_full(
        &self,
        channel_id: &str,
        credentials: Option<&Credentials>,
        handlers: LiveHandlers,
    ) -> Result<(), TransportError> {
        self.lock()
            .calls
            .push(TransportCall::SubscribeFull(channel_id.to_string()));
        self.simulate_latency().await;

        let mut state = self.lock();
        if state.failing_subscribe.contains(channel_id) {
            return Err(TransportError::new(format!(
                "subscribe to {} refused",
                channel_id
            )));
        }
        let Some(channel) = state.channel(channel_id) else {
            return Err(TransportError::new(format!("no such channel: {}", channel_id)));
        };
        if channel.credentials.is_some() && channel.credentials.as_ref() != credentials {
            return Err(TransportError::new(format!(
                "invalid credentials for {}",
                channel_id
            )));
        }

        state.live.insert(channel_id.to_string(), handlers);
        state.peak_live = state.peak_live.max(state.live.len());
        Ok(())
    }

    async fn unsubscribe(&self, channel_id: &str) -> Result<(), TransportError> {
        self.lock()
            .calls
            .push(TransportCall::Unsubscribe(channel_id.to_string()));
        self.simulate_latency().await;

        let mut state = self.lock();
        if state.failing_unsubscribe.contains(channel_id) {
            return Err(TransportError::new(format!(
                "unsubscribe from {} failed",
                channel_id
            )));
        }
        state.live.remove(channel_id);
        Ok(())
    }

    async fn fetch_recent_history(
        &self,
        channel_id: &str,
        request: HistoryRequest,
    ) -> Result<HistoryPage, TransportError> {
        self.lock()
            .calls
            .push(TransportCall::FetchRecentHistory(channel_id.to_string()));
        self.simulate_latency().await;

        let state = self.lock();
        if state.failing_fetch.contains(channel_id) {
            return Err(TransportError::new(format!(
                "history fetch for {} failed",
                channel_id
            )));
        }
        let Some(channel) = state.channel(channel_id) else {
            return Err(TransportError::new(format!("no such channel: {}", channel_id)));
        };

        let mut messages: Vec<HistoryMessage> = channel
            .messages
            .iter()
            .filter(|m| m.timestamp <= request.before)
            .cloned()
            .collect();
        messages.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        messages.truncate(request.limit);

        Ok(HistoryPage { messages })
    }
}

impl ChannelRegistry for MemoryTransport {
    fn get_channel(&self, channel_id: &str) -> Option<ChannelInfo> {
        let state = self.lock();
        state.channel(channel_id).map(|c| state.info(c))
    }

    fn list_channels(&self) -> Vec<ChannelInfo> {
        let state = self.lock();
        state.channels.iter().map(|c| state.info(c)).collect()
    }
}
