//! Channel subscription scheduling.
//!
//! Keeps exactly one channel on a full live subscription and tracks every
//! other channel through periodic, rate-limited history polling.
//!
//! Components, leaves first:
//! - [`ActivityTracker`] - per-channel activity records and observers
//! - [`BackgroundPoller`] - batched round-robin polling of background channels
//! - [`SubscriptionController`] - the active-channel pointer and its transitions
//! - [`ChannelScheduler`] - lifecycle wiring exposed to the host application

mod activity;
mod controller;
pub mod memory;
mod poller;
mod scheduler;
mod transport;

pub use activity::{
    activity_handler, ActivityCheck, ActivityHandler, ActivityTracker, ChannelActivity,
    ObserverResult,
};
pub use controller::SubscriptionController;
pub use memory::{MemoryTransport, TransportCall};
pub use poller::{select_batch, BackgroundPoller, CycleOutcome, CycleReport};
pub use scheduler::ChannelScheduler;
pub use transport::{
    now_millis, ChannelInfo, ChannelRegistry, Credentials, HistoryMessage, HistoryPage,
    HistoryRequest, LastAccessStore, LiveHandlers, MessageHandler, Timestamp, Transport,
};
