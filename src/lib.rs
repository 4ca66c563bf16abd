//! Lookout - bounded channel subscription scheduler
//!
//! Follows many pub/sub channels while holding at most one full live
//! subscription. The active channel is fully subscribed; all other channels
//! are polled in small, staggered, round-robin batches for new activity.

pub mod config;
pub mod error;
pub mod store;
pub mod subscription;

pub use error::*;
pub use subscription::ChannelScheduler;
