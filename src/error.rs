use crate::config::ConfigError;

/// Error reported by a transport collaborator.
///
/// Cloneable so a single failure can be logged, stored and returned.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct TransportError(pub String);

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Channel id must not be empty")]
    EmptyChannelId,

    #[error("Channel not found: {0}")]
    UnknownChannel(String),

    #[error("Failed to subscribe to channel {channel}: {source}")]
    Subscribe {
        channel: String,
        #[source]
        source: TransportError,
    },

    #[error("Failed to poll channel {channel}: {source}")]
    Poll {
        channel: String,
        #[source]
        source: TransportError,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Errors from the persistence collaborators
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid state file: {0}")]
    Json(#[from] serde_json::Error),
}

pub(crate) fn require_channel_id(channel_id: &str) -> Result<(), SchedulerError> {
    if channel_id.trim().is_empty() {
        return Err(SchedulerError::EmptyChannelId);
    }
    Ok(())
}
