use thiserror::Error;

/// Failures surfaced by the realtime channel.
#[derive(Debug, Error)]
pub enum RealtimeError {
    /// `send` while the channel is not open. Nothing is queued.
    #[error("realtime channel is not open")]
    NotConnected,

    #[error("failed to open channel to {address}: {reason}")]
    Connect { address: String, reason: String },

    #[error("realtime channel lost: {0}")]
    ChannelLost(String),

    #[error("invalid envelope: {0}")]
    Envelope(#[from] serde_json::Error),

    #[cfg(feature = "websocket")]
    #[error(transparent)]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

impl RealtimeError {
    pub fn connect(address: impl Into<String>, reason: impl ToString) -> Self {
        Self::Connect {
            address: address.into(),
            reason: reason.to_string(),
        }
    }
}
