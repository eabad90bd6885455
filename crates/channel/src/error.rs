use thiserror::Error;

/// Transport-level failures.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("unable to connect to broker: {0}")]
    Connect(String),
    #[error("connection closed: {0}")]
    ConnectionClosed(String),
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("subscribe failed: {0}")]
    Subscribe(String),
    #[error("acknowledge failed: {0}")]
    Ack(String),
    #[error("invalid queue name '{0}'")]
    InvalidQueue(String),
    #[error("invalid broker url: {0}")]
    InvalidUrl(String),
    #[error("gave up reconnecting after {attempts} attempt(s)")]
    RetriesExhausted { attempts: u32 },
}

impl ChannelError {
    /// `true` when the failure means the connection is gone and a reconnect
    /// may recover it.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, Self::ConnectionClosed(_))
    }
}
