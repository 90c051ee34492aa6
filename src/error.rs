use thiserror::Error;

/// Error type for broker, publish and subscribe operations.
#[derive(Debug, Error)]
pub enum BusError {
    /// No active channel; the client is connecting or disconnected.
    #[error("not connected to the broker")]
    NotConnected,
    /// Opening the connection failed.
    #[error("broker connection failed: {0}")]
    Connection(String),
    /// A channel-level operation failed (declare, bind, publish, ack).
    #[error("channel error: {0}")]
    Channel(String),
    /// An event type or binding pattern is malformed.
    #[error("invalid event type {0:?}")]
    InvalidEventType(String),
    /// The envelope or payload could not be serialized.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Publish or bind against an exchange that was never declared.
    #[error("unknown exchange: {0}")]
    UnknownExchange(String),
    /// Bind or consume against a queue that was never declared.
    #[error("unknown queue: {0}")]
    UnknownQueue(String),
    /// The client or consumer has been shut down.
    #[error("bus client is closed")]
    Closed,
}

#[cfg(feature = "amqp")]
impl From<lapin::Error> for BusError {
    fn from(err: lapin::Error) -> Self {
        match err {
            lapin::Error::IOError(e) => BusError::Connection(e.to_string()),
            other => BusError::Channel(other.to_string()),
        }
    }
}

pub type Result<T, E = BusError> = std::result::Result<T, E>;
