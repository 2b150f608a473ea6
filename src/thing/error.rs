//! Error definitions for the thing bridge

use thiserror::Error;

/// Errors raised while building, running or talking to a [`Thing`](super::Thing)
#[derive(Debug, Error)]
pub enum ThingError {
    /// Private key or certificate could not be parsed, or they do not belong together
    #[error("Invalid credential: {0}")]
    InvalidCredential(String),

    /// Thing name or region cannot be used to derive endpoint and topics
    #[error("Invalid identity: {0}")]
    InvalidIdentity(String),

    /// Handshake or subscribe with the broker failed
    #[error("Connection error: {0}")]
    Connection(String),

    /// The broker ended a running session
    #[error("Disconnected from broker: {0}")]
    Disconnected(String),

    /// Handing a publish to the MQTT client failed
    #[error("Publish error: {0}")]
    Publish(String),

    /// The reported state could not be turned into a shadow document
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Operation requires a running bridge
    #[error("Thing is not running")]
    NotRunning,

    /// `connect` was already called on this thing
    #[error("Thing was already started")]
    AlreadyStarted,

    /// The inbound receiver has already been handed out
    #[error("Inbound channel was already taken")]
    InboundTaken,

    /// The run loop has released its end of a channel
    #[error("Channel closed")]
    ChannelClosed,
}
