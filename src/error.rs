//! Error type shared by the connection manager, its transport and the session store.

use thiserror::Error;

/// Errors raised while configuring, connecting or using the shared broker link
///
/// Transport-level drops are not errors from the caller's point of view: the
/// manager recovers from them on its own. Variants here are what a caller (or
/// an owner's error notification) actually gets to see.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Invalid or incomplete configuration
    ///
    /// Reported once at setup; nothing retries a configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration file could not be parsed
    #[error("Configuration parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Signing the broker credential failed
    ///
    /// Fatal to the connect attempt that needed the token.
    #[error("Credential error: {0}")]
    Credential(#[from] jsonwebtoken::errors::Error),

    /// The transport could not open a session or accept a request
    #[error("Transport error: {0}")]
    Transport(String),

    /// A publish could not be handed to the transport
    #[error("Publish error: {0}")]
    Publish(String),

    /// Outbound message without a usable topic
    #[error("Invalid topic: {0:?}")]
    InvalidTopic(String),

    /// Subscription filter that violates the wildcard grammar
    #[error("Invalid topic filter: {0:?}")]
    InvalidFilter(String),

    /// QoS level outside the supported range
    #[error("Unsupported QoS level: {0}")]
    InvalidQos(u8),

    /// The connection manager was closed and accepts no new owners
    #[error("Connection manager for {0} is closed")]
    Closed(String),

    /// Session store failure
    #[error("Store error: {0}")]
    Store(#[from] sled::Error),

    /// Stored record could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BridgeError>;
