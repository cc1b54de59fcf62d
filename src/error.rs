//! Error types for the bridge.

use thiserror::Error;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Errors that can occur while running the bridge.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// A UDP datagram failed to decode as a wire frame.
    #[error("bad frame: {0}")]
    BadFrame(String),

    /// A CONTROL payload failed to parse as JSON, or parsed but violated a
    /// semantic invariant (e.g. an out-of-range mic format field).
    #[error("bad control payload: {0}")]
    BadControl(String),

    /// The call provisioner rejected or could not complete a `start` request.
    #[error("provisioning failed: {0}")]
    ProvisionError(String),

    /// The framed WebSocket failed to send or receive.
    #[error("socket error: {0}")]
    SocketError(String),

    /// A teardown join exceeded its budget and was forcibly cancelled.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Configuration was missing or invalid at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// Generic IO error (socket bind, env file read).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    pub fn bad_frame<S: Into<String>>(msg: S) -> Self {
        Self::BadFrame(msg.into())
    }

    pub fn bad_control<S: Into<String>>(msg: S) -> Self {
        Self::BadControl(msg.into())
    }

    pub fn provision<S: Into<String>>(msg: S) -> Self {
        Self::ProvisionError(msg.into())
    }

    pub fn socket<S: Into<String>>(msg: S) -> Self {
        Self::SocketError(msg.into())
    }

    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }
}
