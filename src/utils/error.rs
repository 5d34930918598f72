// src/utils/error.rs
use crate::types::AlgorithmType;
use serde_json;
use std::io;
use thiserror::Error;
use url;

/// Main error type for the mining client
///
/// This enum represents all possible error conditions that can occur
/// during mining operations, including network, I/O, protocol, and
/// configuration errors.
#[derive(Error, Debug)]
pub enum MinerError {
    /// Errors related to mining algorithms
    #[error("Algorithm error: {0}")]
    AlgorithmError(String),

    /// The selected algorithm has no hashing backend in this build
    #[error("Unsupported algorithm: {0} (no hashing backend available)")]
    UnsupportedAlgorithm(AlgorithmType),

    /// Errors related to network connectivity
    #[error("Network connection error: {0}")]
    ConnectionError(String),

    /// Errors in protocol handling or invalid protocol messages
    #[error("Protocol violation: {0}")]
    ProtocolError(String),

    /// Standard I/O operation errors
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// URL parsing errors
    #[error("URL parse error: {0}")]
    UrlError(#[from] url::ParseError),

    /// Configuration file or parameter errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Task communication channel errors
    #[error("Channel error: {0}")]
    ChannelError(String),

    /// Invalid user input or parameter errors
    #[error("Invalid input: {0}")]
    InputError(String),

    /// Cryptographic operation errors
    #[error("Cryptographic error: {0}")]
    CryptoError(String),

    /// Async task execution errors
    #[error("Task execution error: {0}")]
    TaskError(String),

    /// An operation did not complete within its deadline
    #[error("Timed out: {0}")]
    Timeout(String),

    /// A command was issued in a state that does not accept it
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

/// Converts outbound line channel errors into MinerError
///
/// Raised when the connection's writer task is gone while a request
/// (typically a share submission) is still being queued.
impl From<tokio::sync::mpsc::error::SendError<String>> for MinerError {
    fn from(e: tokio::sync::mpsc::error::SendError<String>) -> Self {
        MinerError::ChannelError(format!("Outbound send failed: {}", e))
    }
}

/// Converts hex decoding errors into MinerError
///
/// Used when invalid hex data is encountered while decoding job
/// fields, extranonces or configuration values.
impl From<hex::FromHexError> for MinerError {
    fn from(e: hex::FromHexError) -> Self {
        MinerError::InputError(format!("Hex conversion failed: {}", e))
    }
}

/// Converts async task join errors into MinerError
///
/// Used when background tasks (receive loop, workers, monitor)
/// fail unexpectedly.
impl From<tokio::task::JoinError> for MinerError {
    fn from(e: tokio::task::JoinError) -> Self {
        MinerError::TaskError(format!("Async task failed: {}", e))
    }
}

impl From<tokio::time::error::Elapsed> for MinerError {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        MinerError::Timeout(e.to_string())
    }
}
