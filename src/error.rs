//! Error types for Agrichat
//!
//! This module defines the error taxonomy of the session layer using
//! `thiserror`. Each component surfaces its own typed error; the umbrella
//! [`AgrichatError`] wraps all of them for application plumbing (config
//! loading, CLI commands) where an `anyhow::Result` is convenient.

use thiserror::Error;

/// Failures produced while obtaining or renewing a session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// The server rejected the supplied credentials.
    #[error("Invalid credentials")]
    InvalidCredentials,

    /// The request could not reach the server or timed out.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// The server answered with an unexpected failure.
    #[error("Server error: {0}")]
    ServerError(String),

    /// The session can no longer be renewed; the user must sign in again.
    #[error("Session expired")]
    SessionExpired,
}

/// Failures of the shared streaming transport.
///
/// These are absorbed by the transport's reconnect loop; dependents only
/// observe the `ConnectionLost` state transition.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// A frame was sent while the connection was not `Connected`.
    #[error("Transport is not connected")]
    NotConnected,

    /// The connection closed unexpectedly.
    #[error("Connection lost")]
    ConnectionLost,
}

/// Failures of a streamed AI generation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GenerationError {
    /// A generation is already in flight for the conversation.
    #[error("A response is already being generated for this conversation")]
    AlreadyGenerating,

    /// The transport dropped while the response was streaming.
    #[error("Generation interrupted by connection loss")]
    Interrupted,

    /// The server reported an error while generating.
    #[error("AI response error: {0}")]
    AIResponseError(String),
}

/// Failures of REST data operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DataError {
    /// The requested entity does not exist.
    #[error("Not found")]
    NotFound,

    /// The write conflicts with the current server state.
    #[error("Conflict")]
    Conflict,
}

/// Failure of sending a user message and starting its response.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    /// The generation could not start.
    #[error(transparent)]
    Generation(#[from] GenerationError),

    /// The generate frame could not be handed to the transport.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The REST call persisting the message failed.
    #[error(transparent)]
    Api(#[from] crate::api::ApiError),
}

/// Main error type for Agrichat operations
///
/// This enum wraps every component error together with the infrastructure
/// failures (I/O, parsing, HTTP, keyring) that can occur around them.
#[derive(Error, Debug)]
pub enum AgrichatError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Session lifecycle errors
    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    /// Streaming transport errors
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Generation errors
    #[error("Generation error: {0}")]
    Generation(#[from] GenerationError),

    /// REST data errors
    #[error("Data error: {0}")]
    Data(#[from] DataError),

    /// Credential persistence errors
    #[error("Credential storage error: {0}")]
    Storage(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// HTTP request errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Keyring/credential storage errors
    #[error("Keyring error: {0}")]
    Keyring(#[from] keyring::Error),
}

/// Result type alias for Agrichat plumbing
///
/// Uses `anyhow::Error` so that command handlers can attach context while
/// still carrying an [`AgrichatError`] that callers may downcast.
pub type Result<T> = anyhow::Result<T>;
