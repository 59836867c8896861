//! REST surface of the assistant backend
//!
//! - [`envelope`] -- the uniform `{success, data, error, message}` wrapper,
//!   converted into a tagged result on receipt
//! - [`types`]    -- request and response payloads
//! - [`client`]   -- bearer-authenticated [`RestClient`]

use thiserror::Error;

use crate::error::{AuthError, DataError};

pub mod client;
pub mod envelope;
pub mod types;

pub use client::RestClient;
pub use envelope::Envelope;

/// Failure of a REST call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// The server rejected the bearer token (HTTP 401).
    #[error("Unauthorized")]
    Unauthorized,

    /// Session could not be established or renewed.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// The entity is missing or the write conflicts.
    #[error(transparent)]
    Data(#[from] DataError),

    /// The server reported a failure.
    #[error("Server error ({status}): {message}")]
    Server {
        /// HTTP status code.
        status: u16,
        /// Server-supplied message, or the status reason.
        message: String,
    },

    /// The request did not complete (connect failure, timeout).
    #[error("Network error: {0}")]
    Network(String),

    /// The response body did not match the expected shape.
    #[error("Decode error: {0}")]
    Decode(String),

    /// The request was rejected before being sent.
    #[error("Invalid request: {0}")]
    Invalid(String),
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            ApiError::Decode(e.to_string())
        } else {
            ApiError::Network(e.to_string())
        }
    }
}
