//! Agrichat - real-time session layer of an AI agricultural assistant
//!
//! This library provides the client side of a chat with an agricultural
//! assistant: session management, a multiplexed streaming connection,
//! per-conversation answer generation and an observable state store.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//!
//! - `session`: Credential store and session authenticator
//! - `api`: REST client, response envelope and payload types
//! - `transport`: Streaming connection with reconnect and backoff
//! - `registry`: Conversation join/leave bookkeeping
//! - `generation`: Per-conversation streaming generation state machine
//! - `store`: Reactive state store merging REST and streamed data
//! - `client`: `ChatClient` facade wiring the components together
//! - `config`: Configuration management and validation
//! - `error`: Error types and result aliases
//! - `cli` / `commands`: Command-line interface
//!
//! # Example
//!
//! ```no_run
//! use agrichat::{ChatClient, Config};
//! use agrichat::session::Credentials;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::default();
//!     config.validate()?;
//!
//!     let client = ChatClient::from_config(config)?;
//!     client.authenticate(Credentials::Device).await?;
//!     client.open_conversation("c1").await?;
//!     client.send_message("c1", "How do I treat wheat rust?").await?;
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod cli;
pub mod client;
pub mod collaborators;
pub mod commands;
pub mod config;
pub mod error;
pub mod generation;
pub mod registry;
pub mod session;
pub mod store;
pub mod transport;

// Re-export commonly used types
pub use client::ChatClient;
pub use config::Config;
pub use error::{AgrichatError, Result};
pub use generation::{GenerationEvent, GenerationState};
pub use session::{Credentials, Session, SessionEvent};
pub use store::StateStore;
pub use transport::ConnectionState;
