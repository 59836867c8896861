//! Streaming protocol frames
//!
//! Frames are JSON text messages tagged by `type`:
//!
//! ```text
//! client -> server   join | leave | generate | stopGeneration
//! server -> client   delta | complete | error | stopped
//! ```

use serde::{Deserialize, Serialize};

/// Frame sent by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientFrame {
    /// Subscribe to a conversation's events.
    #[serde(rename_all = "camelCase")]
    Join { conversation_id: String },

    /// Unsubscribe from a conversation's events.
    #[serde(rename_all = "camelCase")]
    Leave { conversation_id: String },

    /// Ask the assistant to answer `message`.
    #[serde(rename_all = "camelCase")]
    Generate {
        conversation_id: String,
        message: String,
        language: String,
    },

    /// Ask the server to stop the current generation.
    #[serde(rename_all = "camelCase")]
    StopGeneration { conversation_id: String },
}

/// Frame pushed by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerFrame {
    /// Next chunk of the assistant response.
    #[serde(rename_all = "camelCase")]
    Delta { conversation_id: String, chunk: String },

    /// The response finished.
    #[serde(rename_all = "camelCase")]
    Complete {
        conversation_id: String,
        #[serde(default)]
        follow_up_questions: Vec<String>,
        #[serde(default)]
        title: Option<String>,
        #[serde(default)]
        message_id: Option<String>,
    },

    /// Generation failed server-side.
    #[serde(rename_all = "camelCase")]
    Error { conversation_id: String, message: String },

    /// A stop request took effect.
    #[serde(rename_all = "camelCase")]
    Stopped { conversation_id: String },
}

impl ClientFrame {
    /// Conversation the frame addresses.
    pub fn conversation_id(&self) -> &str {
        match self {
            ClientFrame::Join { conversation_id }
            | ClientFrame::Leave { conversation_id }
            | ClientFrame::Generate {
                conversation_id, ..
            }
            | ClientFrame::StopGeneration { conversation_id } => conversation_id,
        }
    }
}

impl ServerFrame {
    /// Conversation the frame belongs to.
    pub fn conversation_id(&self) -> &str {
        match self {
            ServerFrame::Delta {
                conversation_id, ..
            }
            | ServerFrame::Complete {
                conversation_id, ..
            }
            | ServerFrame::Error {
                conversation_id, ..
            }
            | ServerFrame::Stopped { conversation_id } => conversation_id,
        }
    }
}
