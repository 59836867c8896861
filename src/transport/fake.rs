//! In-process fake connector for unit tests
//!
//! Every successful `connect` hands the test a [`FakeServer`] through the
//! receiver returned by [`FakeConnector::new`]:
//!
//! ```text
//! client send()  -----> outbound -----> server.outbound_rx (test reads)
//! server.push()  -----> inbound  -----> client read loop
//! drop(server)   -----> inbound closes -> ConnectionLost
//! ```

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

use crate::error::{AgrichatError, AuthError, Result};
use crate::transport::frames::{ClientFrame, ServerFrame};
use crate::transport::{Connector, Link};

#[derive(Debug, Default)]
struct FakeState {
    fail_next: u32,
    reject: Vec<String>,
    tokens: Vec<String>,
}

/// Connector that produces in-memory links.
#[derive(Debug)]
pub struct FakeConnector {
    state: Mutex<FakeState>,
    servers: mpsc::UnboundedSender<FakeServer>,
}

/// Server end of one fake connection.
#[derive(Debug)]
pub struct FakeServer {
    /// Token the client connected with.
    pub token: String,
    /// Frames written by the client.
    pub outbound_rx: mpsc::UnboundedReceiver<String>,
    /// Raw text pushed to the client.
    pub inbound_tx: mpsc::UnboundedSender<String>,
}

impl FakeConnector {
    /// Create a connector and the receiver of its server ends.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<FakeServer>) {
        let (servers, rx) = mpsc::unbounded_channel();
        let connector = Self {
            state: Mutex::new(FakeState::default()),
            servers,
        };
        (Arc::new(connector), rx)
    }

    /// Fail the next `n` connection attempts.
    pub fn fail_next(&self, n: u32) {
        self.state.lock().unwrap().fail_next = n;
    }

    /// Refuse handshakes that present `token`, as a server does for an
    /// expired or revoked one.
    pub fn reject_token(&self, token: &str) {
        self.state.lock().unwrap().reject.push(token.to_string());
    }

    /// Tokens of every attempt, failed ones included.
    pub fn tokens(&self) -> Vec<String> {
        self.state.lock().unwrap().tokens.clone()
    }
}

#[async_trait::async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, token: &str) -> Result<Link> {
        {
            let mut state = self.state.lock().unwrap();
            state.tokens.push(token.to_string());
            if state.reject.iter().any(|t| t == token) {
                return Err(AgrichatError::Auth(AuthError::SessionExpired).into());
            }
            if state.fail_next > 0 {
                state.fail_next -= 1;
                return Err(AgrichatError::Transport(crate::error::TransportError::ConnectionLost).into());
            }
        }
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let _ = self.servers.send(FakeServer {
            token: token.to_string(),
            outbound_rx,
            inbound_tx,
        });
        Ok(Link { outbound, inbound })
    }
}

impl FakeServer {
    /// Next client frame, or `None` after `timeout`.
    pub async fn next_frame(&mut self) -> Option<ClientFrame> {
        let text = tokio::time::timeout(Duration::from_secs(2), self.outbound_rx.recv())
            .await
            .ok()??;
        Some(serde_json::from_str(&text).expect("client sent invalid frame"))
    }

    /// Collect every frame sent within `window`.
    pub async fn drain_frames(&mut self, window: Duration) -> Vec<ClientFrame> {
        let mut frames = Vec::new();
        while let Ok(Some(text)) = tokio::time::timeout(window, self.outbound_rx.recv()).await {
            frames.push(serde_json::from_str(&text).expect("client sent invalid frame"));
        }
        frames
    }

    /// Push a server frame to the client.
    pub fn push(&self, frame: &ServerFrame) {
        let text = serde_json::to_string(frame).expect("frame serializes");
        let _ = self.inbound_tx.send(text);
    }

    /// Push raw text to the client.
    pub fn push_raw(&self, text: &str) {
        let _ = self.inbound_tx.send(text.to_string());
    }
}

/// Wait for the next server end, failing the test after two seconds.
pub async fn accept(servers: &mut mpsc::UnboundedReceiver<FakeServer>) -> FakeServer {
    tokio::time::timeout(Duration::from_secs(2), servers.recv())
        .await
        .expect("no connection attempt within timeout")
        .expect("connector dropped")
}
