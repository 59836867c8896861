//! Conversation registry
//!
//! Tracks which conversations the client should be subscribed to over the
//! shared transport. Two sets are kept:
//!
//! - `desired` -- conversations the user has open
//! - `joined`  -- conversations a join frame was sent for on the current
//!   connection
//!
//! `desired \ joined` is the set of pending joins. A connection loss clears
//! `joined`; the next `Connected` replays every pending join before the
//! reconnect is reported upward.

use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use crate::transport::{ClientFrame, TransportConnection};

#[derive(Debug, Default)]
struct Subscriptions {
    desired: BTreeSet<String>,
    joined: HashSet<String>,
}

/// Join/leave bookkeeping over one [`TransportConnection`].
#[derive(Debug)]
pub struct ConversationRegistry {
    transport: Arc<TransportConnection>,
    subscriptions: Mutex<Subscriptions>,
}

impl ConversationRegistry {
    /// Create an empty registry.
    pub fn new(transport: Arc<TransportConnection>) -> Self {
        Self {
            transport,
            subscriptions: Mutex::new(Subscriptions::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Subscriptions> {
        self.subscriptions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Subscribe to `conversation_id`.
    ///
    /// Sends a join frame when connected; otherwise the join is queued and
    /// replayed on the next connection. Joining twice is a no-op.
    pub fn join(&self, conversation_id: &str) {
        let mut subs = self.lock();
        if subs.joined.contains(conversation_id) {
            return;
        }
        subs.desired.insert(conversation_id.to_string());
        let frame = ClientFrame::Join {
            conversation_id: conversation_id.to_string(),
        };
        match self.transport.send(&frame) {
            Ok(()) => {
                subs.joined.insert(conversation_id.to_string());
            }
            Err(_) => debug!(conversation_id, "Join queued until connected"),
        }
    }

    /// Unsubscribe from `conversation_id`, dropping any queued join.
    ///
    /// A leave frame is sent only if a join went out on this connection.
    /// Leaving twice is a no-op.
    pub fn leave(&self, conversation_id: &str) {
        let mut subs = self.lock();
        subs.desired.remove(conversation_id);
        if !subs.joined.remove(conversation_id) {
            return;
        }
        let frame = ClientFrame::Leave {
            conversation_id: conversation_id.to_string(),
        };
        if self.transport.send(&frame).is_err() {
            debug!(conversation_id, "Leave not sent; connection already gone");
        }
    }

    /// Whether events for `conversation_id` should be delivered.
    pub fn is_subscribed(&self, conversation_id: &str) -> bool {
        self.lock().desired.contains(conversation_id)
    }

    /// Conversations with a join queued but not yet sent.
    pub fn pending(&self) -> Vec<String> {
        let subs = self.lock();
        subs.desired
            .iter()
            .filter(|id| !subs.joined.contains(*id))
            .cloned()
            .collect()
    }

    /// Mark every subscription stale after the connection dropped.
    pub fn on_connection_lost(&self) {
        self.lock().joined.clear();
    }

    /// Replay pending joins on a fresh connection.
    ///
    /// Returns the conversations a join was sent for, in id order.
    pub fn on_connected(&self) -> Vec<String> {
        let mut subs = self.lock();
        let pending: Vec<String> = subs
            .desired
            .iter()
            .filter(|id| !subs.joined.contains(*id))
            .cloned()
            .collect();

        let mut replayed = Vec::with_capacity(pending.len());
        for id in pending {
            let frame = ClientFrame::Join {
                conversation_id: id.clone(),
            };
            if self.transport.send(&frame).is_err() {
                // Lost again; the next Connected retries the rest.
                break;
            }
            subs.joined.insert(id.clone());
            replayed.push(id);
        }
        if !replayed.is_empty() {
            debug!(count = replayed.len(), "Replayed joins");
        }
        replayed
    }

    /// Forget every subscription (sign-out).
    pub fn clear(&self) {
        let mut subs = self.lock();
        subs.desired.clear();
        subs.joined.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportConfig;
    use crate::session::credentials::MemoryPersistence;
    use crate::session::CredentialStore;
    use crate::transport::fake::{accept, FakeConnector, FakeServer};
    use crate::transport::{Connector, TransportEvent};
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Harness {
        registry: ConversationRegistry,
        transport: Arc<TransportConnection>,
        events: mpsc::UnboundedReceiver<TransportEvent>,
        servers: mpsc::UnboundedReceiver<FakeServer>,
    }

    fn harness() -> Harness {
        let (connector, servers) = FakeConnector::new();
        let credentials = Arc::new(CredentialStore::new(Arc::new(MemoryPersistence::default())));
        let config = TransportConfig {
            backoff_base_ms: 5,
            backoff_cap_ms: 10,
            backoff_jitter: 0.0,
            ..Default::default()
        };
        let (transport, events) =
            TransportConnection::new(connector as Arc<dyn Connector>, credentials, &config);
        let transport = Arc::new(transport);
        Harness {
            registry: ConversationRegistry::new(Arc::clone(&transport)),
            transport,
            events,
            servers,
        }
    }

    async fn connected(h: &mut Harness) -> FakeServer {
        let server = accept(&mut h.servers).await;
        assert!(matches!(
            h.events.recv().await,
            Some(TransportEvent::Connected { .. })
        ));
        server
    }

    fn join(id: &str) -> ClientFrame {
        ClientFrame::Join {
            conversation_id: id.to_string(),
        }
    }

    #[tokio::test]
    async fn test_join_twice_sends_one_frame() {
        let mut h = harness();
        h.transport.open("tok");
        let mut server = connected(&mut h).await;

        h.registry.join("c1");
        h.registry.join("c1");
        let frames = server.drain_frames(Duration::from_millis(50)).await;
        assert_eq!(frames, vec![join("c1")]);
    }

    #[tokio::test]
    async fn test_join_while_disconnected_is_queued_and_replayed() {
        let mut h = harness();
        h.registry.join("c1");
        assert_eq!(h.registry.pending(), vec!["c1".to_string()]);
        assert!(h.registry.is_subscribed("c1"));

        h.transport.open("tok");
        let mut server = connected(&mut h).await;
        assert_eq!(h.registry.on_connected(), vec!["c1".to_string()]);
        assert_eq!(server.next_frame().await, Some(join("c1")));
        assert!(h.registry.pending().is_empty());
    }

    #[tokio::test]
    async fn test_leave_clears_queued_join_without_frame() {
        let mut h = harness();
        h.registry.join("c1");
        h.registry.leave("c1");
        assert!(h.registry.pending().is_empty());
        assert!(!h.registry.is_subscribed("c1"));

        h.transport.open("tok");
        let mut server = connected(&mut h).await;
        assert!(h.registry.on_connected().is_empty());
        assert!(server.drain_frames(Duration::from_millis(50)).await.is_empty());
    }

    #[tokio::test]
    async fn test_leave_twice_sends_one_frame() {
        let mut h = harness();
        h.transport.open("tok");
        let mut server = connected(&mut h).await;
        h.registry.join("c1");
        h.registry.leave("c1");
        h.registry.leave("c1");
        let frames = server.drain_frames(Duration::from_millis(50)).await;
        assert_eq!(
            frames,
            vec![
                join("c1"),
                ClientFrame::Leave {
                    conversation_id: "c1".to_string()
                }
            ]
        );
    }

    #[tokio::test]
    async fn test_reconnect_replays_exactly_current_subscriptions() {
        let mut h = harness();
        h.transport.open("tok");
        let mut server = connected(&mut h).await;
        h.registry.join("b");
        h.registry.join("a");
        h.registry.join("gone");
        h.registry.leave("gone");
        server.drain_frames(Duration::from_millis(30)).await;

        drop(server);
        assert_eq!(h.events.recv().await, Some(TransportEvent::ConnectionLost));
        h.registry.on_connection_lost();
        assert_eq!(h.registry.pending(), vec!["a".to_string(), "b".to_string()]);

        let mut server = connected(&mut h).await;
        h.registry.on_connected();
        let frames = server.drain_frames(Duration::from_millis(50)).await;
        assert_eq!(frames, vec![join("a"), join("b")]);
    }
}
