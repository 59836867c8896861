//! Transport connection state machine
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Reconnecting(n) -> Connecting
//!                                   \------------------------> Disconnected
//! ```
//!
//! A supervisor task owns each open connection. It connects through the
//! [`Connector`], forwards decoded frames as [`TransportEvent`]s, and on an
//! unexpected close emits [`TransportEvent::ConnectionLost`] immediately,
//! then waits out the backoff before the next attempt. Every attempt uses
//! the credential store's current token.
//!
//! Frames are never queued across reconnects: [`TransportConnection::send`]
//! fails with [`TransportError::NotConnected`] unless the state is
//! `Connected`.
//!
//! Before an attempt with an expired token, and after the server refuses a
//! token, the supervisor asks the registered [`TokenSource`] to renew it.
//! When renewal fails the connection ends instead of retrying a dead token.
//!
//! Each `open` bumps an epoch. A supervisor publishes state and events only
//! while its epoch is current, so a superseded connection can never emit
//! after the `Closed` that replaced it.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::TransportConfig;
use crate::error::{AgrichatError, AuthError, TransportError};
use crate::session::CredentialStore;
use crate::transport::backoff::Backoff;
use crate::transport::frames::{ClientFrame, ServerFrame};
use crate::transport::{ConnectionState, Connector, Link, TokenSource, TransportEvent};

#[derive(Default)]
struct Inner {
    token: Option<String>,
    outbound: Option<mpsc::UnboundedSender<String>>,
    cancel: Option<CancellationToken>,
    epoch: u64,
    token_source: Option<Weak<dyn TokenSource>>,
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inner")
            .field("connected", &self.outbound.is_some())
            .field("epoch", &self.epoch)
            .field("token_source", &self.token_source.is_some())
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
struct Shared {
    connector: Arc<dyn Connector>,
    credentials: Arc<CredentialStore>,
    backoff: Backoff,
    connect_timeout: Duration,
    state: watch::Sender<ConnectionState>,
    foreground: watch::Sender<bool>,
    events: mpsc::UnboundedSender<TransportEvent>,
    inner: Mutex<Inner>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `f` only if `epoch` is still current. Returns `false` otherwise.
    fn with_current(&self, epoch: u64, f: impl FnOnce(&mut Inner)) -> bool {
        let mut inner = self.lock();
        if inner.epoch != epoch {
            return false;
        }
        f(&mut inner);
        true
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    fn token_source(&self) -> Option<Arc<dyn TokenSource>> {
        self.lock().token_source.as_ref().and_then(Weak::upgrade)
    }

    /// Token for the next attempt, renewed first when the stored one has
    /// expired. `None` means the session is gone.
    async fn next_token(&self, initial: &str) -> Option<String> {
        let session = self.credentials.get();
        match (self.token_source(), session) {
            (Some(source), Some(_)) if self.credentials.is_expired() => {
                info!("Access token expired; renewing before reconnect");
                source.fresh_token().await
            }
            (_, session) => Some(session.map_or_else(|| initial.to_string(), |s| s.access_token)),
        }
    }

    /// Stop for good because no usable token is left.
    fn end_without_session(&self, epoch: u64) {
        let ended = self.with_current(epoch, |inner| {
            inner.token = None;
            inner.outbound = None;
            inner.cancel = None;
            self.set_state(ConnectionState::Disconnected);
            self.emit(TransportEvent::Closed);
        });
        if ended {
            warn!("Transport stopped: session could not be renewed");
        }
    }

    /// Block until the application is foregrounded. `false` if cancelled.
    async fn wait_foreground(&self, cancel: &CancellationToken) -> bool {
        let mut rx = self.foreground.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return true;
            }
            tokio::select! {
                _ = cancel.cancelled() => return false,
                changed = rx.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
            }
        }
    }
}

/// The process-wide streaming connection.
///
/// Construct with [`TransportConnection::new`], which also returns the
/// receiver of [`TransportEvent`]s. Exactly one consumer should drain it.
pub struct TransportConnection {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for TransportConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportConnection")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl TransportConnection {
    /// Create a closed connection.
    ///
    /// # Arguments
    ///
    /// * `connector` - Opens the underlying network connection
    /// * `credentials` - Source of the token for every reconnect
    /// * `config` - Backoff and handshake timeout settings
    pub fn new(
        connector: Arc<dyn Connector>,
        credentials: Arc<CredentialStore>,
        config: &TransportConfig,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (foreground, _) = watch::channel(true);
        let shared = Shared {
            connector,
            credentials,
            backoff: Backoff::from_config(config),
            connect_timeout: Duration::from_secs(config.connect_timeout_seconds.max(1)),
            state,
            foreground,
            events,
            inner: Mutex::new(Inner::default()),
        };
        (
            Self {
                shared: Arc::new(shared),
            },
            events_rx,
        )
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Subscribe to state changes. The receiver starts at the current state.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Open the connection with `token`.
    ///
    /// A no-op when already open (connected or connecting) with the same
    /// token. Otherwise any existing connection is torn down, a
    /// [`TransportEvent::Closed`] is emitted for it, and a new one starts.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn open(&self, token: &str) {
        let shared = &self.shared;
        let mut inner = shared.lock();
        let state = *shared.state.borrow();
        if inner.token.as_deref() == Some(token) && state != ConnectionState::Disconnected {
            debug!("Transport already open with the current token");
            return;
        }

        let was_open = match inner.cancel.take() {
            Some(previous) => {
                previous.cancel();
                true
            }
            None => false,
        };
        inner.outbound = None;
        inner.epoch += 1;
        inner.token = Some(token.to_string());
        let cancel = CancellationToken::new();
        inner.cancel = Some(cancel.clone());
        let epoch = inner.epoch;

        if was_open {
            info!("Reopening transport with a new token");
            shared.emit(TransportEvent::Closed);
        }
        shared.set_state(ConnectionState::Connecting);
        drop(inner);

        tokio::spawn(supervise(
            Arc::clone(&self.shared),
            token.to_string(),
            epoch,
            cancel,
        ));
    }

    /// Close the connection and stop reconnecting.
    pub fn close(&self) {
        let shared = &self.shared;
        let mut inner = shared.lock();
        inner.epoch += 1;
        inner.token = None;
        inner.outbound = None;
        let was_open = match inner.cancel.take() {
            Some(cancel) => {
                cancel.cancel();
                true
            }
            None => false,
        };
        shared.set_state(ConnectionState::Disconnected);
        if was_open {
            info!("Transport closed");
            shared.emit(TransportEvent::Closed);
        }
    }

    /// Hand `frame` to the writer.
    ///
    /// Returns once the frame is queued, not once it is on the wire. Frames
    /// still queued when the socket dies are dropped with it; callers learn
    /// of that through [`TransportEvent::ConnectionLost`], and a
    /// running generation then fails as interrupted.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::NotConnected`] unless the state is
    /// `Connected`.
    pub fn send(&self, frame: &ClientFrame) -> std::result::Result<(), TransportError> {
        let text = serde_json::to_string(frame).map_err(|e| {
            warn!("Failed to encode frame: {}", e);
            TransportError::NotConnected
        })?;
        let inner = self.shared.lock();
        if *self.shared.state.borrow() != ConnectionState::Connected {
            return Err(TransportError::NotConnected);
        }
        let outbound = inner.outbound.as_ref().ok_or(TransportError::NotConnected)?;
        outbound
            .send(text)
            .map_err(|_| TransportError::NotConnected)?;
        debug!(
            conversation_id = frame.conversation_id(),
            "Sent {} frame",
            frame_kind(frame)
        );
        Ok(())
    }

    /// Register the source that renews expired or refused tokens.
    ///
    /// Held weakly; the source usually owns this connection.
    pub fn set_token_source(&self, source: Weak<dyn TokenSource>) {
        self.shared.lock().token_source = Some(source);
    }

    /// Pause (`false`) or resume (`true`) reconnect attempts.
    ///
    /// Backgrounded applications keep their state but stop retrying until
    /// foregrounded again.
    pub fn set_foreground(&self, foreground: bool) {
        self.shared.foreground.send_replace(foreground);
    }
}

impl Drop for TransportConnection {
    fn drop(&mut self) {
        if let Some(cancel) = self.shared.lock().cancel.take() {
            cancel.cancel();
        }
    }
}

fn frame_kind(frame: &ClientFrame) -> &'static str {
    match frame {
        ClientFrame::Join { .. } => "join",
        ClientFrame::Leave { .. } => "leave",
        ClientFrame::Generate { .. } => "generate",
        ClientFrame::StopGeneration { .. } => "stopGeneration",
    }
}

fn is_token_rejection(error: &anyhow::Error) -> bool {
    matches!(
        error.downcast_ref::<AgrichatError>(),
        Some(AgrichatError::Auth(AuthError::SessionExpired))
    )
}

/// Connect, read, and reconnect until cancelled.
async fn supervise(
    shared: Arc<Shared>,
    initial_token: String,
    epoch: u64,
    cancel: CancellationToken,
) {
    let mut attempt: u32 = 0;
    let mut resumed = false;

    loop {
        if attempt > 0
            && !shared.with_current(epoch, |_| shared.set_state(ConnectionState::Connecting))
        {
            return;
        }

        // Renewal runs to completion: it may be the one ending the session.
        let Some(token) = shared.next_token(&initial_token).await else {
            shared.end_without_session(epoch);
            return;
        };
        if cancel.is_cancelled() {
            return;
        }
        let outcome = tokio::select! {
            _ = cancel.cancelled() => return,
            r = tokio::time::timeout(shared.connect_timeout, shared.connector.connect(&token)) => r,
        };

        match outcome {
            Ok(Ok(link)) => {
                let Link { outbound, mut inbound } = link;
                let installed = shared.with_current(epoch, |inner| {
                    inner.outbound = Some(outbound);
                    shared.set_state(ConnectionState::Connected);
                    shared.emit(TransportEvent::Connected { resumed });
                });
                if !installed {
                    return;
                }
                info!(resumed, "Transport connected");
                resumed = true;

                loop {
                    let next = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return,
                        msg = inbound.recv() => msg,
                    };
                    let Some(text) = next else { break };
                    match serde_json::from_str::<ServerFrame>(&text) {
                        Ok(frame) => {
                            debug!(conversation_id = frame.conversation_id(), "Received frame");
                            if !shared.with_current(epoch, |_| shared.emit(TransportEvent::Frame(frame))) {
                                return;
                            }
                        }
                        Err(e) => warn!("Dropping malformed frame: {}", e),
                    }
                }

                attempt = 1;
                let lost = shared.with_current(epoch, |inner| {
                    inner.outbound = None;
                    shared.set_state(ConnectionState::Reconnecting(attempt));
                    shared.emit(TransportEvent::ConnectionLost);
                });
                if !lost {
                    return;
                }
                warn!("Transport connection lost");
            }
            Ok(Err(e)) => {
                attempt = attempt.saturating_add(1);
                warn!(attempt, "Transport connect failed: {}", e);
                if is_token_rejection(&e) {
                    if let Some(source) = shared.token_source() {
                        if source.token_rejected(&token).await.is_none() {
                            shared.end_without_session(epoch);
                            return;
                        }
                    }
                }
                if !shared.with_current(epoch, |_| shared.set_state(ConnectionState::Reconnecting(attempt))) {
                    return;
                }
            }
            Err(_) => {
                attempt = attempt.saturating_add(1);
                warn!(attempt, "Transport connect timed out");
                if !shared.with_current(epoch, |_| shared.set_state(ConnectionState::Reconnecting(attempt))) {
                    return;
                }
            }
        }

        let delay = shared.backoff.delay(attempt);
        debug!(attempt, delay_ms = delay.as_millis() as u64, "Waiting before reconnect");
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
        if !shared.wait_foreground(&cancel).await {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::credentials::MemoryPersistence;
    use crate::session::Session;
    use crate::transport::fake::{accept, FakeConnector};
    use chrono::Utc;

    fn fast_config() -> TransportConfig {
        TransportConfig {
            backoff_base_ms: 5,
            backoff_factor: 2.0,
            backoff_cap_ms: 20,
            backoff_jitter: 0.0,
            connect_timeout_seconds: 1,
        }
    }

    fn session(token: &str) -> Session {
        Session {
            access_token: token.to_string(),
            refresh_token: "refresh".to_string(),
            expires_at: Utc::now() + chrono::Duration::hours(1),
            user_id: "farmer-1".to_string(),
        }
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> TransportEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("no transport event within timeout")
            .expect("event channel closed")
    }

    fn join(id: &str) -> ClientFrame {
        ClientFrame::Join {
            conversation_id: id.to_string(),
        }
    }

    fn setup() -> (
        TransportConnection,
        mpsc::UnboundedReceiver<TransportEvent>,
        Arc<FakeConnector>,
        mpsc::UnboundedReceiver<crate::transport::fake::FakeServer>,
        Arc<CredentialStore>,
    ) {
        let (connector, servers) = FakeConnector::new();
        let credentials = Arc::new(CredentialStore::new(Arc::new(MemoryPersistence::default())));
        let (conn, events) = TransportConnection::new(
            Arc::clone(&connector) as Arc<dyn Connector>,
            Arc::clone(&credentials),
            &fast_config(),
        );
        (conn, events, connector, servers, credentials)
    }

    #[tokio::test]
    async fn test_send_fails_when_disconnected() {
        let (conn, _events, _connector, _servers, _creds) = setup();
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(conn.send(&join("c1")), Err(TransportError::NotConnected));
    }

    #[tokio::test]
    async fn test_open_connects_and_sends() {
        let (conn, mut events, _connector, mut servers, _creds) = setup();
        conn.open("tok-1");
        let mut server = accept(&mut servers).await;
        assert_eq!(server.token, "tok-1");
        assert_eq!(next_event(&mut events).await, TransportEvent::Connected { resumed: false });
        assert_eq!(conn.state(), ConnectionState::Connected);

        conn.send(&join("c1")).unwrap();
        assert_eq!(server.next_frame().await, Some(join("c1")));
    }

    #[tokio::test]
    async fn test_open_same_token_is_noop() {
        let (conn, mut events, connector, mut servers, _creds) = setup();
        conn.open("tok-1");
        let _server = accept(&mut servers).await;
        next_event(&mut events).await;

        conn.open("tok-1");
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(connector.tokens(), vec!["tok-1".to_string()]);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_open_new_token_reconnects() {
        let (conn, mut events, _connector, mut servers, _creds) = setup();
        conn.open("tok-1");
        let _first = accept(&mut servers).await;
        next_event(&mut events).await;

        conn.open("tok-2");
        assert_eq!(next_event(&mut events).await, TransportEvent::Closed);
        let second = accept(&mut servers).await;
        assert_eq!(second.token, "tok-2");
        assert_eq!(next_event(&mut events).await, TransportEvent::Connected { resumed: false });
    }

    #[tokio::test]
    async fn test_connection_lost_then_reconnects_with_current_token() {
        let (conn, mut events, _connector, mut servers, creds) = setup();
        conn.open("tok-1");
        let server = accept(&mut servers).await;
        next_event(&mut events).await;

        creds.set(session("tok-refreshed")).await.unwrap();
        drop(server);

        assert_eq!(next_event(&mut events).await, TransportEvent::ConnectionLost);
        assert_eq!(conn.send(&join("c1")), Err(TransportError::NotConnected));

        let second = accept(&mut servers).await;
        assert_eq!(second.token, "tok-refreshed");
        assert_eq!(next_event(&mut events).await, TransportEvent::Connected { resumed: true });
    }

    #[tokio::test]
    async fn test_failed_attempts_are_retried() {
        let (conn, mut events, connector, mut servers, _creds) = setup();
        connector.fail_next(2);
        conn.open("tok-1");
        let _server = accept(&mut servers).await;
        assert_eq!(next_event(&mut events).await, TransportEvent::Connected { resumed: false });
        assert_eq!(connector.tokens().len(), 3);
    }

    #[tokio::test]
    async fn test_close_emits_closed_and_stops() {
        let (conn, mut events, connector, mut servers, _creds) = setup();
        conn.open("tok-1");
        let _server = accept(&mut servers).await;
        next_event(&mut events).await;

        conn.close();
        assert_eq!(next_event(&mut events).await, TransportEvent::Closed);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(conn.send(&join("c1")), Err(TransportError::NotConnected));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(connector.tokens().len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_frame_is_dropped() {
        let (conn, mut events, _connector, mut servers, _creds) = setup();
        conn.open("tok-1");
        let server = accept(&mut servers).await;
        next_event(&mut events).await;

        server.push_raw("not json");
        let frame = ServerFrame::Stopped {
            conversation_id: "c1".to_string(),
        };
        server.push(&frame);
        assert_eq!(next_event(&mut events).await, TransportEvent::Frame(frame));
    }

    #[tokio::test]
    async fn test_background_pauses_reconnect() {
        let (conn, mut events, connector, mut servers, _creds) = setup();
        conn.open("tok-1");
        let server = accept(&mut servers).await;
        next_event(&mut events).await;

        conn.set_foreground(false);
        drop(server);
        assert_eq!(next_event(&mut events).await, TransportEvent::ConnectionLost);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(connector.tokens().len(), 1);

        conn.set_foreground(true);
        let _server = accept(&mut servers).await;
        assert_eq!(next_event(&mut events).await, TransportEvent::Connected { resumed: true });
    }

    #[tokio::test]
    async fn test_state_subscription_observes_transitions() {
        let (conn, mut events, _connector, mut servers, _creds) = setup();
        let mut state = conn.subscribe_state();
        assert_eq!(*state.borrow(), ConnectionState::Disconnected);
        conn.open("tok-1");
        let _server = accept(&mut servers).await;
        next_event(&mut events).await;
        state.changed().await.unwrap();
        assert_eq!(*state.borrow_and_update(), ConnectionState::Connected);
    }

    /// Token source that installs `renewed` (or fails) and records calls.
    struct ScriptedSource {
        credentials: Arc<CredentialStore>,
        renewed: Option<&'static str>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedSource {
        async fn renew(&self) -> Option<String> {
            let token = self.renewed?;
            self.credentials.set(session(token)).await.ok()?;
            Some(token.to_string())
        }
    }

    #[async_trait::async_trait]
    impl TokenSource for ScriptedSource {
        async fn fresh_token(&self) -> Option<String> {
            self.calls.lock().unwrap().push("fresh".to_string());
            self.renew().await
        }

        async fn token_rejected(&self, token: &str) -> Option<String> {
            self.calls.lock().unwrap().push(format!("rejected:{}", token));
            self.renew().await
        }
    }

    fn install(
        conn: &TransportConnection,
        credentials: &Arc<CredentialStore>,
        renewed: Option<&'static str>,
    ) -> (Arc<ScriptedSource>, Arc<dyn TokenSource>) {
        let source = Arc::new(ScriptedSource {
            credentials: Arc::clone(credentials),
            renewed,
            calls: Mutex::new(Vec::new()),
        });
        let handle: Arc<dyn TokenSource> = source.clone();
        conn.set_token_source(Arc::downgrade(&handle));
        (source, handle)
    }

    #[tokio::test]
    async fn test_expired_token_is_renewed_before_reconnect() {
        let (conn, mut events, _connector, mut servers, creds) = setup();
        let (source, _handle) = install(&conn, &creds, Some("tok-new"));
        creds.set(session("tok-old")).await.unwrap();
        conn.open("tok-old");
        let server = accept(&mut servers).await;
        next_event(&mut events).await;

        let mut stale = session("tok-old");
        stale.expires_at = Utc::now() - chrono::Duration::seconds(5);
        creds.set(stale).await.unwrap();
        drop(server);

        assert_eq!(next_event(&mut events).await, TransportEvent::ConnectionLost);
        let second = accept(&mut servers).await;
        assert_eq!(second.token, "tok-new");
        assert_eq!(next_event(&mut events).await, TransportEvent::Connected { resumed: true });
        assert_eq!(*source.calls.lock().unwrap(), vec!["fresh".to_string()]);
    }

    #[tokio::test]
    async fn test_refused_token_is_renewed_and_retried() {
        let (conn, mut events, connector, mut servers, creds) = setup();
        let (source, _handle) = install(&conn, &creds, Some("tok-new"));
        creds.set(session("tok-old")).await.unwrap();
        connector.reject_token("tok-old");

        conn.open("tok-old");
        let server = accept(&mut servers).await;
        assert_eq!(server.token, "tok-new");
        assert_eq!(next_event(&mut events).await, TransportEvent::Connected { resumed: false });
        assert_eq!(connector.tokens(), vec!["tok-old".to_string(), "tok-new".to_string()]);
        assert_eq!(*source.calls.lock().unwrap(), vec!["rejected:tok-old".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_renewal_stops_reconnecting() {
        let (conn, mut events, connector, _servers, creds) = setup();
        let (_source, _handle) = install(&conn, &creds, None);
        creds.set(session("tok-old")).await.unwrap();
        connector.reject_token("tok-old");

        conn.open("tok-old");
        assert_eq!(next_event(&mut events).await, TransportEvent::Closed);
        assert_eq!(conn.state(), ConnectionState::Disconnected);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(connector.tokens(), vec!["tok-old".to_string()]);
    }
}
