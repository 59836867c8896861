//! Chat client facade
//!
//! [`ChatClient`] builds the session context once and wires the components
//! around it:
//!
//! ```text
//!   CredentialStore ──▶ RestClient ──▶ SessionAuthenticator
//!          │                                   │ open/close
//!          └────────────▶ TransportConnection ◀┘
//!                               │ TransportEvent
//!                               ▼
//!                          dispatch loop ──▶ ConversationRegistry
//!                               │        ──▶ GenerationController
//!                               ▼
//!                           StateStore ──▶ watch / broadcast observers
//! ```
//!
//! Inbound traffic is handled by one dispatch task, in arrival order. REST
//! calls go through [`ChatClient::authorized`], which refreshes an expiring
//! token first and silently retries once after a 401.

use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::types::{
    Conversation, Delivery, Message, NewConversation, NewMessage, User, UserUpdate,
};
use crate::api::{ApiError, RestClient};
use crate::collaborators::{
    DeviceIdentity, FileDeviceIdentity, LocalizationProvider, StaticLocale,
};
use crate::config::{Config, CredentialBackend};
use crate::error::{AuthError, DataError, Result, SendError};
use crate::generation::{GenerationController, GenerationEvent, GenerationState, Reservation};
use crate::registry::ConversationRegistry;
use crate::session::credentials::{
    CredentialPersistence, FilePersistence, KeyringPersistence,
};
use crate::session::{
    AuthApi, CredentialStore, Credentials, Session, SessionAuthenticator, SessionContext,
    SessionEvent,
};
use crate::store::StateStore;
use crate::transport::{
    ConnectionState, Connector, TransportConnection, TransportEvent, WebSocketConnector,
};

type ApiResult<T> = std::result::Result<T, ApiError>;

/// State shared between the facade and its dispatch task.
#[derive(Debug)]
struct Core {
    transport: Arc<TransportConnection>,
    registry: ConversationRegistry,
    generation: GenerationController,
    store: StateStore,
    generation_events: broadcast::Sender<GenerationEvent>,
    connection: watch::Sender<ConnectionState>,
}

impl Core {
    fn publish(&self, events: Vec<GenerationEvent>) {
        for event in events {
            self.store.apply_generation(&event);
            // No subscribers is fine.
            let _ = self.generation_events.send(event);
        }
    }

    fn on_transport(&self, event: TransportEvent) {
        match event {
            TransportEvent::Connected { resumed } => {
                let replayed = self.registry.on_connected();
                // A loss may already be queued behind this event.
                if self.transport.state() == ConnectionState::Connected {
                    self.connection.send_replace(ConnectionState::Connected);
                }
                info!(resumed, rejoined = replayed.len(), "Transport ready");
            }
            TransportEvent::Frame(frame) => {
                if !self.registry.is_subscribed(frame.conversation_id()) {
                    debug!(
                        conversation_id = frame.conversation_id(),
                        "Dropping frame for unsubscribed conversation"
                    );
                    return;
                }
                let events = self.generation.handle_frame(frame);
                self.publish(events);
            }
            TransportEvent::ConnectionLost | TransportEvent::Closed => {
                self.registry.on_connection_lost();
                let interrupted = self.generation.on_connection_lost();
                if !interrupted.is_empty() {
                    warn!(count = interrupted.len(), "Generations interrupted");
                }
                self.publish(interrupted);
            }
        }
    }

    fn reset(&self) {
        self.registry.clear();
        self.generation.clear();
        self.store.clear();
    }
}

async fn dispatch(
    core: Arc<Core>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    mut session: broadcast::Receiver<SessionEvent>,
    mut state: watch::Receiver<ConnectionState>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => core.on_transport(event),
                None => break,
            },
            event = session.recv() => match event {
                Ok(SessionEvent::SessionExpired | SessionEvent::SignedOut) => core.reset(),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Dispatcher missed {} session events", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *state.borrow_and_update();
                // Connected is published once subscriptions are restored.
                if current != ConnectionState::Connected {
                    core.connection.send_replace(current);
                }
            }
        }
    }
    debug!("Dispatcher stopped");
}

/// Entry point for the chat session layer.
///
/// Must be created inside a Tokio runtime.
pub struct ChatClient {
    context: SessionContext,
    api: Arc<RestClient>,
    auth: Arc<SessionAuthenticator>,
    core: Arc<Core>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for ChatClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatClient")
            .field("context", &self.context)
            .field("connection", &self.connection_state())
            .finish_non_exhaustive()
    }
}

impl ChatClient {
    /// Build a client with the platform defaults selected by `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the data directory cannot be determined, the
    /// stream URL is invalid, or the HTTP client cannot be built.
    pub fn from_config(config: Config) -> Result<Self> {
        let persistence: Arc<dyn CredentialPersistence> = match config.session.credential_backend
        {
            CredentialBackend::Keyring => Arc::new(KeyringPersistence::default()),
            CredentialBackend::File => match &config.session.credential_file {
                Some(path) => Arc::new(FilePersistence::new(path.clone())),
                None => Arc::new(FilePersistence::in_data_dir()?),
            },
        };
        let credentials = Arc::new(CredentialStore::with_skew(
            persistence,
            chrono::Duration::seconds(config.session.refresh_skew_seconds),
        ));
        let device: Arc<dyn DeviceIdentity> = Arc::new(FileDeviceIdentity::in_data_dir()?);
        let locale: Arc<dyn LocalizationProvider> =
            Arc::new(StaticLocale::new(config.server.language.clone()));
        let connector: Arc<dyn Connector> =
            Arc::new(WebSocketConnector::new(&config.server.stream_url)?);

        let context = SessionContext::new(config, credentials, device, locale);
        Self::new(context, connector)
    }

    /// Build a client over an explicit context and connector.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(context: SessionContext, connector: Arc<dyn Connector>) -> Result<Self> {
        let api = Arc::new(RestClient::new(context.clone())?);
        let (transport, events) = TransportConnection::new(
            connector,
            Arc::clone(&context.credentials),
            &context.config.transport,
        );
        let transport = Arc::new(transport);
        let auth = Arc::new(SessionAuthenticator::new(
            Arc::clone(&api) as Arc<dyn AuthApi>,
            context.clone(),
            Arc::clone(&transport),
        ));
        auth.install_token_source();

        let (generation_events, _) = broadcast::channel(256);
        let core = Arc::new(Core {
            registry: ConversationRegistry::new(Arc::clone(&transport)),
            generation: GenerationController::new(
                Arc::clone(&transport),
                Arc::clone(&context.locale),
            ),
            store: StateStore::new(),
            generation_events,
            connection: watch::channel(transport.state()).0,
            transport,
        });

        let cancel = CancellationToken::new();
        tokio::spawn(dispatch(
            Arc::clone(&core),
            events,
            auth.subscribe(),
            core.transport.subscribe_state(),
            cancel.clone(),
        ));

        Ok(Self {
            context,
            api,
            auth,
            core,
            cancel,
        })
    }

    /// The shared session context.
    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    /// The reactive state store.
    pub fn store(&self) -> &StateStore {
        &self.core.store
    }

    // -----------------------------------------------------------------------
    // Session
    // -----------------------------------------------------------------------

    /// Sign in with `credentials` and connect the streaming channel.
    ///
    /// # Errors
    ///
    /// See [`SessionAuthenticator::authenticate`].
    pub async fn authenticate(
        &self,
        credentials: Credentials,
    ) -> std::result::Result<Session, AuthError> {
        self.auth.authenticate(credentials).await
    }

    /// Resume a persisted session. Returns `Ok(None)` if none was stored.
    ///
    /// # Errors
    ///
    /// See [`SessionAuthenticator::resume`].
    pub async fn restore(&self) -> std::result::Result<Option<Session>, AuthError> {
        self.auth.resume().await
    }

    /// End the session and drop all client state.
    pub async fn sign_out(&self) {
        self.auth.sign_out().await;
        self.core.reset();
    }

    /// Session lifecycle notifications.
    pub fn session_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.auth.subscribe()
    }

    /// Run `call` with a fresh token, refreshing once and retrying on 401.
    ///
    /// # Errors
    ///
    /// - [`ApiError::Auth`] with [`AuthError::SessionExpired`] if there is
    ///   no session, renewal fails, or the retry is rejected again
    /// - whatever `call` returns otherwise
    pub async fn authorized<T, F, Fut>(&self, call: F) -> ApiResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = ApiResult<T>>,
    {
        self.auth.ensure_fresh().await?;
        let seen = self.context.credentials.access_token();
        match call().await {
            Err(ApiError::Unauthorized) => {
                debug!("401; refreshing and retrying once");
                self.auth.refresh_after(seen.as_deref()).await?;
                match call().await {
                    Err(ApiError::Unauthorized) => Err(AuthError::SessionExpired.into()),
                    other => other,
                }
            }
            other => other,
        }
    }

    // -----------------------------------------------------------------------
    // User and conversations
    // -----------------------------------------------------------------------

    /// Fetch the profile into the store.
    pub async fn load_user(&self) -> ApiResult<User> {
        let user = self.authorized(|| self.api.get_user()).await?;
        self.core.store.set_user(Some(user.clone()));
        Ok(user)
    }

    /// Update the profile.
    pub async fn update_user(&self, update: &UserUpdate) -> ApiResult<User> {
        let user = self.authorized(|| self.api.update_user(update)).await?;
        self.core.store.set_user(Some(user.clone()));
        Ok(user)
    }

    /// Fetch the conversation list and merge it into the store.
    ///
    /// Returns the merged list, most recent first.
    pub async fn load_conversations(&self) -> ApiResult<Vec<Conversation>> {
        let listing = self.authorized(|| self.api.list_conversations()).await?;
        self.core.store.replace_conversations(listing);
        Ok(self.core.store.conversations())
    }

    /// Create a conversation. It is visible in the store on return.
    pub async fn create_conversation(&self, new: &NewConversation) -> ApiResult<Conversation> {
        let conversation = self.authorized(|| self.api.create_conversation(new)).await?;
        self.core.store.upsert_conversation(conversation.clone());
        Ok(conversation)
    }

    /// Delete a conversation. Deleting one the server no longer has is not
    /// an error.
    pub async fn delete_conversation(&self, conversation_id: &str) -> ApiResult<()> {
        match self
            .authorized(|| self.api.delete_conversation(conversation_id))
            .await
        {
            Ok(()) | Err(ApiError::Data(DataError::NotFound)) => {}
            Err(e) => return Err(e),
        }
        self.close_conversation(conversation_id);
        self.core.store.remove_conversation(conversation_id);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Conversation view
    // -----------------------------------------------------------------------

    /// Fetch the messages of `conversation_id` and merge them into the store.
    pub async fn load_messages(&self, conversation_id: &str) -> ApiResult<Vec<Message>> {
        let snapshot = self
            .authorized(|| self.api.list_messages(conversation_id))
            .await?;
        self.core.store.replace_messages(conversation_id, snapshot);
        Ok(self.core.store.messages(conversation_id))
    }

    /// Subscribe to `conversation_id` and load its history.
    pub async fn open_conversation(&self, conversation_id: &str) -> ApiResult<Vec<Message>> {
        self.core.registry.join(conversation_id);
        self.load_messages(conversation_id).await
    }

    /// Unsubscribe from `conversation_id`, detaching any in-flight response.
    pub fn close_conversation(&self, conversation_id: &str) {
        self.core.registry.leave(conversation_id);
        if let Some(event) = self.core.generation.leave(conversation_id) {
            self.core.publish(vec![event]);
        }
    }

    // -----------------------------------------------------------------------
    // Messaging
    // -----------------------------------------------------------------------

    /// Send a user message and start generating the reply.
    ///
    /// The message appears in the store as `Pending` immediately, becomes
    /// `Sent` with the server's copy once accepted, or `Failed` if the
    /// request fails (see [`retry_message`](Self::retry_message)).
    ///
    /// # Errors
    ///
    /// - [`AlreadyGenerating`](crate::error::GenerationError::AlreadyGenerating)
    ///   if a reply is in flight or another send to the conversation is
    ///   pending; no message is inserted
    /// - [`SendError::Api`] if the message was not accepted
    /// - [`SendError::Transport`] if the message was accepted but the
    ///   generate request could not be sent
    /// - `AlreadyGenerating` after acceptance only if a reply started from
    ///   another device during the request
    pub async fn send_message(
        &self,
        conversation_id: &str,
        content: &str,
    ) -> std::result::Result<Message, SendError> {
        let reservation = self.core.generation.reserve(conversation_id)?;
        self.core.registry.join(conversation_id);
        let local = self.core.store.insert_optimistic(conversation_id, content);
        self.deliver(reservation, &local.id, content).await
    }

    /// Re-send a `Failed` message with its original client id.
    ///
    /// # Errors
    ///
    /// [`DataError::NotFound`] if no failed message has that id, otherwise
    /// as [`send_message`](Self::send_message).
    pub async fn retry_message(
        &self,
        conversation_id: &str,
        message_id: &str,
    ) -> std::result::Result<Message, SendError> {
        let message = self
            .core
            .store
            .message(conversation_id, message_id)
            .filter(|m| m.delivery == Delivery::Failed)
            .ok_or(ApiError::Data(DataError::NotFound))?;
        let reservation = self.core.generation.reserve(conversation_id)?;
        self.core.registry.join(conversation_id);
        self.core
            .store
            .set_delivery(conversation_id, message_id, Delivery::Pending);
        self.deliver(reservation, message_id, &message.content).await
    }

    /// Remove a message that was never accepted.
    pub fn discard_message(&self, conversation_id: &str, message_id: &str) -> bool {
        self.core.store.discard_message(conversation_id, message_id)
    }

    /// The reservation is held across the request and released on failure.
    async fn deliver(
        &self,
        reservation: Reservation<'_>,
        local_id: &str,
        content: &str,
    ) -> std::result::Result<Message, SendError> {
        let owned_id = reservation.conversation_id().to_owned();
        let conversation_id = owned_id.as_str();
        let new = NewMessage {
            conversation_id: conversation_id.to_string(),
            content: content.to_string(),
            client_id: local_id.to_string(),
            language: self.context.locale.current_language_code(),
        };
        let server = match self.authorized(|| self.api.send_message(&new)).await {
            Ok(server) => server,
            Err(e) => {
                warn!(conversation_id, "Message not accepted: {}", e);
                self.core
                    .store
                    .set_delivery(conversation_id, local_id, Delivery::Failed);
                return Err(e.into());
            }
        };
        self.core
            .store
            .confirm_message(conversation_id, local_id, server.clone());

        let started = reservation.start(content)?;
        self.core.publish(vec![started]);
        Ok(server)
    }

    /// Ask the server to stop the reply in flight. A no-op when idle.
    pub fn stop_generation(&self, conversation_id: &str) {
        self.core.generation.stop(conversation_id);
    }

    /// Rate an assistant message from 1 to 5.
    ///
    /// # Errors
    ///
    /// [`ApiError::Invalid`] if `rating` is out of range.
    pub async fn rate_message(&self, message_id: &str, rating: u8) -> ApiResult<()> {
        if !(1..=5).contains(&rating) {
            return Err(ApiError::Invalid(format!(
                "rating must be between 1 and 5, got {}",
                rating
            )));
        }
        self.authorized(|| self.api.rate_message(message_id, rating))
            .await
    }

    /// Suggested opening questions in the active language.
    pub async fn starter_questions(&self) -> ApiResult<Vec<String>> {
        self.authorized(|| self.api.starter_questions()).await
    }

    /// Suggested follow-ups to `message_id`.
    pub async fn follow_up_questions(
        &self,
        conversation_id: &str,
        message_id: &str,
    ) -> ApiResult<Vec<String>> {
        self.authorized(|| self.api.follow_up_questions(conversation_id, message_id))
            .await
    }

    /// Transcribe recorded audio in the active language.
    pub async fn transcribe(&self, audio: Bytes, mime_type: &str) -> ApiResult<String> {
        let language = self.context.locale.current_language_code();
        self.authorized(|| self.api.transcribe_audio(audio.clone(), mime_type, &language))
            .await
    }

    // -----------------------------------------------------------------------
    // Observables
    // -----------------------------------------------------------------------

    /// Connection state; `Connected` only once subscriptions are restored.
    pub fn connection_state(&self) -> ConnectionState {
        *self.core.connection.borrow()
    }

    /// Watch the connection state.
    pub fn subscribe_connection(&self) -> watch::Receiver<ConnectionState> {
        self.core.connection.subscribe()
    }

    /// Generation transitions for every subscribed conversation.
    pub fn generation_events(&self) -> broadcast::Receiver<GenerationEvent> {
        self.core.generation_events.subscribe()
    }

    /// Generation state of `conversation_id`.
    pub fn generation_state(&self, conversation_id: &str) -> GenerationState {
        self.core.generation.state(conversation_id)
    }

    /// Pause reconnect attempts while the app is in the background.
    pub fn set_foreground(&self, foreground: bool) {
        self.core.transport.set_foreground(foreground);
    }
}

impl Drop for ChatClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::StaticDeviceIdentity;
    use crate::config::TransportConfig;
    use crate::error::GenerationError;
    use crate::session::credentials::MemoryPersistence;
    use crate::transport::fake::{accept, FakeConnector, FakeServer};
    use crate::transport::{ClientFrame, ServerFrame};
    use serde_json::{json, Value};
    use std::time::Duration;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Harness {
        client: ChatClient,
        servers: mpsc::UnboundedReceiver<FakeServer>,
        rest: MockServer,
    }

    async fn harness() -> Harness {
        let rest = MockServer::start().await;
        let mut config = Config::default();
        config.server.api_base = format!("{}/api", rest.uri());
        config.transport = TransportConfig {
            backoff_base_ms: 5,
            backoff_cap_ms: 10,
            backoff_jitter: 0.0,
            ..Default::default()
        };
        let context = SessionContext::new(
            config,
            Arc::new(CredentialStore::new(Arc::new(MemoryPersistence::default()))),
            Arc::new(StaticDeviceIdentity("device-1".to_string())),
            Arc::new(StaticLocale::new("hi")),
        );
        let (connector, servers) = FakeConnector::new();
        let client = ChatClient::new(context, connector as Arc<dyn Connector>).unwrap();
        Harness {
            client,
            servers,
            rest,
        }
    }

    fn ok(data: Value) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({ "success": true, "data": data }))
    }

    fn auth_body(token: &str) -> Value {
        json!({
            "accessToken": token,
            "refreshToken": format!("{}-refresh", token),
            "expiresIn": 3600,
            "userId": "farmer-1"
        })
    }

    fn server_message(id: &str, content: &str) -> Value {
        json!({
            "id": id,
            "conversationId": "c1",
            "content": content,
            "isFromUser": true,
            "timestamp": "2026-10-14T08:00:00Z"
        })
    }

    async fn wait_connected(client: &ChatClient) {
        let mut rx = client.subscribe_connection();
        tokio::time::timeout(
            Duration::from_secs(2),
            rx.wait_for(|s| *s == ConnectionState::Connected),
        )
        .await
        .expect("timed out waiting for connection")
        .unwrap();
    }

    async fn signed_in() -> (Harness, FakeServer) {
        let mut h = harness().await;
        Mock::given(method("POST"))
            .and(path("/api/auth/device"))
            .respond_with(ok(auth_body("login-token")))
            .mount(&h.rest)
            .await;
        h.client.authenticate(Credentials::Device).await.unwrap();
        let server = accept(&mut h.servers).await;
        wait_connected(&h.client).await;
        (h, server)
    }

    async fn mount_send(rest: &MockServer, id: &str, content: &str) {
        Mock::given(method("POST"))
            .and(path("/api/messages"))
            .respond_with(ok(server_message(id, content)))
            .mount(rest)
            .await;
    }

    async fn next_terminal(rx: &mut broadcast::Receiver<GenerationEvent>) -> GenerationEvent {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("timed out waiting for generation event")
                .unwrap();
            if event.is_terminal() {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn test_send_message_streams_reply_into_store() {
        let (h, mut server) = signed_in().await;
        let question = "How do I treat wheat rust?";
        mount_send(&h.rest, "srv-1", question).await;
        let mut events = h.client.generation_events();

        let sent = h.client.send_message("c1", question).await.unwrap();
        assert_eq!(sent.id, "srv-1");
        assert_eq!(
            server.next_frame().await,
            Some(ClientFrame::Join {
                conversation_id: "c1".to_string()
            })
        );
        assert_eq!(
            server.next_frame().await,
            Some(ClientFrame::Generate {
                conversation_id: "c1".to_string(),
                message: question.to_string(),
                language: "hi".to_string(),
            })
        );

        for chunk in ["Apply ", "a fungicide."] {
            server.push(&ServerFrame::Delta {
                conversation_id: "c1".to_string(),
                chunk: chunk.to_string(),
            });
        }
        server.push(&ServerFrame::Complete {
            conversation_id: "c1".to_string(),
            follow_up_questions: vec!["Which fungicide?".to_string()],
            title: Some("Wheat rust".to_string()),
            message_id: Some("srv-2".to_string()),
        });

        match next_terminal(&mut events).await {
            GenerationEvent::Completed { content, .. } => assert_eq!(content, "Apply a fungicide."),
            other => panic!("unexpected event {:?}", other),
        }
        let messages = h.client.store().messages("c1");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].id, "srv-1");
        assert_eq!(messages[0].delivery, Delivery::Sent);
        assert_eq!(messages[1].id, "srv-2");
        assert!(messages[1].is_complete);
        assert_eq!(h.client.generation_state("c1"), GenerationState::Idle);
    }

    #[tokio::test]
    async fn test_second_send_while_generating_is_rejected() {
        let (h, _server) = signed_in().await;
        mount_send(&h.rest, "srv-1", "first").await;
        h.client.send_message("c1", "first").await.unwrap();

        let err = h.client.send_message("c1", "second").await.unwrap_err();
        assert_eq!(err, SendError::Generation(GenerationError::AlreadyGenerating));
        assert_eq!(h.client.store().messages("c1").len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_sends_insert_one_message() {
        let (h, _server) = signed_in().await;
        Mock::given(method("POST"))
            .and(path("/api/messages"))
            .respond_with(ok(server_message("srv-1", "first")).set_delay(Duration::from_millis(100)))
            .mount(&h.rest)
            .await;

        let (first, second) = tokio::join!(
            h.client.send_message("c1", "first"),
            h.client.send_message("c1", "second")
        );
        assert_eq!(first.unwrap().id, "srv-1");
        assert_eq!(
            second.unwrap_err(),
            SendError::Generation(GenerationError::AlreadyGenerating)
        );

        let from_user: Vec<Message> = h
            .client
            .store()
            .messages("c1")
            .into_iter()
            .filter(|m| m.is_from_user)
            .collect();
        assert_eq!(from_user.len(), 1);
        assert_eq!(from_user[0].id, "srv-1");
        let posts = h
            .rest
            .received_requests()
            .await
            .unwrap()
            .into_iter()
            .filter(|r| r.url.path() == "/api/messages")
            .count();
        assert_eq!(posts, 1);
    }

    #[tokio::test]
    async fn test_failed_send_releases_conversation() {
        let (h, _server) = signed_in().await;
        Mock::given(method("POST"))
            .and(path("/api/messages"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .mount(&h.rest)
            .await;
        mount_send(&h.rest, "srv-2", "second try").await;

        assert!(h.client.send_message("c1", "first try").await.is_err());
        let sent = h.client.send_message("c1", "second try").await.unwrap();
        assert_eq!(sent.id, "srv-2");
        assert_eq!(h.client.generation_state("c1"), GenerationState::Generating);
    }

    #[tokio::test]
    async fn test_failed_send_can_be_retried() {
        let (h, _server) = signed_in().await;
        Mock::given(method("POST"))
            .and(path("/api/messages"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .mount(&h.rest)
            .await;
        mount_send(&h.rest, "srv-1", "Is it going to rain?").await;

        let err = h
            .client
            .send_message("c1", "Is it going to rain?")
            .await
            .unwrap_err();
        assert!(matches!(err, SendError::Api(ApiError::Server { status: 500, .. })));
        let failed = h.client.store().messages("c1")[0].clone();
        assert_eq!(failed.delivery, Delivery::Failed);

        let sent = h.client.retry_message("c1", &failed.id).await.unwrap();
        assert_eq!(sent.id, "srv-1");
        let messages = h.client.store().messages("c1");
        assert_eq!(messages[0].id, "srv-1");
        assert_eq!(messages[0].delivery, Delivery::Sent);
    }

    #[tokio::test]
    async fn test_connection_loss_interrupts_and_rejoins() {
        let (mut h, mut server) = signed_in().await;
        mount_send(&h.rest, "srv-1", "question").await;
        let mut events = h.client.generation_events();
        h.client.send_message("c1", "question").await.unwrap();
        server.drain_frames(Duration::from_millis(30)).await;

        drop(server);
        match next_terminal(&mut events).await {
            GenerationEvent::Failed { error, .. } => assert_eq!(error, GenerationError::Interrupted),
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(
            h.client.generation_state("c1"),
            GenerationState::Failed(GenerationError::Interrupted)
        );

        let mut server = accept(&mut h.servers).await;
        assert_eq!(
            server.next_frame().await,
            Some(ClientFrame::Join {
                conversation_id: "c1".to_string()
            })
        );
        wait_connected(&h.client).await;
    }

    #[tokio::test]
    async fn test_reauthenticate_interrupts_generation_and_rejoins() {
        let (mut h, mut server) = signed_in().await;
        mount_send(&h.rest, "srv-1", "question").await;
        let mut events = h.client.generation_events();
        h.client.send_message("c1", "question").await.unwrap();
        server.drain_frames(Duration::from_millis(30)).await;
        assert_eq!(h.client.generation_state("c1"), GenerationState::Generating);

        h.rest.reset().await;
        Mock::given(method("POST"))
            .and(path("/api/auth/device"))
            .respond_with(ok(auth_body("second-token")))
            .mount(&h.rest)
            .await;
        h.client.authenticate(Credentials::Device).await.unwrap();

        match next_terminal(&mut events).await {
            GenerationEvent::Failed { error, .. } => assert_eq!(error, GenerationError::Interrupted),
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(
            h.client.generation_state("c1"),
            GenerationState::Failed(GenerationError::Interrupted)
        );

        let mut second = accept(&mut h.servers).await;
        assert_eq!(second.token, "second-token");
        assert_eq!(
            second.next_frame().await,
            Some(ClientFrame::Join {
                conversation_id: "c1".to_string()
            })
        );
        wait_connected(&h.client).await;
    }

    #[tokio::test]
    async fn test_frames_for_unsubscribed_conversations_are_dropped() {
        let (h, server) = signed_in().await;
        Mock::given(method("GET"))
            .and(path("/api/conversations/c1/messages"))
            .respond_with(ok(json!([])))
            .mount(&h.rest)
            .await;
        h.client.open_conversation("c1").await.unwrap();
        let mut events = h.client.generation_events();

        for id in ["c9", "c1"] {
            server.push(&ServerFrame::Delta {
                conversation_id: id.to_string(),
                chunk: "text".to_string(),
            });
        }
        let first = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.conversation_id(), "c1");
        assert!(h.client.store().messages("c9").is_empty());
    }

    #[tokio::test]
    async fn test_unauthorized_refreshes_once_and_retries() {
        let (h, _server) = signed_in().await;
        Mock::given(method("GET"))
            .and(path("/api/user"))
            .and(header("authorization", "Bearer login-token"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&h.rest)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/user"))
            .and(header("authorization", "Bearer fresh-token"))
            .respond_with(ok(json!({ "id": "farmer-1", "name": "Asha" })))
            .mount(&h.rest)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/auth/refresh"))
            .respond_with(ok(auth_body("fresh-token")))
            .expect(1)
            .mount(&h.rest)
            .await;

        let user = h.client.load_user().await.unwrap();
        assert_eq!(user.name.as_deref(), Some("Asha"));
        assert_eq!(h.client.store().user(), Some(user));
    }

    #[tokio::test]
    async fn test_repeated_unauthorized_is_session_expired() {
        let (h, _server) = signed_in().await;
        Mock::given(method("GET"))
            .and(path("/api/user"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&h.rest)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/auth/refresh"))
            .respond_with(ok(auth_body("fresh-token")))
            .mount(&h.rest)
            .await;

        let err = h.client.load_user().await.unwrap_err();
        assert_eq!(err, ApiError::Auth(AuthError::SessionExpired));
    }

    #[tokio::test]
    async fn test_calls_without_session_are_session_expired() {
        let h = harness().await;
        let err = h.client.load_conversations().await.unwrap_err();
        assert_eq!(err, ApiError::Auth(AuthError::SessionExpired));
    }

    #[tokio::test]
    async fn test_delete_missing_conversation_is_treated_as_deleted() {
        let (h, _server) = signed_in().await;
        Mock::given(method("DELETE"))
            .and(path("/api/conversations/c1"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&h.rest)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/conversations"))
            .respond_with(ok(json!({
                "id": "c1",
                "title": "Soil",
                "createdAt": "2026-10-14T08:00:00Z",
                "updatedAt": "2026-10-14T08:00:00Z"
            })))
            .mount(&h.rest)
            .await;

        h.client
            .create_conversation(&NewConversation::default())
            .await
            .unwrap();
        assert_eq!(h.client.store().conversations().len(), 1);
        h.client.delete_conversation("c1").await.unwrap();
        assert!(h.client.store().conversations().is_empty());
    }

    #[tokio::test]
    async fn test_rating_out_of_range_is_rejected_locally() {
        let (h, _server) = signed_in().await;
        assert!(matches!(
            h.client.rate_message("m1", 0).await,
            Err(ApiError::Invalid(_))
        ));
        assert!(matches!(
            h.client.rate_message("m1", 6).await,
            Err(ApiError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn test_sign_out_clears_state_and_disconnects() {
        let (h, _server) = signed_in().await;
        mount_send(&h.rest, "srv-1", "hello").await;
        h.client.send_message("c1", "hello").await.unwrap();

        h.client.sign_out().await;
        assert!(h.client.store().messages("c1").is_empty());
        assert!(h.client.store().conversations().is_empty());
        assert!(h.client.context().credentials.get().is_none());
        assert_eq!(h.client.generation_state("c1"), GenerationState::Idle);

        let mut rx = h.client.subscribe_connection();
        tokio::time::timeout(
            Duration::from_secs(2),
            rx.wait_for(|s| *s == ConnectionState::Disconnected),
        )
        .await
        .unwrap()
        .unwrap();
    }
}
