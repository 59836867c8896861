//! Session authenticator
//!
//! [`SessionAuthenticator`] is the only writer of the
//! [`CredentialStore`]. It obtains sessions, renews them silently, and
//! tells every dependent what happened through a broadcast of
//! [`SessionEvent`]s.
//!
//! - `authenticate` writes the store, then opens the transport with the new
//!   token. Re-authenticating while connected reopens the transport.
//! - `refresh` is single-flight: concurrent callers wait for one renewal.
//!   A failed renewal clears the session, closes the transport and emits
//!   [`SessionEvent::SessionExpired`].
//! - Both are bounded by the configured auth timeout, reported as
//!   [`AuthError::NetworkError`].
//! - Installed as the transport's [`TokenSource`], it renews an expired or
//!   refused token before the next reconnect attempt.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{broadcast, Mutex};
use tracing::{info, warn};

use crate::api::types::AuthPayload;
use crate::api::ApiError;
use crate::error::{AuthError, DataError};
use crate::session::{CredentialStore, Credentials, Session, SessionContext, SessionEvent};
use crate::transport::{TokenSource, TransportConnection};

type AuthResult<T> = std::result::Result<T, AuthError>;

/// Backend operations needed to obtain and renew sessions.
#[async_trait::async_trait]
pub trait AuthApi: Send + Sync {
    /// Exchange `credentials` for a session. `device_id` is supplied for
    /// device sessions.
    async fn login(
        &self,
        credentials: &Credentials,
        device_id: Option<&str>,
    ) -> std::result::Result<AuthPayload, ApiError>;

    /// Exchange a refresh token for a new session.
    async fn refresh(&self, refresh_token: &str) -> std::result::Result<AuthPayload, ApiError>;
}

/// Obtains, renews and ends sessions.
pub struct SessionAuthenticator {
    api: Arc<dyn AuthApi>,
    context: SessionContext,
    transport: Arc<TransportConnection>,
    events: broadcast::Sender<SessionEvent>,
    refresh_lock: Mutex<()>,
}

impl std::fmt::Debug for SessionAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionAuthenticator")
            .field("transport", &self.transport)
            .finish_non_exhaustive()
    }
}

impl SessionAuthenticator {
    /// Create an authenticator over `api` that writes `context.credentials`
    /// and drives `transport`.
    pub fn new(
        api: Arc<dyn AuthApi>,
        context: SessionContext,
        transport: Arc<TransportConnection>,
    ) -> Self {
        let (events, _) = broadcast::channel(32);
        Self {
            api,
            context,
            transport,
            events,
            refresh_lock: Mutex::new(()),
        }
    }

    /// Register with the transport so reconnects renew stale tokens.
    pub fn install_token_source(self: &Arc<Self>) {
        let source: Weak<dyn TokenSource> = Arc::downgrade(self) as Weak<dyn TokenSource>;
        self.transport.set_token_source(source);
    }

    /// Subscribe to session events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    fn credentials(&self) -> &CredentialStore {
        &self.context.credentials
    }

    fn timeout(&self) -> Duration {
        self.context.config.session.auth_timeout()
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Obtain a new session with `credentials`.
    ///
    /// # Errors
    ///
    /// - [`AuthError::InvalidCredentials`] if the server rejects them
    /// - [`AuthError::NetworkError`] on connection failure or timeout
    /// - [`AuthError::ServerError`] for any other server failure
    pub async fn authenticate(&self, credentials: Credentials) -> AuthResult<Session> {
        let device_id = match credentials {
            Credentials::Device => Some(
                self.context
                    .device
                    .id()
                    .map_err(|e| AuthError::ServerError(format!("device identity: {}", e)))?,
            ),
            _ => None,
        };

        let call = self.api.login(&credentials, device_id.as_deref());
        let payload = match tokio::time::timeout(self.timeout(), call).await {
            Err(_) => return Err(AuthError::NetworkError("authentication timed out".to_string())),
            Ok(result) => result.map_err(login_error)?,
        };

        let session = payload.into_session(None).map_err(login_error)?;
        if let Err(e) = self.credentials().set(session.clone()).await {
            // The mirror holds the session; only the next restart is affected.
            warn!("Session not persisted: {}", e);
        }
        self.transport.open(&session.access_token);
        info!(user_id = %session.user_id, "Authenticated");
        self.emit(SessionEvent::Authenticated {
            user_id: session.user_id.clone(),
        });
        Ok(session)
    }

    /// Renew the current session.
    ///
    /// Callers that observed a 401 for token `seen` should use
    /// [`refresh_after`](Self::refresh_after) instead so concurrent renewals
    /// collapse into one.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::SessionExpired`] if there is no session or the
    /// server refuses renewal, [`AuthError::NetworkError`] on timeout or
    /// connection failure. Either way the session has been ended.
    pub async fn refresh(&self) -> AuthResult<Session> {
        self.refresh_after(None).await
    }

    /// Renew the session unless it changed since the caller read `seen`.
    pub async fn refresh_after(&self, seen: Option<&str>) -> AuthResult<Session> {
        let _guard = self.refresh_lock.lock().await;

        let Some(current) = self.credentials().get() else {
            return Err(AuthError::SessionExpired);
        };
        if let Some(seen) = seen {
            if current.access_token != seen {
                // Someone else renewed while we waited.
                return Ok(current);
            }
        }

        let call = self.api.refresh(&current.refresh_token);
        let outcome = match tokio::time::timeout(self.timeout(), call).await {
            Err(_) => Err(AuthError::NetworkError("token refresh timed out".to_string())),
            Ok(Err(ApiError::Network(msg))) => Err(AuthError::NetworkError(msg)),
            Ok(Err(e)) => {
                warn!("Token refresh rejected: {}", e);
                Err(AuthError::SessionExpired)
            }
            Ok(Ok(payload)) => payload.into_session(Some(&current.user_id)).map_err(|e| {
                warn!("Token refresh returned an unusable session: {}", e);
                AuthError::SessionExpired
            }),
        };

        match outcome {
            Ok(session) => {
                if let Err(e) = self.credentials().set(session.clone()).await {
                    warn!("Refreshed session not persisted: {}", e);
                }
                info!("Session refreshed");
                self.emit(SessionEvent::Refreshed);
                Ok(session)
            }
            Err(e) => {
                self.expire().await;
                Err(e)
            }
        }
    }

    /// Return a session that is not about to expire, refreshing if needed.
    ///
    /// # Errors
    ///
    /// Same as [`refresh`](Self::refresh).
    pub async fn ensure_fresh(&self) -> AuthResult<Session> {
        match self.credentials().get() {
            Some(session) if !self.credentials().is_expired() => Ok(session),
            Some(session) => self.refresh_after(Some(&session.access_token)).await,
            None => Err(AuthError::SessionExpired),
        }
    }

    /// Load a persisted session and reconnect with it.
    ///
    /// Returns `Ok(None)` when nothing was stored. An expired stored session
    /// is refreshed first.
    ///
    /// # Errors
    ///
    /// Returns the refresh failure when the stored session cannot be renewed.
    pub async fn resume(&self) -> AuthResult<Option<Session>> {
        let restored = match self.credentials().restore().await {
            Ok(restored) => restored,
            Err(e) => {
                warn!("Stored session unreadable: {}", e);
                None
            }
        };
        let Some(session) = restored else {
            return Ok(None);
        };
        let session = if self.credentials().is_expired() {
            self.refresh_after(Some(&session.access_token)).await?
        } else {
            session
        };
        self.transport.open(&session.access_token);
        info!(user_id = %session.user_id, "Session resumed");
        Ok(Some(session))
    }

    /// End the session at the user's request.
    pub async fn sign_out(&self) {
        self.end_session().await;
        info!("Signed out");
        self.emit(SessionEvent::SignedOut);
    }

    async fn expire(&self) {
        self.end_session().await;
        warn!("Session expired; sign-in required");
        self.emit(SessionEvent::SessionExpired);
    }

    async fn end_session(&self) {
        if let Err(e) = self.credentials().clear().await {
            warn!("Failed to clear stored session: {}", e);
        }
        self.transport.close();
    }
}

fn login_error(e: ApiError) -> AuthError {
    match e {
        ApiError::Unauthorized | ApiError::Data(DataError::NotFound) => AuthError::InvalidCredentials,
        // Registering an existing phone number.
        ApiError::Data(DataError::Conflict) => AuthError::InvalidCredentials,
        ApiError::Server { status, .. } if status == 400 || status == 403 => {
            AuthError::InvalidCredentials
        }
        ApiError::Server { message, .. } => AuthError::ServerError(message),
        ApiError::Network(msg) => AuthError::NetworkError(msg),
        ApiError::Decode(msg) | ApiError::Invalid(msg) => AuthError::ServerError(msg),
        ApiError::Auth(inner) => inner,
    }
}

#[async_trait::async_trait]
impl TokenSource for SessionAuthenticator {
    async fn fresh_token(&self) -> Option<String> {
        self.ensure_fresh().await.ok().map(|s| s.access_token)
    }

    async fn token_rejected(&self, token: &str) -> Option<String> {
        self.refresh_after(Some(token)).await.ok().map(|s| s.access_token)
    }
}
