//! Session lifecycle: credentials, authentication and refresh
//!
//! # Module Layout
//!
//! - [`credentials`]   -- in-memory mirror plus durable persistence of the
//!   current [`Session`]
//! - [`authenticator`] -- obtains sessions, refreshes them, and notifies
//!   dependents through [`SessionEvent`]
//!
//! A [`SessionContext`] is constructed once per process and threaded into
//! the REST client and transport factories; nothing in the crate reaches
//! session state through statics.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::collaborators::{DeviceIdentity, LocalizationProvider};
use crate::config::Config;

pub mod authenticator;
pub mod credentials;

pub use authenticator::{AuthApi, SessionAuthenticator};
pub use credentials::CredentialStore;

/// An authenticated session with the backend.
///
/// `expires_at` is persisted as epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Bearer token attached to REST calls and the streaming handshake.
    pub access_token: String,

    /// Token exchanged for a new access token when the current one expires.
    pub refresh_token: String,

    /// Server-side expiry of `access_token`.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub expires_at: DateTime<Utc>,

    /// Identifier of the signed-in user.
    pub user_id: String,
}

impl Session {
    /// Returns `true` when the access token expires within `skew` of now.
    ///
    /// # Examples
    ///
    /// ```
    /// use agrichat::session::Session;
    /// use chrono::{Duration, Utc};
    ///
    /// let session = Session {
    ///     access_token: "a".to_string(),
    ///     refresh_token: "r".to_string(),
    ///     expires_at: Utc::now() + Duration::seconds(30),
    ///     user_id: "u1".to_string(),
    /// };
    /// assert!(session.is_expired(Duration::seconds(60)));
    /// assert!(!session.is_expired(Duration::zero()));
    /// ```
    pub fn is_expired(&self, skew: Duration) -> bool {
        Utc::now() >= self.expires_at - skew
    }
}

/// Ways a user can obtain a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    /// Anonymous device session keyed by the device identifier.
    Device,

    /// Existing phone account.
    PhoneLogin {
        /// Phone number in international format.
        phone: String,
        /// Account password.
        password: String,
    },

    /// New phone account.
    PhoneRegister {
        /// Phone number in international format.
        phone: String,
        /// Chosen password.
        password: String,
        /// Display name.
        name: Option<String>,
    },
}

/// Notifications published to every dependent of the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A new session was obtained through `authenticate`.
    Authenticated {
        /// The signed-in user.
        user_id: String,
    },
    /// The access token was silently renewed.
    Refreshed,
    /// Renewal failed; the user must sign in again.
    SessionExpired,
    /// The user signed out explicitly.
    SignedOut,
}

/// Process-wide session context.
///
/// Holds the single [`CredentialStore`] together with configuration and the
/// platform collaborators. Cloning is cheap; every clone shares the same
/// credential store.
#[derive(Clone)]
pub struct SessionContext {
    /// Loaded configuration.
    pub config: Arc<Config>,
    /// The one credential store for this process.
    pub credentials: Arc<CredentialStore>,
    /// Source of the stable device identifier.
    pub device: Arc<dyn DeviceIdentity>,
    /// Source of the active language code.
    pub locale: Arc<dyn LocalizationProvider>,
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("config", &self.config)
            .field("credentials", &self.credentials)
            .finish_non_exhaustive()
    }
}

impl SessionContext {
    /// Bundle the context from its parts.
    pub fn new(
        config: Config,
        credentials: Arc<CredentialStore>,
        device: Arc<dyn DeviceIdentity>,
        locale: Arc<dyn LocalizationProvider>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            credentials,
            device,
            locale,
        }
    }
}
