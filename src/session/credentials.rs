//! Credential store: in-memory session mirror with durable persistence
//!
//! [`CredentialStore`] is the single source of the bearer token for both the
//! REST client and the streaming transport. Writes follow a
//! set-in-memory-then-flush order: the mirror is updated synchronously, so a
//! request issued immediately after authentication already sees the new
//! token, and the durable backend is written afterwards.
//!
//! Backends:
//!
//! - [`KeyringPersistence`] -- OS native keyring (Keychain, Secret Service,
//!   Windows Credential Manager)
//! - [`FilePersistence`] -- JSON file, used when no keyring is available
//! - [`MemoryPersistence`] -- process-local, for tests and embedding

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use chrono::Duration;

use crate::error::{AgrichatError, Result};
use crate::session::Session;

// ---------------------------------------------------------------------------
// Persistence backends
// ---------------------------------------------------------------------------

/// Durable storage for the current session.
///
/// Implementations are synchronous; [`CredentialStore`] moves the calls onto
/// the blocking pool.
pub trait CredentialPersistence: Send + Sync + std::fmt::Debug {
    /// Load the persisted session, `Ok(None)` when nothing is stored.
    fn load(&self) -> Result<Option<Session>>;

    /// Persist `session`, replacing any previous value.
    fn save(&self, session: &Session) -> Result<()>;

    /// Remove the persisted session. Removing nothing is not an error.
    fn clear(&self) -> Result<()>;
}

/// Session persistence through the OS keyring.
#[derive(Debug, Clone)]
pub struct KeyringPersistence {
    service: String,
    account: String,
}

impl KeyringPersistence {
    /// Create a keyring accessor for the given account name.
    ///
    /// The service name is prefixed with `agrichat-` to avoid collisions
    /// with other applications sharing the keyring.
    pub fn new(account: impl Into<String>) -> Self {
        let account = account.into();
        Self {
            service: format!("agrichat-{}", account),
            account,
        }
    }

    fn entry(&self) -> Result<keyring::Entry> {
        keyring::Entry::new(&self.service, &self.account)
            .map_err(|e| AgrichatError::Keyring(e).into())
    }
}

impl Default for KeyringPersistence {
    fn default() -> Self {
        Self::new("session")
    }
}

impl CredentialPersistence for KeyringPersistence {
    fn load(&self) -> Result<Option<Session>> {
        match self.entry()?.get_password() {
            Ok(json_str) => Ok(Some(serde_json::from_str(&json_str)?)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(AgrichatError::Keyring(e).into()),
        }
    }

    fn save(&self, session: &Session) -> Result<()> {
        let json_str = serde_json::to_string(session)?;
        self.entry()?
            .set_password(&json_str)
            .map_err(AgrichatError::Keyring)?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        match self.entry()?.delete_password() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(AgrichatError::Keyring(e).into()),
        }
    }
}

/// Session persistence as a JSON file.
///
/// Writes go to a sibling temporary file that is then renamed over the
/// target, so a crash mid-write leaves either the old or the new session.
#[derive(Debug, Clone)]
pub struct FilePersistence {
    path: PathBuf,
}

impl FilePersistence {
    /// Persist to an explicit file path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Persist to `session.json` under the platform data directory.
    ///
    /// # Errors
    ///
    /// Returns [`AgrichatError::Storage`] when no home directory can be
    /// determined.
    pub fn in_data_dir() -> Result<Self> {
        let dirs = directories::ProjectDirs::from("org", "agrichat", "agrichat").ok_or_else(|| {
            AgrichatError::Storage("could not determine a data directory".to_string())
        })?;
        Ok(Self::new(dirs.data_dir().join("session.json")))
    }

    /// The file this backend writes to.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CredentialPersistence for FilePersistence {
    fn load(&self) -> Result<Option<Session>> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => Ok(Some(serde_json::from_str(&contents)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(AgrichatError::Io(e).into()),
        }
    }

    fn save(&self, session: &Session) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec(session)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AgrichatError::Io(e).into()),
        }
    }
}

/// Process-local persistence.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    slot: Mutex<Option<Session>>,
}

impl CredentialPersistence for MemoryPersistence {
    fn load(&self) -> Result<Option<Session>> {
        Ok(self.slot.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    fn save(&self, session: &Session) -> Result<()> {
        *self.slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(session.clone());
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        *self.slot.lock().unwrap_or_else(|e| e.into_inner()) = None;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// CredentialStore
// ---------------------------------------------------------------------------

/// Holder of the current session.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use agrichat::session::credentials::{CredentialStore, MemoryPersistence};
///
/// let store = CredentialStore::new(Arc::new(MemoryPersistence::default()));
/// assert!(store.get().is_none());
/// assert!(store.is_expired());
/// ```
#[derive(Debug)]
pub struct CredentialStore {
    mirror: RwLock<Option<Session>>,
    persistence: Arc<dyn CredentialPersistence>,
    skew: Duration,
}

impl CredentialStore {
    /// Create a store with the default 60-second refresh skew.
    pub fn new(persistence: Arc<dyn CredentialPersistence>) -> Self {
        Self::with_skew(persistence, Duration::seconds(60))
    }

    /// Create a store whose `is_expired` fires `skew` before server expiry.
    pub fn with_skew(persistence: Arc<dyn CredentialPersistence>, skew: Duration) -> Self {
        Self {
            mirror: RwLock::new(None),
            persistence,
            skew,
        }
    }

    /// The current session, if any.
    pub fn get(&self) -> Option<Session> {
        self.mirror.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// The current access token, if any.
    pub fn access_token(&self) -> Option<String> {
        self.mirror
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|s| s.access_token.clone())
    }

    /// Replace the current session.
    ///
    /// The mirror is updated before this future first yields; the durable
    /// write happens afterwards.
    ///
    /// # Errors
    ///
    /// Returns the backend error if persistence fails. The in-memory session
    /// remains set in that case; the next process start will require
    /// re-login.
    pub async fn set(&self, session: Session) -> Result<()> {
        *self.mirror.write().unwrap_or_else(|e| e.into_inner()) = Some(session.clone());

        let persistence = Arc::clone(&self.persistence);
        let outcome = tokio::task::spawn_blocking(move || persistence.save(&session))
            .await
            .map_err(|e| AgrichatError::Storage(format!("persistence task failed: {}", e)))?;
        if let Err(ref e) = outcome {
            tracing::warn!("Failed to persist session: {}", e);
        }
        outcome
    }

    /// Forget the current session, in memory and on disk.
    ///
    /// # Errors
    ///
    /// Returns the backend error if the durable copy cannot be removed.
    pub async fn clear(&self) -> Result<()> {
        *self.mirror.write().unwrap_or_else(|e| e.into_inner()) = None;

        let persistence = Arc::clone(&self.persistence);
        tokio::task::spawn_blocking(move || persistence.clear())
            .await
            .map_err(|e| AgrichatError::Storage(format!("persistence task failed: {}", e)))?
    }

    /// Load the persisted session into the mirror.
    ///
    /// Returns the restored session, if one was stored.
    ///
    /// # Errors
    ///
    /// Returns the backend error if the stored value cannot be read.
    pub async fn restore(&self) -> Result<Option<Session>> {
        let persistence = Arc::clone(&self.persistence);
        let loaded = tokio::task::spawn_blocking(move || persistence.load())
            .await
            .map_err(|e| AgrichatError::Storage(format!("persistence task failed: {}", e)))??;
        *self.mirror.write().unwrap_or_else(|e| e.into_inner()) = loaded.clone();
        Ok(loaded)
    }

    /// `true` when there is no session or its token is within the refresh
    /// skew of expiry.
    pub fn is_expired(&self) -> bool {
        self.mirror
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map_or(true, |s| s.is_expired(self.skew))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
