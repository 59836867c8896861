//! Platform collaborators consumed by the session layer
//!
//! The core never reaches into platform services directly. It depends on
//! three narrow traits instead:
//!
//! - [`DeviceIdentity`] -- stable device identifier, used once when a device
//!   session is first created
//! - [`LocalizationProvider`] -- language code attached to generate and
//!   question requests
//! - [`AudioTranscriber`] -- speech-to-text over REST, separate from the
//!   streaming protocol

use std::path::PathBuf;
use std::sync::RwLock;

use bytes::Bytes;

use crate::api::ApiError;
use crate::error::{AgrichatError, Result};

/// Source of a stable identifier for this device.
pub trait DeviceIdentity: Send + Sync {
    /// The device identifier. Must return the same value across restarts.
    fn id(&self) -> Result<String>;
}

/// Source of the user's active language.
pub trait LocalizationProvider: Send + Sync {
    /// ISO 639-1 language code, e.g. `"en"` or `"hi"`.
    fn current_language_code(&self) -> String;
}

/// Speech-to-text service.
#[async_trait::async_trait]
pub trait AudioTranscriber: Send + Sync {
    /// Transcribe `audio` (encoded as `mime_type`) spoken in `language`.
    async fn transcribe(
        &self,
        audio: Bytes,
        mime_type: &str,
        language: &str,
    ) -> std::result::Result<String, ApiError>;
}

/// Device identifier persisted as a UUID in a small file.
///
/// The file is created on first use.
#[derive(Debug, Clone)]
pub struct FileDeviceIdentity {
    path: PathBuf,
}

impl FileDeviceIdentity {
    /// Store the identifier at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store the identifier under the platform data directory.
    ///
    /// # Errors
    ///
    /// Returns [`AgrichatError::Storage`] when no home directory exists.
    pub fn in_data_dir() -> Result<Self> {
        let dirs = directories::ProjectDirs::from("org", "agrichat", "agrichat").ok_or_else(|| {
            AgrichatError::Storage("could not determine a data directory".to_string())
        })?;
        Ok(Self::new(dirs.data_dir().join("device-id")))
    }
}

impl DeviceIdentity for FileDeviceIdentity {
    fn id(&self) -> Result<String> {
        match std::fs::read_to_string(&self.path) {
            Ok(existing) if !existing.trim().is_empty() => Ok(existing.trim().to_string()),
            Ok(_) => self.generate(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => self.generate(),
            Err(e) => Err(AgrichatError::Io(e).into()),
        }
    }
}

impl FileDeviceIdentity {
    fn generate(&self) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, &id)?;
        tracing::info!("Generated new device identifier");
        Ok(id)
    }
}

/// Device identifier fixed at construction.
#[derive(Debug, Clone)]
pub struct StaticDeviceIdentity(pub String);

impl DeviceIdentity for StaticDeviceIdentity {
    fn id(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}

/// Language provider backed by a settable value.
#[derive(Debug)]
pub struct StaticLocale {
    code: RwLock<String>,
}

impl StaticLocale {
    /// Start with `code` as the active language.
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: RwLock::new(code.into()),
        }
    }

    /// Switch the active language.
    pub fn set(&self, code: impl Into<String>) {
        *self.code.write().unwrap_or_else(|e| e.into_inner()) = code.into();
    }
}

impl LocalizationProvider for StaticLocale {
    fn current_language_code(&self) -> String {
        self.code.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}
