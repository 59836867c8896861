use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::{json, Value};
use tempfile::TempDir;
use wiremock::ResponseTemplate;

use agrichat::collaborators::{StaticDeviceIdentity, StaticLocale};
use agrichat::config::Config;
use agrichat::session::credentials::MemoryPersistence;
use agrichat::session::{CredentialStore, Session, SessionContext};

#[allow(dead_code)]
pub fn temp_config_file(contents: &str) -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().expect("failed to create tempdir");
    let config_path = temp_dir.path().join("agrichat.yaml");
    fs::write(&config_path, contents).expect("failed to write config file");
    (temp_dir, config_path)
}

/// Context pointed at `api_base` with an in-memory credential store.
#[allow(dead_code)]
pub fn make_context(api_base: &str, language: &str) -> SessionContext {
    let mut config = Config::default();
    config.server.api_base = api_base.to_string();
    SessionContext::new(
        config,
        Arc::new(CredentialStore::new(Arc::new(MemoryPersistence::default()))),
        Arc::new(StaticDeviceIdentity("device-test".to_string())),
        Arc::new(StaticLocale::new(language)),
    )
}

#[allow(dead_code)]
pub fn session(token: &str) -> Session {
    Session {
        access_token: token.to_string(),
        refresh_token: format!("{}-refresh", token),
        expires_at: Utc::now() + Duration::hours(1),
        user_id: "farmer-1".to_string(),
    }
}

/// `200` with a successful envelope around `data`.
#[allow(dead_code)]
pub fn ok(data: Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({ "success": true, "data": data }))
}
