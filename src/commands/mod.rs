/*!
Command handlers for the CLI

This module provides command handlers invoked by the CLI entrypoint.

- `auth`          -- `login` and `logout`
- `conversations` -- list conversations
- `ask`           -- send a question and stream the answer

Each handler builds a [`ChatClient`] from the loaded configuration and
drops it on return, which stops the streaming connection.
*/

use crate::client::ChatClient;
use crate::config::Config;
use crate::error::{AgrichatError, AuthError, Result};

// Question streaming
pub mod ask;

// Conversation listing
pub mod conversations;

/// Build a client and resume the stored session.
///
/// # Errors
///
/// Returns [`AuthError::SessionExpired`] if no session is stored or it can
/// no longer be renewed.
pub async fn connect(config: Config) -> Result<ChatClient> {
    let client = ChatClient::from_config(config)?;
    match client.restore().await {
        Ok(Some(session)) => {
            tracing::debug!(user_id = %session.user_id, "Using stored session");
            Ok(client)
        }
        Ok(None) => Err(anyhow::Error::from(AgrichatError::Auth(AuthError::SessionExpired))
            .context("not signed in; run `agrichat login` first")),
        Err(e) => Err(anyhow::Error::from(AgrichatError::Auth(e))
            .context("stored session could not be renewed; run `agrichat login`")),
    }
}

// Sign-in and sign-out handlers
pub mod auth {
    //! Session commands.
    //!
    //! `login` exchanges credentials for a session and persists it through
    //! the configured credential backend; `logout` removes it.

    use super::*;
    use crate::session::Credentials;
    use colored::Colorize;

    /// Pick the credentials described by the `login` flags.
    ///
    /// # Errors
    ///
    /// Returns [`AgrichatError::Config`] unless either `--device` or a phone
    /// number with a password was given.
    pub fn credentials_from_args(
        device: bool,
        phone: Option<String>,
        password: Option<String>,
        register: bool,
        name: Option<String>,
    ) -> Result<Credentials> {
        match (device, phone, password) {
            (true, None, _) => Ok(Credentials::Device),
            (false, Some(phone), Some(password)) if register => Ok(Credentials::PhoneRegister {
                phone,
                password,
                name,
            }),
            (false, Some(phone), Some(password)) => Ok(Credentials::PhoneLogin { phone, password }),
            _ => Err(AgrichatError::Config(
                "login needs --device, or --phone together with --password".to_string(),
            )
            .into()),
        }
    }

    /// Sign in and store the session.
    ///
    /// # Errors
    ///
    /// Returns [`AgrichatError::Auth`] if the server rejects the credentials
    /// or cannot be reached.
    pub async fn login(config: Config, credentials: Credentials) -> Result<()> {
        let kind = match &credentials {
            Credentials::Device => "device",
            Credentials::PhoneLogin { .. } => "phone",
            Credentials::PhoneRegister { .. } => "new phone account",
        };
        tracing::info!("Signing in with {}", kind);

        let client = ChatClient::from_config(config)?;
        let session = client
            .authenticate(credentials)
            .await
            .map_err(AgrichatError::Auth)?;

        println!(
            "{} Signed in as {} (session valid until {})",
            "✓".green(),
            session.user_id.bold(),
            session.expires_at.format("%Y-%m-%d %H:%M UTC")
        );
        Ok(())
    }

    /// Forget the stored session.
    pub async fn logout(config: Config) -> Result<()> {
        let client = ChatClient::from_config(config)?;
        client.sign_out().await;
        println!("{} Signed out", "✓".green());
        Ok(())
    }

}
