//! Agrichat - AI agricultural assistant chat client
//!
#![doc = "Agrichat - AI agricultural assistant chat client"]
#![doc = "Main entry point for the agrichat command-line client."]

use anyhow::Result;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use agrichat::cli::{Cli, Commands};
use agrichat::commands;
use agrichat::config::{Config, LoggingConfig};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let cli = Cli::parse_args();

    // Load configuration; warnings go through a stderr subscriber until the
    // configured one is installed
    let config_path = cli.config.as_deref().unwrap_or("config/agrichat.yaml");
    let config = tracing::subscriber::with_default(bootstrap_subscriber(cli.verbose), || {
        Config::load(config_path, &cli)
    })?;

    // Initialize tracing
    init_tracing(&config.logging);

    // Validate configuration
    config.validate()?;

    // Execute command
    match cli.command {
        Commands::Login {
            device,
            phone,
            password,
            register,
            name,
        } => {
            let credentials =
                commands::auth::credentials_from_args(device, phone, password, register, name)?;
            commands::auth::login(config, credentials).await?;
            Ok(())
        }
        Commands::Logout => {
            commands::auth::logout(config).await?;
            Ok(())
        }
        Commands::Conversations => {
            tracing::info!("Listing conversations");
            commands::conversations::list_conversations(config).await?;
            Ok(())
        }
        Commands::Ask { conversation, text } => {
            let question = text.join(" ");
            if let Some(id) = &conversation {
                tracing::debug!("Continuing conversation: {}", id);
            }
            commands::ask::run_ask(config, conversation, question).await?;
            Ok(())
        }
    }
}

/// Subscriber used while the configuration is being loaded
fn bootstrap_subscriber(verbose: bool) -> impl tracing::Subscriber + Send + Sync {
    let default_level = if verbose { "agrichat=debug" } else { "agrichat=info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
}

/// Initialize tracing subscriber with environment filter
///
/// `RUST_LOG` takes precedence over the configured level.
fn init_tracing(logging: &LoggingConfig) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let registry = tracing_subscriber::registry().with(env_filter);
    if logging.json_format {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}
