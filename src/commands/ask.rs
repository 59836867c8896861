//! Ask command
//!
//! Sends one question and prints the answer while it streams. Ctrl-C asks
//! the server to stop; a second Ctrl-C exits immediately.

use std::io::Write;
use std::time::Duration;

use colored::Colorize;
use tokio::sync::broadcast;

use crate::api::types::NewConversation;
use crate::client::ChatClient;
use crate::config::Config;
use crate::error::{AgrichatError, Result, TransportError};
use crate::generation::GenerationEvent;
use crate::transport::ConnectionState;

/// Length of the title given to a conversation created for a question.
const TITLE_CHARS: usize = 60;

/// Ask `question`, continuing `conversation` or starting a new one.
///
/// # Errors
///
/// Returns an error if there is no stored session, the streaming channel
/// does not connect in time, or the answer fails.
pub async fn run_ask(config: Config, conversation: Option<String>, question: String) -> Result<()> {
    let connect_timeout = Duration::from_secs(config.transport.connect_timeout_seconds);
    let client = super::connect(config).await?;

    let conversation_id = match conversation {
        Some(id) => id,
        None => {
            let new = NewConversation {
                title: Some(question.chars().take(TITLE_CHARS).collect()),
                tags: Vec::new(),
            };
            let created = client.create_conversation(&new).await?;
            tracing::info!(conversation_id = %created.id, "Created conversation");
            created.id
        }
    };

    wait_until_connected(&client, connect_timeout).await?;
    let mut events = client.generation_events();
    client.open_conversation(&conversation_id).await?;
    client.send_message(&conversation_id, &question).await?;

    stream_answer(&client, &conversation_id, &mut events).await
}

async fn wait_until_connected(client: &ChatClient, limit: Duration) -> Result<()> {
    let mut state = client.subscribe_connection();
    // Drop the watch guard before `state` goes out of scope.
    let connected = tokio::time::timeout(limit, state.wait_for(|s| *s == ConnectionState::Connected))
        .await
        .map(|outcome| outcome.is_ok())
        .unwrap_or(false);
    if connected {
        Ok(())
    } else {
        Err(anyhow::Error::from(AgrichatError::Transport(TransportError::NotConnected))
            .context("streaming channel did not connect"))
    }
}

async fn stream_answer(
    client: &ChatClient,
    conversation_id: &str,
    events: &mut broadcast::Receiver<GenerationEvent>,
) -> Result<()> {
    let mut stdout = std::io::stdout();
    let mut stop_requested = false;

    loop {
        let event = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                if stop_requested {
                    println!();
                    return Ok(());
                }
                stop_requested = true;
                eprintln!("\n{}", "Stopping...".yellow());
                client.stop_generation(conversation_id);
                continue;
            }
            event = events.recv() => event,
        };

        let event = match event {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!("Missed {} streaming events", n);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return Ok(()),
        };
        if event.conversation_id() != conversation_id {
            continue;
        }

        match event {
            GenerationEvent::Started { .. } => {}
            GenerationEvent::Delta { chunk, .. } => {
                print!("{}", chunk);
                stdout.flush()?;
            }
            GenerationEvent::Completed {
                follow_up_questions,
                ..
            } => {
                println!();
                if !follow_up_questions.is_empty() {
                    println!("\n{}", "You could also ask:".cyan());
                    for question in follow_up_questions {
                        println!("  • {}", question);
                    }
                }
                return Ok(());
            }
            GenerationEvent::Stopped { .. } => {
                println!("\n{}", "[stopped]".yellow());
                return Ok(());
            }
            GenerationEvent::Failed { error, .. } => {
                println!();
                return Err(AgrichatError::Generation(error).into());
            }
            GenerationEvent::Detached { .. } => return Ok(()),
        }
    }
}
