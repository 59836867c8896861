//! Conversation listing command

use chrono::{DateTime, Utc};
use prettytable::{row, Table};

use crate::api::types::Conversation;
use crate::config::Config;
use crate::error::Result;

/// Widest last-message preview shown in the table.
const PREVIEW_WIDTH: usize = 48;

/// Print the user's conversations, most recent first.
///
/// # Errors
///
/// Returns an error if there is no stored session or the listing fails.
pub async fn list_conversations(config: Config) -> Result<()> {
    let language = config.server.language.clone();
    let client = super::connect(config).await?;
    let conversations = client.load_conversations().await?;

    if conversations.is_empty() {
        println!("No conversations yet. Start one with `agrichat ask <question>`.");
        return Ok(());
    }
    output_conversations_table(&conversations, &language);
    Ok(())
}

fn output_conversations_table(conversations: &[Conversation], language: &str) {
    let mut table = Table::new();
    table.add_row(row!["Id", "Title", "Updated", "Last message"]);

    for conversation in conversations {
        table.add_row(row![
            conversation.id,
            conversation.title_for(language).unwrap_or("(untitled)"),
            format_updated(conversation.updated_at),
            preview(conversation.last_message.as_deref().unwrap_or(""))
        ]);
    }

    println!();
    table.printstd();
    println!();
}

fn format_updated(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M").to_string()
}

/// Single-line preview, truncated on a character boundary.
fn preview(text: &str) -> String {
    let line = text.lines().next().unwrap_or("");
    if line.chars().count() <= PREVIEW_WIDTH {
        return line.to_string();
    }
    let mut out: String = line.chars().take(PREVIEW_WIDTH - 1).collect();
    out.push('…');
    out
}
