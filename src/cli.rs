//! Command-line interface definition for Agrichat
//!
//! This module defines the CLI structure using clap's derive API,
//! providing commands for signing in, listing conversations and asking
//! the assistant a question.

use clap::{ArgGroup, Parser, Subcommand};

/// Agrichat - AI agricultural assistant chat client
///
/// Sign in once, then ask questions about crops, livestock and weather
/// and watch the answer stream in.
#[derive(Parser, Debug, Clone)]
#[command(name = "agrichat")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/agrichat.yaml")]
    pub config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Override the REST API base URL
    #[arg(long)]
    pub api_base: Option<String>,

    /// Language code for questions and answers (e.g. en, hi, sw)
    #[arg(short, long)]
    pub language: Option<String>,

    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for Agrichat
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Sign in and store the session
    #[command(group(ArgGroup::new("method").required(true).args(["device", "phone"])))]
    Login {
        /// Sign in with this device's identity
        #[arg(long, conflicts_with = "phone")]
        device: bool,

        /// Phone number to sign in with
        #[arg(long, requires = "password")]
        phone: Option<String>,

        /// Password for the phone account
        #[arg(long)]
        password: Option<String>,

        /// Create the phone account instead of signing in
        #[arg(long, requires = "phone")]
        register: bool,

        /// Display name for a new account
        #[arg(long, requires = "register")]
        name: Option<String>,
    },

    /// Sign out and forget the stored session
    Logout,

    /// List conversations, most recent first
    Conversations,

    /// Ask a question and stream the answer
    Ask {
        /// Conversation to continue; a new one is created when omitted
        #[arg(short = 'C', long)]
        conversation: Option<String>,

        /// The question
        #[arg(required = true, num_args = 1..)]
        text: Vec<String>,
    },
}

impl Cli {
    /// Parse command line arguments
    ///
    /// # Returns
    ///
    /// Returns the parsed CLI structure
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_device_login() {
        let cli = Cli::try_parse_from(["agrichat", "login", "--device"]).unwrap();
        assert_eq!(cli.config, Some("config/agrichat.yaml".to_string()));
        assert!(matches!(
            cli.command,
            Commands::Login {
                device: true,
                phone: None,
                ..
            }
        ));
    }

    #[test]
    fn test_cli_parse_phone_login() {
        let cli = Cli::try_parse_from([
            "agrichat",
            "login",
            "--phone",
            "+254700000000",
            "--password",
            "secret",
        ])
        .unwrap();
        if let Commands::Login {
            phone,
            password,
            register,
            ..
        } = cli.command
        {
            assert_eq!(phone.as_deref(), Some("+254700000000"));
            assert_eq!(password.as_deref(), Some("secret"));
            assert!(!register);
        } else {
            panic!("Expected Login command");
        }
    }

    #[test]
    fn test_cli_phone_requires_password() {
        assert!(Cli::try_parse_from(["agrichat", "login", "--phone", "+254700000000"]).is_err());
    }

    #[test]
    fn test_cli_login_requires_a_method() {
        assert!(Cli::try_parse_from(["agrichat", "login"]).is_err());
        assert!(Cli::try_parse_from(["agrichat", "login", "--password", "x"]).is_err());
    }

    #[test]
    fn test_cli_device_conflicts_with_phone() {
        let result = Cli::try_parse_from([
            "agrichat",
            "login",
            "--device",
            "--phone",
            "1",
            "--password",
            "x",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_parse_ask_joins_words() {
        let cli = Cli::try_parse_from([
            "agrichat",
            "--language",
            "hi",
            "ask",
            "-C",
            "c1",
            "how",
            "to",
            "treat",
            "rust",
        ])
        .unwrap();
        assert_eq!(cli.language.as_deref(), Some("hi"));
        if let Commands::Ask { conversation, text } = cli.command {
            assert_eq!(conversation.as_deref(), Some("c1"));
            assert_eq!(text.join(" "), "how to treat rust");
        } else {
            panic!("Expected Ask command");
        }
    }

    #[test]
    fn test_cli_ask_requires_text() {
        assert!(Cli::try_parse_from(["agrichat", "ask"]).is_err());
    }

    #[test]
    fn test_cli_parse_verbose_logout() {
        let cli = Cli::try_parse_from(["agrichat", "-v", "logout"]).unwrap();
        assert!(cli.verbose);
        assert!(matches!(cli.command, Commands::Logout));
    }
}
