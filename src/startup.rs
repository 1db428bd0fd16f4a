//! Binary entry logic.
//!
//! Builds the application context from configuration and runs one operator
//! command against the token store.

use std::sync::Arc;

use tracing::info;

use crate::config::ConfigV1;
use crate::state::AppContext;

pub const USAGE: &str = "usage: tokenkeeper [--schema | get | set <token> | clear | watch]";

/// An operator command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Print the stored token.
    Get,
    /// Store a new token.
    Set(String),
    /// Store the empty token (log out).
    Clear,
    /// Log every change until interrupted.
    Watch,
}

/// Parses the arguments following the program name. No arguments means `watch`.
pub fn parse_command(args: &[String]) -> Result<Command, String> {
    match args {
        [] => Ok(Command::Watch),
        [cmd] if cmd == "watch" => Ok(Command::Watch),
        [cmd] if cmd == "get" => Ok(Command::Get),
        [cmd] if cmd == "clear" => Ok(Command::Clear),
        [cmd, rest @ ..] if cmd == "set" && !rest.is_empty() => Ok(Command::Set(rest.join(" "))),
        [cmd] if cmd == "set" => Err("set needs a token".to_string()),
        other => Err(format!("unknown command: {}", other.join(" "))),
    }
}

/// Runs `command` against the configured token store.
///
/// # Errors
///
/// Returns an error if waiting for Ctrl-C fails while watching.
pub async fn run(
    config: Arc<ConfigV1>,
    command: Command,
) -> Result<(), Box<dyn std::error::Error>> {
    let context = AppContext::new(config);
    let store = &context.auth_header;

    match command {
        Command::Get => {
            println!("{}", store.get());
        }
        Command::Set(token) => {
            store.set(token);
            info!(key = store.key(), "Token stored");
        }
        Command::Clear => {
            store.set(String::new());
            info!(key = store.key(), "Token cleared");
        }
        Command::Watch => {
            info!(
                key = store.key(),
                syncing = store.is_syncing(),
                "Watching token, press Ctrl-C to stop"
            );
            let subscription = store.subscribe(|token: &String| {
                if token.is_empty() {
                    info!(event_name = "token.changed", logged_in = false, "Token is empty");
                } else {
                    info!(
                        event_name = "token.changed",
                        logged_in = true,
                        length = token.len(),
                        "Token is set"
                    );
                }
            });
            tokio::signal::ctrl_c().await?;
            subscription.unsubscribe();
        }
    }

    context.shutdown();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_command() {
        assert_eq!(parse_command(&args(&[])), Ok(Command::Watch));
        assert_eq!(parse_command(&args(&["get"])), Ok(Command::Get));
        assert_eq!(parse_command(&args(&["clear"])), Ok(Command::Clear));
        assert_eq!(
            parse_command(&args(&["set", "Bearer", "abc123"])),
            Ok(Command::Set("Bearer abc123".to_string()))
        );
        assert!(parse_command(&args(&["set"])).is_err());
        assert!(parse_command(&args(&["rm", "-rf"])).is_err());
    }
}
