//! Parsing for lines typed at the client prompt.
//!
//! Anything not starting with `/` is chat text. Commands are
//! case-insensitive; `//` escapes a message that really starts with a slash.

use anyhow::{Result, anyhow};

#[derive(Debug, PartialEq, Eq)]
pub enum InputCommand {
    Say(String),
    Peers,
    Help,
    Quit,
    Empty,
}

pub const HELP: &str = "commands: /peers lists known peers, /help shows this text, /quit leaves the chat";

impl InputCommand {
    pub fn parse(line: &str) -> Result<Self> {
        let text = line.trim_end_matches(['\r', '\n']);
        if text.trim().is_empty() {
            return Ok(InputCommand::Empty);
        }

        if let Some(escaped) = text.strip_prefix("//") {
            return Ok(InputCommand::Say(format!("/{escaped}")));
        }

        let Some(command) = text.trim().strip_prefix('/') else {
            return Ok(InputCommand::Say(text.to_string()));
        };

        match command.to_ascii_lowercase().as_str() {
            "quit" | "exit" | "q" => Ok(InputCommand::Quit),
            "peers" | "who" => Ok(InputCommand::Peers),
            "help" | "h" | "?" => Ok(InputCommand::Help),
            other => Err(anyhow!("unknown command '/{other}'. {HELP}")),
        }
    }
}
