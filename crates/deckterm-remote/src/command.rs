//! Commands remote clients send to the session.
//!
//! Each message is a JSON object whose `cmd` field selects the command:
//!
//! ```json
//! {"cmd": "command", "terminalcommand": "ls -la"}
//! {"cmd": "open", "path": "/home/me/projects"}
//! ```

use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "cmd")]
pub enum RemoteCommand {
    /// Run a line of shell input.
    #[serde(rename = "command")]
    Execute {
        #[serde(rename = "terminalcommand")]
        text: String,
    },
    /// Change the shell's working directory.
    #[serde(rename = "open")]
    ChangeDirectory { path: String },
}

/// Why a remote message was rejected.
#[derive(Debug)]
pub enum CommandError {
    /// Not JSON, or a known command with missing or mistyped fields.
    Malformed(String),
    /// A JSON object without a string `cmd` field.
    MissingTag,
    UnknownCommand(String),
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandError::Malformed(msg) => write!(f, "malformed command: {msg}"),
            CommandError::MissingTag => write!(f, "message has no \"cmd\" field"),
            CommandError::UnknownCommand(cmd) => write!(f, "unknown command: {cmd:?}"),
        }
    }
}

impl std::error::Error for CommandError {}

impl RemoteCommand {
    pub const TAGS: [&'static str; 2] = ["command", "open"];

    /// Parse one wire message.
    pub fn decode(message: &str) -> Result<Self, CommandError> {
        let value: Value =
            serde_json::from_str(message).map_err(|e| CommandError::Malformed(e.to_string()))?;

        let tag = match value.get("cmd") {
            Some(Value::String(tag)) => tag.clone(),
            _ => return Err(CommandError::MissingTag),
        };
        if !Self::TAGS.contains(&tag.as_str()) {
            return Err(CommandError::UnknownCommand(tag));
        }

        serde_json::from_value(value).map_err(|e| CommandError::Malformed(e.to_string()))
    }

    /// The bytes this command types into the shell.
    pub fn to_input(&self) -> String {
        match self {
            RemoteCommand::Execute { text } => format!("{text}\n"),
            RemoteCommand::ChangeDirectory { path } => format!("cd \"{}\"\n", quote_path(path)),
        }
    }
}

/// Escape the characters that are still special inside double quotes.
fn quote_path(path: &str) -> String {
    let mut quoted = String::with_capacity(path.len());
    for c in path.chars() {
        if matches!(c, '"' | '\\' | '$' | '`') {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted
}
