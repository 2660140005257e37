//! Common types, enums, and error definitions for the collar protocol

use std::fmt;
use thiserror::Error;

/// Result type alias for collar operations
pub type Result<T> = std::result::Result<T, CollarError>;

/// Error types for collar communication
#[derive(Error, Debug)]
pub enum CollarError {
    #[error("Unknown command string: {0}")]
    UnknownCommand(String),

    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Field {0} has the wrong type")]
    MistypedField(&'static str),

    #[error("Encoding error: {0}")]
    EncodingError(String),

    #[error("Decoding error: {0}")]
    DecodingError(String),

    #[error("Transport write failed: {0}")]
    WriteFailed(String),

    #[error("Not connected to a peripheral")]
    NotConnected,
}

/// Commands the controller can issue to the collar peripheral
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Scan,
    Read,
    Info,
    Edit,
    Finish,
    Delete,
    DeleteAll,
}

impl CommandKind {
    /// Parse a wire command string
    pub fn from_wire(value: &str) -> Result<Self> {
        match value {
            "SCAN" => Ok(CommandKind::Scan),
            "READ" => Ok(CommandKind::Read),
            "INFO" => Ok(CommandKind::Info),
            "EDIT" => Ok(CommandKind::Edit),
            "FINISH" => Ok(CommandKind::Finish),
            "DELETE" => Ok(CommandKind::Delete),
            "DELETE_ALL" => Ok(CommandKind::DeleteAll),
            _ => Err(CollarError::UnknownCommand(value.to_string())),
        }
    }

    /// Wire string for this command
    pub fn as_str(self) -> &'static str {
        match self {
            CommandKind::Scan => "SCAN",
            CommandKind::Read => "READ",
            CommandKind::Info => "INFO",
            CommandKind::Edit => "EDIT",
            CommandKind::Finish => "FINISH",
            CommandKind::Delete => "DELETE",
            CommandKind::DeleteAll => "DELETE_ALL",
        }
    }

    /// Whether the peripheral answers this command with a response burst
    /// rather than a bare acknowledgment
    pub fn requires_response(self) -> bool {
        self == CommandKind::Scan
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
