use serde::Serialize;
use thiserror::Error;

use crate::resolver::Intent;

/// Structured error type for the whole pipeline. Serializes as
/// `{ "code": ..., "detail": ... }` so protocol peers and scripts can match on
/// error codes instead of parsing messages.
#[derive(Debug, Clone, Serialize, Error)]
#[serde(tag = "code", content = "detail")]
pub enum AppError {
    #[error("Unknown command: {identifier}")]
    UnknownCommand { identifier: String },
    #[error("Command already registered: {identifier}")]
    DuplicateCommand { identifier: String },
    #[error("Missing required parameter \"{name}\"")]
    MissingParameter { name: String },
    #[error("Invalid parameter \"{name}\": {reason}")]
    InvalidParameter { name: String, reason: String },
    #[error("No command matches \"{text}\"")]
    NoMatch { text: String },
    #[error("Ambiguous input, could mean: {}", candidate_list(.candidates))]
    AmbiguousInput { candidates: Vec<Intent> },

    #[error("{command} (#{sequence}) failed: {cause}")]
    CommandExecution {
        command: String,
        sequence: u64,
        cause: Box<AppError>,
    },
    #[error("Editing session unavailable: {message}")]
    SessionUnavailable { message: String },
    #[error("Timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("Cancelled before any change was made")]
    Cancelled,
    #[error("Nothing to undo")]
    NothingToUndo,
    #[error("{command} (#{sequence}) cannot be undone")]
    UndoNotSupported { command: String, sequence: u64 },

    #[error("Session has not finished capability negotiation")]
    ProtocolNotReady,
    #[error("Session is closed")]
    SessionClosed,
    #[error("Capability \"{capability}\" was not negotiated")]
    CapabilityNotNegotiated { capability: String },
    #[error("Malformed message: {message}")]
    MalformedMessage { message: String },
    #[error("Transport failure: {message}")]
    Transport { message: String },

    #[error("{message}")]
    Validation { message: String },
    #[error("{what} not found")]
    NotFound { what: String },
    #[error("Configuration error: {message}")]
    Config { message: String },
    #[error("I/O error: {message}")]
    Io { message: String },
    #[error("Interpreter error: {message}")]
    Interpreter { message: String },
}

fn candidate_list(candidates: &[Intent]) -> String {
    candidates
        .iter()
        .map(|c| format!("{} ({:.2})", c.command, c.confidence))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Coarse error taxonomy. Decides how a surface reacts: input errors are
/// reported and the session continues, fatal errors tear the session down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorClass {
    Input,
    Execution,
    Protocol,
    Fatal,
    Config,
}

impl AppError {
    pub fn class(&self) -> ErrorClass {
        match self {
            AppError::UnknownCommand { .. }
            | AppError::DuplicateCommand { .. }
            | AppError::MissingParameter { .. }
            | AppError::InvalidParameter { .. }
            | AppError::NoMatch { .. }
            | AppError::AmbiguousInput { .. }
            | AppError::NothingToUndo
            | AppError::UndoNotSupported { .. } => ErrorClass::Input,
            AppError::CommandExecution { .. }
            | AppError::SessionUnavailable { .. }
            | AppError::Timeout { .. }
            | AppError::Cancelled
            | AppError::Validation { .. }
            | AppError::NotFound { .. } => ErrorClass::Execution,
            AppError::ProtocolNotReady
            | AppError::SessionClosed
            | AppError::CapabilityNotNegotiated { .. }
            | AppError::MalformedMessage { .. } => ErrorClass::Protocol,
            AppError::Transport { .. } => ErrorClass::Fatal,
            AppError::Config { .. } | AppError::Io { .. } | AppError::Interpreter { .. } => {
                ErrorClass::Config
            }
        }
    }

    /// Process exit code for the command-line surface.
    pub fn exit_code(&self) -> i32 {
        match self.class() {
            ErrorClass::Input => 2,
            ErrorClass::Execution => 3,
            ErrorClass::Protocol | ErrorClass::Fatal => 4,
            ErrorClass::Config => 1,
        }
    }

    pub fn invalid(name: &str, reason: impl Into<String>) -> Self {
        AppError::InvalidParameter {
            name: name.to_string(),
            reason: reason.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        AppError::Validation {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for AppError {
    fn from(e: std::io::Error) -> Self {
        AppError::Io {
            message: e.to_string(),
        }
    }
}

impl From<crate::project::ProjectError> for AppError {
    fn from(e: crate::project::ProjectError) -> Self {
        match e {
            crate::project::ProjectError::Io(io_err) => AppError::Io {
                message: io_err.to_string(),
            },
            crate::project::ProjectError::Json(json_err) => AppError::Validation {
                message: json_err.to_string(),
            },
            crate::project::ProjectError::InvalidProject(msg) => AppError::Validation { message: msg },
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_code_and_detail() {
        let err = AppError::MissingParameter {
            name: "position".into(),
        };
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["code"], "MissingParameter");
        assert_eq!(json["detail"]["name"], "position");
    }

    #[test]
    fn unit_variants_serialize_without_detail() {
        let json = serde_json::to_value(AppError::NothingToUndo).unwrap();
        assert_eq!(json["code"], "NothingToUndo");
    }

    #[test]
    fn classes_map_to_exit_codes() {
        assert_eq!(
            AppError::NoMatch { text: "x".into() }.exit_code(),
            2
        );
        let wrapped = AppError::CommandExecution {
            command: "cut-clip".into(),
            sequence: 4,
            cause: Box::new(AppError::SessionUnavailable {
                message: "offline".into(),
            }),
        };
        assert_eq!(wrapped.class(), ErrorClass::Execution);
        assert_eq!(wrapped.exit_code(), 3);
        assert_eq!(AppError::ProtocolNotReady.exit_code(), 4);
        assert_eq!(
            AppError::Config {
                message: "bad".into()
            }
            .exit_code(),
            1
        );
    }

    #[test]
    fn execution_error_names_command_and_cause() {
        let err = AppError::CommandExecution {
            command: "cut-clip".into(),
            sequence: 7,
            cause: Box::new(AppError::validation("no clip under the playhead")),
        };
        assert_eq!(
            err.to_string(),
            "cut-clip (#7) failed: no clip under the playhead"
        );
    }

    #[test]
    fn ambiguous_message_lists_candidates() {
        let err = AppError::AmbiguousInput {
            candidates: vec![
                Intent::new("delete-clip", 0.81),
                Intent::new("add-marker", 0.79),
            ],
        };
        assert_eq!(
            err.to_string(),
            "Ambiguous input, could mean: delete-clip (0.81), add-marker (0.79)"
        );
    }
}
