//! Error types.
//!
//! [`Error`] is what callers of [`Runner::run`](crate::Runner::run) see.
//! `ProcessNotFound` and `CommandFailed` are the conditions a caller is
//! expected to handle; `Protocol` means the engine broke its contract.

use crate::command::Command;
use crate::status::ExitStatus;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    ProcessNotFound(#[from] ProcessNotFoundError),

    /// The engine could not start the program for a reason other than it
    /// not existing (permission denied, missing working directory, ...).
    #[error("failed to start {program}: {message}")]
    Spawn { program: String, message: String },

    #[error(transparent)]
    CommandFailed(#[from] CommandFailureError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// Tag identifying an [`Error`] variant without matching on its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    ProcessNotFound,
    Spawn,
    CommandFailed,
    Protocol,
    Channel,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::ProcessNotFound => "process_not_found",
            Self::Spawn => "spawn",
            Self::CommandFailed => "command_failed",
            Self::Protocol => "protocol",
            Self::Channel => "channel",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::ProcessNotFound(_) => ErrorKind::ProcessNotFound,
            Self::Spawn { .. } => ErrorKind::Spawn,
            Self::CommandFailed(_) => ErrorKind::CommandFailed,
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::Channel(_) => ErrorKind::Channel,
        }
    }

    /// Contract violation between this crate and the engine. Not something
    /// to catch and carry on from.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Protocol(_))
    }

    pub fn as_command_failure(&self) -> Option<&CommandFailureError> {
        match self {
            Self::CommandFailed(e) => Some(e),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("argv must contain at least one element")]
    EmptyArgv,
}

/// The engine could not locate the executable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("process not found: {program}: {message}")]
pub struct ProcessNotFoundError {
    pub program: String,
    pub message: String,
}

/// A process ran and terminated unsuccessfully while `throw_on_failure` was on.
///
/// Only [`apply_failure_policy`](crate::policy::apply_failure_policy) builds these.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct CommandFailureError {
    message: String,
    command: Command,
    status: ExitStatus,
}

impl CommandFailureError {
    pub(crate) fn new(message: String, command: Command, status: ExitStatus) -> Self {
        Self {
            message,
            command,
            status,
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn command(&self) -> &Command {
        &self.command
    }

    pub fn status(&self) -> ExitStatus {
        self.status
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("protocol error: expected RunRes reply, got {0}")]
    UnexpectedReply(&'static str),

    /// The reply reached its caller but its body does not decode, e.g. an
    /// unknown `type` or `status` tag.
    #[error("protocol error: malformed reply: {0}")]
    Malformed(String),
}

/// Transport-level failures of the dispatch channel.
///
/// Cloneable so one failure can be delivered to every pending call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("engine channel closed")]
    Closed,

    #[error("engine channel I/O error: {0}")]
    Io(String),

    #[error("malformed engine reply: {0}")]
    Malformed(String),

    #[error("engine fault: {0}")]
    Engine(String),

    #[error("failed to launch engine: {0}")]
    Launch(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_match_variants() {
        assert_eq!(
            Error::from(ValidationError::EmptyArgv).kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            Error::from(ChannelError::Closed).kind(),
            ErrorKind::Channel
        );
        let not_found = Error::from(ProcessNotFoundError {
            program: "nope".to_string(),
            message: "No such file or directory".to_string(),
        });
        assert_eq!(not_found.kind(), ErrorKind::ProcessNotFound);
        assert_eq!(not_found.kind().to_string(), "process_not_found");
    }

    #[test]
    fn only_protocol_errors_are_fatal() {
        assert!(Error::from(ProtocolError::UnexpectedReply("Fault")).is_fatal());
        assert!(Error::from(ProtocolError::Malformed("unknown variant".to_string())).is_fatal());
        assert!(!Error::from(ChannelError::Malformed("bad frame".to_string())).is_fatal());
        assert!(!Error::from(ChannelError::Closed).is_fatal());
        assert!(!Error::from(ValidationError::EmptyArgv).is_fatal());
    }

    #[test]
    fn display_messages() {
        let err = Error::from(ProcessNotFoundError {
            program: "frobnicate".to_string(),
            message: "No such file or directory (os error 2)".to_string(),
        });
        assert_eq!(
            err.to_string(),
            "process not found: frobnicate: No such file or directory (os error 2)"
        );

        let err = Error::Spawn {
            program: "./script.sh".to_string(),
            message: "Permission denied".to_string(),
        };
        assert_eq!(err.to_string(), "failed to start ./script.sh: Permission denied");
    }
}
