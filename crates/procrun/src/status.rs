//! Exit status and reply decoding.

use serde::{Serialize, Serializer};

use crate::bridge::protocol::{EngineReply, RunResponse};
use crate::error::ProtocolError;

/// Whether the engine can observe signal-based termination on this platform.
///
/// When false, [`ExitStatus::ExitedWithSignal`] is never produced: the
/// platform has no signals, so every process reports an exit code.
pub const SIGNALS_SUPPORTED: bool = cfg!(unix);

/// How a process terminated. Exactly one of code/signal is present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExitStatus {
    ExitedWithCode { code: i32 },
    ExitedWithSignal { signal: i32 },
}

impl ExitStatus {
    /// True only for exit code 0.
    pub fn success(&self) -> bool {
        matches!(self, Self::ExitedWithCode { code: 0 })
    }

    pub fn code(&self) -> Option<i32> {
        match self {
            Self::ExitedWithCode { code } => Some(*code),
            Self::ExitedWithSignal { .. } => None,
        }
    }

    pub fn signal(&self) -> Option<i32> {
        match self {
            Self::ExitedWithCode { .. } => None,
            Self::ExitedWithSignal { signal } => Some(*signal),
        }
    }
}

impl std::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ExitedWithCode { code } => write!(f, "exit code {}", code),
            Self::ExitedWithSignal { signal } => write!(f, "killed with signal {}", signal),
        }
    }
}

/// Flat `{success, code, signal}` view; the absent one of code/signal is skipped.
#[derive(Serialize)]
struct StatusView {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    signal: Option<i32>,
}

impl Serialize for ExitStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        StatusView {
            success: self.success(),
            code: self.code(),
            signal: self.signal(),
        }
        .serialize(serializer)
    }
}

impl From<RunResponse> for ExitStatus {
    fn from(response: RunResponse) -> Self {
        match response {
            RunResponse::ExitedWithCode { exit_code } => Self::ExitedWithCode { code: exit_code },
            RunResponse::ExitedWithSignal { exit_signal } => {
                Self::ExitedWithSignal {
                    signal: exit_signal,
                }
            }
        }
    }
}

/// Decode the reply to a `Run` request.
///
/// Anything other than `RunRes` means the engine and this crate disagree
/// about the protocol.
pub fn decode_run_reply(reply: EngineReply) -> Result<ExitStatus, ProtocolError> {
    match reply {
        EngineReply::RunRes(response) => Ok(response.into()),
        other @ (EngineReply::SpawnFailed { .. }
        | EngineReply::Fault { .. }
        | EngineReply::ShuttingDown) => {
            tracing::error!(reply = other.kind(), "Engine answered Run with the wrong reply type");
            Err(ProtocolError::UnexpectedReply(other.kind()))
        }
    }
}
