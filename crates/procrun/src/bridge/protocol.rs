//! Wire protocol types for caller-engine communication.
//!
//! Every message travels inside a [`Frame`] whose `id` correlates a reply
//! with the request that caused it. Requests and replies are tagged unions
//! discriminated by `type`.

use serde::{Deserialize, Serialize};

use crate::command::Command;

/// Unique identifier for one in-flight request.
///
/// UUID v4 so that ids never repeat across channels or engine restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(uuid::Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        let uuid = uuid::Uuid::parse_str(s)?;
        Ok(Self(uuid))
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Correlation envelope around every request and reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame<T> {
    pub id: RequestId,
    pub body: T,
}

/// Messages from caller to engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EngineRequest {
    /// Launch a process and report how it terminated.
    Run(RunRequest),

    /// Stop accepting requests, finish in-flight runs, then exit.
    Shutdown,
}

impl EngineRequest {
    pub fn run(command: &Command) -> Self {
        Self::Run(RunRequest::from(command))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Run(_) => "Run",
            Self::Shutdown => "Shutdown",
        }
    }

    /// Executable named by a `Run` request.
    pub fn program(&self) -> Option<&str> {
        match self {
            Self::Run(run) => run.argv.first().map(String::as_str),
            Self::Shutdown => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRequest {
    pub argv: Vec<String>,
    /// Absent means "inherit the engine's working directory"; never `""`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,
}

impl From<&Command> for RunRequest {
    fn from(command: &Command) -> Self {
        Self {
            argv: command.argv().to_vec(),
            dir: command.dir().map(str::to_owned),
        }
    }
}

/// Messages from engine to caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EngineReply {
    /// The process ran and terminated.
    RunRes(RunResponse),

    /// The process could not be started at all.
    SpawnFailed {
        kind: SpawnFailureKind,
        message: String,
    },

    /// Engine-side failure unrelated to the launched program.
    Fault { message: String },

    /// Acknowledges `Shutdown`; sent after every in-flight reply.
    ShuttingDown,
}

impl EngineReply {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RunRes(_) => "RunRes",
            Self::SpawnFailed { .. } => "SpawnFailed",
            Self::Fault { .. } => "Fault",
            Self::ShuttingDown => "ShuttingDown",
        }
    }
}

/// How a launched process terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum RunResponse {
    ExitedWithCode {
        #[serde(rename = "exitCode")]
        exit_code: i32,
    },
    ExitedWithSignal {
        #[serde(rename = "exitSignal")]
        exit_signal: i32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpawnFailureKind {
    /// The executable does not exist or is not on `PATH`.
    NotFound,
    PermissionDenied,
    /// Anything else, including a missing working directory.
    Other,
}

impl SpawnFailureKind {
    pub fn from_io(err: &std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound,
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied,
            _ => Self::Other,
        }
    }
}
