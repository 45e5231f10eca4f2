//! Engine and channel configuration.
//!
//! Environment:
//! - `PROCRUN_ENGINE`: path to a `procrun-engine` binary. Unset means the
//!   engine runs in-process.
//! - `PROCRUN_CHILD_STDOUT`: where launched programs write stdout
//!   (`inherit`, `stderr`, `null`).

use std::path::PathBuf;
use std::process::Stdio;
use std::str::FromStr;

pub const ENGINE_ENV: &str = "PROCRUN_ENGINE";
pub const CHILD_STDOUT_ENV: &str = "PROCRUN_CHILD_STDOUT";

/// Destination for a launched program's stdout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChildStdout {
    #[default]
    Inherit,
    /// Redirect to the engine's stderr. Required when the engine's own
    /// stdout carries protocol frames.
    Stderr,
    Null,
}

impl ChildStdout {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inherit => "inherit",
            Self::Stderr => "stderr",
            Self::Null => "null",
        }
    }

    pub(crate) fn to_stdio(self) -> std::io::Result<Stdio> {
        match self {
            Self::Inherit => Ok(Stdio::inherit()),
            Self::Null => Ok(Stdio::null()),
            Self::Stderr => stderr_stdio(),
        }
    }
}

#[cfg(unix)]
fn stderr_stdio() -> std::io::Result<Stdio> {
    use std::os::fd::AsFd;
    let fd = std::io::stderr().as_fd().try_clone_to_owned()?;
    Ok(Stdio::from(fd))
}

#[cfg(windows)]
fn stderr_stdio() -> std::io::Result<Stdio> {
    use std::os::windows::io::AsHandle;
    let handle = std::io::stderr().as_handle().try_clone_to_owned()?;
    Ok(Stdio::from(handle))
}

#[cfg(not(any(unix, windows)))]
fn stderr_stdio() -> std::io::Result<Stdio> {
    Ok(Stdio::null())
}

impl FromStr for ChildStdout {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "inherit" => Ok(Self::Inherit),
            "stderr" => Ok(Self::Stderr),
            "null" | "none" => Ok(Self::Null),
            other => Err(format!(
                "invalid child stdout '{}', expected inherit, stderr or null",
                other
            )),
        }
    }
}

/// Settings for the engine side.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub child_stdout: ChildStdout,
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read `PROCRUN_CHILD_STDOUT`, falling back to `default` when unset or invalid.
    pub fn from_env(default: ChildStdout) -> Self {
        let child_stdout = match std::env::var(CHILD_STDOUT_ENV) {
            Ok(value) => value.parse().unwrap_or_else(|e: String| {
                tracing::warn!(error = %e, fallback = default.as_str(), "Ignoring {}", CHILD_STDOUT_ENV);
                default
            }),
            Err(_) => default,
        };
        Self { child_stdout }
    }

    pub fn with_child_stdout(mut self, child_stdout: ChildStdout) -> Self {
        self.child_stdout = child_stdout;
        self
    }
}

/// Where the execution engine lives.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum EngineLocation {
    /// Engine task on the current runtime, connected by an in-memory pipe.
    #[default]
    InProcess,
    /// Separate engine process; stdin/stdout carry the protocol.
    Binary(PathBuf),
}

/// Settings for the caller side of the dispatch channel.
#[derive(Debug, Clone, Default)]
pub struct ChannelConfig {
    pub engine: EngineLocation,
    /// Used by the in-process engine; forwarded to a binary engine via env.
    pub engine_config: EngineConfig,
}

impl ChannelConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_env() -> Self {
        let engine = match std::env::var_os(ENGINE_ENV) {
            Some(path) if !path.is_empty() => EngineLocation::Binary(PathBuf::from(path)),
            _ => EngineLocation::InProcess,
        };
        Self {
            engine,
            engine_config: EngineConfig::from_env(ChildStdout::Inherit),
        }
    }

    pub fn with_engine(mut self, engine: EngineLocation) -> Self {
        self.engine = engine;
        self
    }

    pub fn with_engine_config(mut self, engine_config: EngineConfig) -> Self {
        self.engine_config = engine_config;
        self
    }
}
