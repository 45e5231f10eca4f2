//! procrun: launch external processes through an execution engine and await
//! their exit status without blocking the calling task.

pub mod bridge;
pub mod command;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod policy;
pub mod runner;
pub mod status;

pub use command::{Command, CommandBuilder, CommandOptions};
pub use config::{ChannelConfig, ChildStdout, EngineConfig, EngineLocation};
pub use dispatch::{Dispatch, DispatchError, EngineChannel};
pub use error::{
    ChannelError, CommandFailureError, Error, ErrorKind, ProcessNotFoundError, ProtocolError,
    ValidationError,
};
pub use runner::{Runner, default_runner, run, run_args, run_options};
pub use status::{ExitStatus, SIGNALS_SUPPORTED};
