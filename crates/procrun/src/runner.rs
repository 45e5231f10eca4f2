//! Runner: the caller-facing run pipeline.
//!
//! normalize → encode → dispatch (suspend) → decode → failure policy.

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::bridge::protocol::EngineRequest;
use crate::command::{Command, CommandOptions};
use crate::config::{ChannelConfig, EngineConfig};
use crate::dispatch::{Dispatch, EngineChannel};
use crate::error::Error;
use crate::policy::apply_failure_policy;
use crate::status::{ExitStatus, decode_run_reply};

/// Runs commands through a dispatch channel.
///
/// Cheap to clone; clones share the channel.
#[derive(Clone)]
pub struct Runner {
    channel: Arc<dyn Dispatch>,
}

impl Runner {
    pub fn new(channel: Arc<dyn Dispatch>) -> Self {
        Self { channel }
    }

    /// Runner backed by an engine task on the current runtime.
    pub fn in_process(config: EngineConfig) -> Self {
        Self::new(Arc::new(EngineChannel::in_process(config)))
    }

    pub fn connect(config: &ChannelConfig) -> Result<Self, Error> {
        let channel = EngineChannel::connect(config)?;
        Ok(Self::new(Arc::new(channel)))
    }

    /// Run `command` and wait for it to terminate.
    ///
    /// With `throw_on_failure` (the default) a non-zero exit or a signal is
    /// [`Error::CommandFailed`]; otherwise the status is returned as is.
    /// [`Error::ProcessNotFound`] is returned either way when the program
    /// cannot be started.
    pub async fn run(&self, command: &Command) -> Result<ExitStatus, Error> {
        let reply = self.channel.dispatch(EngineRequest::run(command)).await?;
        let status = decode_run_reply(reply)?;
        tracing::debug!(program = command.program(), %status, "Command finished");
        Ok(apply_failure_policy(command, status)?)
    }

    /// Positional form: `args` followed by optional trailing options.
    pub async fn run_args<I, S>(
        &self,
        args: I,
        options: Option<&CommandOptions>,
    ) -> Result<ExitStatus, Error>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let command = Command::from_args(args, options)?;
        self.run(&command).await
    }

    /// Descriptor form: `options.argv` names the program.
    pub async fn run_options(&self, options: &CommandOptions) -> Result<ExitStatus, Error> {
        let command = Command::from_options(options)?;
        self.run(&command).await
    }
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner").finish_non_exhaustive()
    }
}

static DEFAULT_CHANNEL: Mutex<Option<Arc<EngineChannel>>> = Mutex::const_new(None);

/// Shared channel, reconnected from [`ChannelConfig::from_env`] when the
/// previous one has closed or lost its engine.
async fn default_channel() -> Result<Arc<EngineChannel>, Error> {
    let mut slot = DEFAULT_CHANNEL.lock().await;
    if let Some(channel) = slot.as_ref() {
        if !channel.is_closed() && channel.engine_running() {
            return Ok(Arc::clone(channel));
        }
        tracing::warn!("Default engine channel is gone, reconnecting");
    }

    let channel = Arc::new(EngineChannel::connect(&ChannelConfig::from_env())?);
    *slot = Some(Arc::clone(&channel));
    Ok(channel)
}

/// Process-wide runner, created on first use from [`ChannelConfig::from_env`].
///
/// Every runner returned shares one channel. If that channel closes, calls
/// already in flight fail and the next call here connects a fresh one.
/// An in-process engine lives on the runtime that first called this; use a
/// dedicated [`Runner`] when runtimes come and go (e.g. one per test).
pub async fn default_runner() -> Result<Runner, Error> {
    Ok(Runner::new(default_channel().await?))
}

/// Run `command` on the [`default_runner`].
pub async fn run(command: &Command) -> Result<ExitStatus, Error> {
    default_runner().await?.run(command).await
}

/// [`Runner::run_args`] on the [`default_runner`].
pub async fn run_args<I, S>(args: I, options: Option<&CommandOptions>) -> Result<ExitStatus, Error>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let command = Command::from_args(args, options)?;
    run(&command).await
}

/// [`Runner::run_options`] on the [`default_runner`].
pub async fn run_options(options: &CommandOptions) -> Result<ExitStatus, Error> {
    let command = Command::from_options(options)?;
    run(&command).await
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;

    use super::*;
    use crate::bridge::protocol::{EngineReply, RunRequest, RunResponse};
    use crate::dispatch::DispatchError;
    use crate::error::{ErrorKind, ProcessNotFoundError, ProtocolError, ValidationError};

    /// Fake engine answering every request with the same canned result.
    struct CannedEngine {
        reply: Result<EngineReply, DispatchError>,
        seen: StdMutex<Vec<EngineRequest>>,
    }

    impl CannedEngine {
        fn new(reply: Result<EngineReply, DispatchError>) -> Arc<Self> {
            Arc::new(Self {
                reply,
                seen: StdMutex::new(Vec::new()),
            })
        }

        fn exited(code: i32) -> Arc<Self> {
            Self::new(Ok(EngineReply::RunRes(RunResponse::ExitedWithCode {
                exit_code: code,
            })))
        }

        fn seen(&self) -> Vec<EngineRequest> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Dispatch for CannedEngine {
        async fn dispatch(&self, request: EngineRequest) -> Result<EngineReply, DispatchError> {
            self.seen.lock().unwrap().push(request);
            self.reply.clone()
        }
    }

    #[tokio::test]
    async fn zero_exit_is_success() {
        let engine = CannedEngine::exited(0);
        let runner = Runner::new(engine.clone());

        let status = runner.run_args(["true"], None).await.unwrap();

        assert_eq!(status, ExitStatus::ExitedWithCode { code: 0 });
        assert!(status.success());
        assert_eq!(
            engine.seen(),
            vec![EngineRequest::Run(RunRequest {
                argv: vec!["true".to_string()],
                dir: None,
            })]
        );
    }

    #[tokio::test]
    async fn nonzero_exit_fails_by_default() {
        let runner = Runner::new(CannedEngine::exited(4));

        let err = runner.run_args(["make", "all"], None).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::CommandFailed);
        let failure = err.as_command_failure().unwrap();
        assert_eq!(failure.status(), ExitStatus::ExitedWithCode { code: 4 });
        assert_eq!(failure.command().argv(), ["make", "all"]);
        assert!(failure.message().contains("make all"));
        assert!(failure.message().contains("exit code 4"));
    }

    #[tokio::test]
    async fn nonzero_exit_returned_when_not_throwing() {
        let runner = Runner::new(CannedEngine::new(Ok(EngineReply::RunRes(
            RunResponse::ExitedWithSignal { exit_signal: 9 },
        ))));
        let opts = CommandOptions::new()
            .with_argv(["sleep", "60"])
            .with_throw_on_failure(false);

        let status = runner.run_options(&opts).await.unwrap();

        assert_eq!(status.signal(), Some(9));
        assert!(!status.success());
    }

    #[tokio::test]
    async fn process_not_found_ignores_throw_on_failure() {
        let not_found = ProcessNotFoundError {
            program: "ghost".to_string(),
            message: "No such file or directory".to_string(),
        };
        let runner = Runner::new(CannedEngine::new(Err(not_found.clone().into())));

        for throw in [true, false] {
            let opts = CommandOptions::new().with_throw_on_failure(throw);
            let err = runner.run_args(["ghost"], Some(&opts)).await.unwrap_err();
            assert!(matches!(err, Error::ProcessNotFound(ref e) if *e == not_found));
        }
    }

    #[tokio::test]
    async fn wrong_reply_type_is_fatal() {
        let runner = Runner::new(CannedEngine::new(Ok(EngineReply::ShuttingDown)));

        let err = runner.run_args(["true"], None).await.unwrap_err();

        assert!(err.is_fatal());
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::UnexpectedReply("ShuttingDown"))
        ));
    }

    #[tokio::test]
    async fn empty_argv_never_reaches_engine() {
        let engine = CannedEngine::exited(0);
        let runner = Runner::new(engine.clone());

        let err = runner.run_options(&CommandOptions::new()).await.unwrap_err();

        assert!(matches!(err, Error::Validation(ValidationError::EmptyArgv)));
        assert!(engine.seen().is_empty());
    }

    #[tokio::test]
    async fn default_channel_reconnects_after_close() {
        let (client, server) = tokio::io::duplex(1024);
        drop(server);
        let (client_read, client_write) = tokio::io::split(client);
        let dead = Arc::new(EngineChannel::new(client_read, client_write));
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while !dead.is_closed() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        *DEFAULT_CHANNEL.lock().await = Some(Arc::clone(&dead));

        let fresh = default_channel().await.unwrap();
        assert!(!Arc::ptr_eq(&fresh, &dead));
        assert!(!fresh.is_closed());

        let again = default_channel().await.unwrap();
        assert!(Arc::ptr_eq(&fresh, &again));
    }
}
