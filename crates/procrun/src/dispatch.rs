//! Dispatch channel - caller side of the engine protocol.
//!
//! Flow per call:
//! 1. Allocate a RequestId and park a oneshot sender under it
//! 2. Write the framed request (one writer at a time)
//! 3. Suspend on the oneshot until the reader task routes the matching reply
//!
//! A single reader task owns the read half and routes replies by id. The
//! reply body is only decoded by the call that receives it, so a reply with
//! an unknown tag fails that call alone with a [`ProtocolError`]. If the
//! stream ends or a frame has no readable id, every pending call fails with
//! the same [`ChannelError`] and the channel stays closed.

use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::{EngineReply, EngineRequest, Frame, RequestId, SpawnFailureKind};
use crate::config::{CHILD_STDOUT_ENV, ChannelConfig, EngineConfig, EngineLocation};
use crate::engine;
use crate::error::{ChannelError, Error, ProcessNotFoundError, ProtocolError};

/// Failures surfaced by [`Dispatch::dispatch`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    ProcessNotFound(#[from] ProcessNotFoundError),

    #[error("failed to start {program}: {message}")]
    Spawn { program: String, message: String },

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl From<DispatchError> for Error {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::ProcessNotFound(e) => Error::ProcessNotFound(e),
            DispatchError::Spawn { program, message } => Error::Spawn { program, message },
            DispatchError::Channel(e) => Error::Channel(e),
            DispatchError::Protocol(e) => Error::Protocol(e),
        }
    }
}

/// Narrow seam between the run pipeline and whatever executes processes.
///
/// Implementations must match each reply to its own request; independent
/// calls may be in flight at once and resolve in any order.
#[async_trait]
pub trait Dispatch: Send + Sync {
    /// Deliver one request and wait for its reply. No retries.
    async fn dispatch(&self, request: EngineRequest) -> Result<EngineReply, DispatchError>;
}

/// Reply body as routed by id, before it is decoded into an [`EngineReply`].
type RawReply = serde_json::Value;
type ReplySender = oneshot::Sender<Result<RawReply, ChannelError>>;
type PendingReplies = DashMap<RequestId, ReplySender>;
type RequestWriter =
    FramedWrite<Pin<Box<dyn AsyncWrite + Send>>, JsonCodec<Frame<EngineRequest>>>;

/// The engine behind a channel, kept for its lifetime.
enum EngineHandle {
    InProcess(JoinHandle<std::io::Result<()>>),
    Process(tokio::process::Child),
    External,
}

/// Framed, correlated transport to an execution engine.
pub struct EngineChannel {
    writer: Mutex<RequestWriter>,
    pending: Arc<PendingReplies>,
    closed: Arc<AtomicBool>,
    engine: EngineHandle,
}

impl EngineChannel {
    /// Wrap an existing byte stream to an engine.
    ///
    /// Must be called from within a tokio runtime (spawns the reply router).
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Send + 'static,
    {
        Self::with_engine(reader, writer, EngineHandle::External)
    }

    /// Run the engine as a task on the current runtime, connected through an
    /// in-memory pipe.
    pub fn in_process(config: EngineConfig) -> Self {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server);
        let task = tokio::spawn(engine::serve(server_read, server_write, config));

        tracing::debug!("Started in-process engine");
        let (client_read, client_write) = tokio::io::split(client);
        Self::with_engine(client_read, client_write, EngineHandle::InProcess(task))
    }

    /// Launch a `procrun-engine` binary and talk to it over stdin/stdout.
    pub fn spawn_binary(
        path: &std::path::Path,
        config: &EngineConfig,
    ) -> Result<Self, ChannelError> {
        let mut child = tokio::process::Command::new(path)
            .env(CHILD_STDOUT_ENV, config.child_stdout.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| ChannelError::Launch(format!("{}: {}", path.display(), e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ChannelError::Launch("engine stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ChannelError::Launch("engine stdout not captured".to_string()))?;

        tracing::info!(path = %path.display(), pid = child.id(), "Started engine process");
        Ok(Self::with_engine(stdout, stdin, EngineHandle::Process(child)))
    }

    /// Build the channel `config` describes.
    pub fn connect(config: &ChannelConfig) -> Result<Self, ChannelError> {
        match &config.engine {
            EngineLocation::InProcess => Ok(Self::in_process(config.engine_config.clone())),
            EngineLocation::Binary(path) => Self::spawn_binary(path, &config.engine_config),
        }
    }

    fn with_engine<R, W>(reader: R, writer: W, engine: EngineHandle) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Send + 'static,
    {
        let pending = Arc::new(PendingReplies::new());
        let closed = Arc::new(AtomicBool::new(false));

        let reader = FramedRead::new(reader, JsonCodec::<Frame<RawReply>>::new());
        tokio::spawn(route_replies(
            reader,
            Arc::clone(&pending),
            Arc::clone(&closed),
        ));

        let writer: Pin<Box<dyn AsyncWrite + Send>> = Box::pin(writer);
        Self {
            writer: Mutex::new(FramedWrite::new(writer, JsonCodec::new())),
            pending,
            closed,
            engine,
        }
    }

    /// Number of requests still waiting for a reply.
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// OS pid of the engine when it runs as a separate process.
    pub fn engine_pid(&self) -> Option<u32> {
        match &self.engine {
            EngineHandle::Process(child) => child.id(),
            EngineHandle::InProcess(_) | EngineHandle::External => None,
        }
    }

    /// Whether the engine behind this channel may still answer.
    pub fn engine_running(&self) -> bool {
        match &self.engine {
            EngineHandle::InProcess(task) => !task.is_finished(),
            EngineHandle::Process(child) => child.id().is_some() && !self.is_closed(),
            EngineHandle::External => !self.is_closed(),
        }
    }

    /// Ask the engine to finish in-flight runs and exit.
    ///
    /// Resolves once the engine acknowledges; replies to runs already in
    /// flight are delivered before that.
    pub async fn shutdown(&self) -> Result<(), DispatchError> {
        match self.dispatch(EngineRequest::Shutdown).await? {
            EngineReply::ShuttingDown => Ok(()),
            other => Err(ChannelError::Malformed(format!(
                "expected ShuttingDown, got {}",
                other.kind()
            ))
            .into()),
        }
    }
}

#[async_trait]
impl Dispatch for EngineChannel {
    async fn dispatch(&self, request: EngineRequest) -> Result<EngineReply, DispatchError> {
        let id = RequestId::new();
        let program = request.program().unwrap_or_default().to_string();
        let (reply_tx, reply_rx) = oneshot::channel();

        self.pending.insert(id, reply_tx);
        let _entry = PendingEntry {
            pending: &self.pending,
            id,
        };
        // The router sets `closed` before draining, so either it sees our
        // entry or we see the flag.
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed.into());
        }

        tracing::debug!(%id, request = request.kind(), %program, "Dispatching");
        {
            let mut writer = self.writer.lock().await;
            if let Err(e) = writer.send(Frame { id, body: request }).await {
                tracing::error!(%id, error = %e, "Failed to write request");
                return Err(ChannelError::Io(e.to_string()).into());
            }
        }

        let raw = reply_rx.await.map_err(|_| ChannelError::Closed)??;
        let reply: EngineReply = serde_json::from_value(raw).map_err(|e| {
            tracing::error!(%id, error = %e, "Undecodable reply from engine");
            ProtocolError::Malformed(e.to_string())
        })?;

        match reply {
            EngineReply::SpawnFailed {
                kind: SpawnFailureKind::NotFound,
                message,
            } => Err(ProcessNotFoundError { program, message }.into()),
            EngineReply::SpawnFailed { message, .. } => {
                Err(DispatchError::Spawn { program, message })
            }
            EngineReply::Fault { message } => {
                tracing::error!(%id, %message, "Engine fault");
                Err(ChannelError::Engine(message).into())
            }
            reply @ (EngineReply::RunRes(_) | EngineReply::ShuttingDown) => Ok(reply),
        }
    }
}

/// Removes a call's pending entry when the call finishes or is dropped.
struct PendingEntry<'a> {
    pending: &'a PendingReplies,
    id: RequestId,
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

async fn route_replies<R>(
    mut reader: FramedRead<R, JsonCodec<Frame<RawReply>>>,
    pending: Arc<PendingReplies>,
    closed: Arc<AtomicBool>,
) where
    R: AsyncRead + Unpin,
{
    let failure = loop {
        match reader.next().await {
            Some(Ok(Frame { id, body })) => match pending.remove(&id) {
                Some((_, reply_tx)) => {
                    if reply_tx.send(Ok(body)).is_err() {
                        tracing::debug!(%id, "Caller stopped waiting before reply arrived");
                    }
                }
                None => {
                    let reply = body.get("type").and_then(RawReply::as_str);
                    tracing::warn!(%id, ?reply, "Reply for unknown request");
                }
            },
            Some(Err(e)) if e.kind() == std::io::ErrorKind::InvalidData => {
                tracing::error!(error = %e, "Malformed reply from engine");
                break ChannelError::Malformed(e.to_string());
            }
            Some(Err(e)) => {
                tracing::error!(error = %e, "Engine channel error");
                break ChannelError::Io(e.to_string());
            }
            None => {
                tracing::debug!("Engine closed the channel");
                break ChannelError::Closed;
            }
        }
    };

    closed.store(true, Ordering::SeqCst);

    let ids: Vec<RequestId> = pending.iter().map(|entry| *entry.key()).collect();
    if !ids.is_empty() {
        tracing::warn!(count = ids.len(), error = %failure, "Failing pending requests");
    }
    for id in ids {
        if let Some((_, reply_tx)) = pending.remove(&id) {
            let _ = reply_tx.send(Err(failure.clone()));
        }
    }
}
