//! Execution engine - the far side of the dispatch channel.
//!
//! Reads framed [`EngineRequest`]s, launches each `Run` on its own task and
//! writes one [`EngineReply`] per request, in completion order. The caller
//! side is in dispatch.rs.
//!
//! Architecture:
//! - Request loop: decodes frames, spawns a task per Run
//! - Reply writer: single task fed by an mpsc channel, owns the write half
//!
//! On `Shutdown` the loop stops reading, waits for in-flight runs, answers
//! them, then acknowledges with `ShuttingDown`.

use std::io;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::{
    EngineReply, EngineRequest, Frame, RequestId, RunRequest, RunResponse, SpawnFailureKind,
};
use crate::config::EngineConfig;

/// Serve requests until the reader closes or a `Shutdown` arrives.
///
/// Returns an error if a request frame cannot be decoded or the reply stream
/// breaks. In-flight runs are always awaited before returning.
pub async fn serve<R, W>(reader: R, writer: W, config: EngineConfig) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut requests = FramedRead::new(reader, JsonCodec::<Frame<EngineRequest>>::new());
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<Frame<EngineReply>>();

    let writer_task = tokio::spawn(async move {
        let mut replies = FramedWrite::new(writer, JsonCodec::<Frame<EngineReply>>::new());
        while let Some(frame) = reply_rx.recv().await {
            tracing::trace!(id = %frame.id, reply = frame.body.kind(), "Sending reply");
            replies.send(frame).await?;
        }
        Ok::<(), io::Error>(())
    });

    let config = Arc::new(config);
    let mut runs = JoinSet::new();
    let mut result = Ok(());

    let shutdown_id = loop {
        match requests.next().await {
            Some(Ok(Frame {
                id,
                body: EngineRequest::Run(run),
            })) => {
                tracing::debug!(%id, program = run.argv.first().map(String::as_str), "Run requested");
                let tx = reply_tx.clone();
                let config = Arc::clone(&config);
                runs.spawn(async move {
                    let reply = execute(id, &run, &config).await;
                    if tx.send(Frame { id, body: reply }).is_err() {
                        tracing::warn!(%id, "Reply writer gone, dropping reply");
                    }
                });
            }
            Some(Ok(Frame {
                id,
                body: EngineRequest::Shutdown,
            })) => {
                tracing::info!(in_flight = runs.len(), "Shutdown requested");
                break Some(id);
            }
            Some(Err(e)) => {
                tracing::error!(error = %e, "Request channel error");
                result = Err(e);
                break None;
            }
            None => {
                tracing::debug!("Request channel closed");
                break None;
            }
        }

        while runs.try_join_next().is_some() {}
    };

    while runs.join_next().await.is_some() {}

    if let Some(id) = shutdown_id {
        let _ = reply_tx.send(Frame {
            id,
            body: EngineReply::ShuttingDown,
        });
    }
    drop(reply_tx);

    writer_task.await.map_err(io::Error::other)??;

    tracing::info!("Engine exiting");
    result
}

async fn execute(id: RequestId, run: &RunRequest, config: &EngineConfig) -> EngineReply {
    let Some((program, args)) = run.argv.split_first() else {
        return EngineReply::Fault {
            message: "Run request with empty argv".to_string(),
        };
    };

    if let Some(dir) = &run.dir
        && !is_dir(dir).await
    {
        return EngineReply::SpawnFailed {
            kind: SpawnFailureKind::Other,
            message: format!("working directory {} does not exist", dir),
        };
    }

    let stdout = match config.child_stdout.to_stdio() {
        Ok(stdout) => stdout,
        Err(e) => {
            return EngineReply::Fault {
                message: format!("failed to prepare child stdout: {}", e),
            };
        }
    };

    let mut command = tokio::process::Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(stdout)
        .stderr(Stdio::inherit());
    if let Some(dir) = &run.dir {
        command.current_dir(dir);
    }

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            tracing::debug!(%id, %program, error = %e, "Spawn failed");
            return EngineReply::SpawnFailed {
                kind: SpawnFailureKind::from_io(&e),
                message: e.to_string(),
            };
        }
    };
    tracing::debug!(%id, %program, pid = child.id(), "Process started");

    match child.wait().await {
        Ok(status) => match run_response(status) {
            Some(response) => {
                tracing::debug!(%id, ?response, "Process exited");
                EngineReply::RunRes(response)
            }
            None => EngineReply::Fault {
                message: format!("process terminated without code or signal: {}", status),
            },
        },
        Err(e) => EngineReply::Fault {
            message: format!("failed to wait for process: {}", e),
        },
    }
}

async fn is_dir(dir: &str) -> bool {
    tokio::fs::metadata(Path::new(dir))
        .await
        .map(|meta| meta.is_dir())
        .unwrap_or(false)
}

fn run_response(status: std::process::ExitStatus) -> Option<RunResponse> {
    if let Some(exit_code) = status.code() {
        return Some(RunResponse::ExitedWithCode { exit_code });
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(exit_signal) = status.signal() {
            return Some(RunResponse::ExitedWithSignal { exit_signal });
        }
    }

    None
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::ChildStdout;

    type Client = (
        FramedWrite<tokio::io::WriteHalf<tokio::io::DuplexStream>, JsonCodec<Frame<EngineRequest>>>,
        FramedRead<tokio::io::ReadHalf<tokio::io::DuplexStream>, JsonCodec<Frame<EngineReply>>>,
        tokio::task::JoinHandle<io::Result<()>>,
    );

    fn start_engine() -> Client {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server);
        let config = EngineConfig::new().with_child_stdout(ChildStdout::Null);
        let engine = tokio::spawn(serve(server_read, server_write, config));

        let (client_read, client_write) = tokio::io::split(client);
        (
            FramedWrite::new(client_write, JsonCodec::new()),
            FramedRead::new(client_read, JsonCodec::new()),
            engine,
        )
    }

    fn run(argv: &[&str]) -> EngineRequest {
        EngineRequest::Run(RunRequest {
            argv: argv.iter().map(|s| s.to_string()).collect(),
            dir: None,
        })
    }

    async fn roundtrip(request: EngineRequest) -> EngineReply {
        let (mut tx, mut rx, _engine) = start_engine();
        let id = RequestId::new();
        tx.send(Frame { id, body: request }).await.unwrap();
        let reply = rx.next().await.unwrap().unwrap();
        assert_eq!(reply.id, id);
        reply.body
    }

    #[tokio::test]
    async fn reports_exit_code() {
        let reply = roundtrip(run(&["sh", "-c", "exit 7"])).await;
        assert_eq!(
            reply,
            EngineReply::RunRes(RunResponse::ExitedWithCode { exit_code: 7 })
        );
    }

    #[tokio::test]
    async fn reports_signal() {
        let reply = roundtrip(run(&["sh", "-c", "kill -TERM $$"])).await;
        assert_eq!(
            reply,
            EngineReply::RunRes(RunResponse::ExitedWithSignal { exit_signal: 15 })
        );
    }

    #[tokio::test]
    async fn reports_missing_executable() {
        let reply = roundtrip(run(&["procrun-definitely-not-installed"])).await;
        assert!(matches!(
            reply,
            EngineReply::SpawnFailed {
                kind: SpawnFailureKind::NotFound,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn missing_dir_is_not_reported_as_missing_executable() {
        let reply = roundtrip(EngineRequest::Run(RunRequest {
            argv: vec!["true".to_string()],
            dir: Some("/procrun/no/such/dir".to_string()),
        }))
        .await;
        assert!(matches!(
            reply,
            EngineReply::SpawnFailed {
                kind: SpawnFailureKind::Other,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn runs_in_requested_dir() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("marker");
        std::fs::write(&marker, "").unwrap();

        let reply = roundtrip(EngineRequest::Run(RunRequest {
            argv: vec!["test".to_string(), "-f".to_string(), "marker".to_string()],
            dir: Some(dir.path().display().to_string()),
        }))
        .await;
        assert_eq!(
            reply,
            EngineReply::RunRes(RunResponse::ExitedWithCode { exit_code: 0 })
        );
    }

    #[tokio::test]
    async fn empty_argv_is_a_fault() {
        let reply = roundtrip(run(&[])).await;
        assert!(matches!(reply, EngineReply::Fault { .. }));
    }

    #[tokio::test]
    async fn replies_arrive_in_completion_order() {
        let (mut tx, mut rx, _engine) = start_engine();
        let slow = RequestId::new();
        let fast = RequestId::new();

        tx.send(Frame {
            id: slow,
            body: run(&["sh", "-c", "sleep 0.5; exit 1"]),
        })
        .await
        .unwrap();
        tx.send(Frame {
            id: fast,
            body: run(&["sh", "-c", "exit 2"]),
        })
        .await
        .unwrap();

        let first = rx.next().await.unwrap().unwrap();
        let second = rx.next().await.unwrap().unwrap();

        assert_eq!(first.id, fast);
        assert_eq!(second.id, slow);
    }

    #[tokio::test]
    async fn shutdown_drains_in_flight_runs() {
        let (mut tx, mut rx, engine) = start_engine();
        let run_id = RequestId::new();
        let shutdown_id = RequestId::new();

        tx.send(Frame {
            id: run_id,
            body: run(&["sh", "-c", "sleep 0.2; exit 3"]),
        })
        .await
        .unwrap();
        tx.send(Frame {
            id: shutdown_id,
            body: EngineRequest::Shutdown,
        })
        .await
        .unwrap();

        let first = rx.next().await.unwrap().unwrap();
        assert_eq!(first.id, run_id);
        assert_eq!(
            first.body,
            EngineReply::RunRes(RunResponse::ExitedWithCode { exit_code: 3 })
        );

        let second = rx.next().await.unwrap().unwrap();
        assert_eq!(second.id, shutdown_id);
        assert_eq!(second.body, EngineReply::ShuttingDown);

        engine.await.unwrap().unwrap();
        assert!(rx.next().await.is_none());
    }
}
