//! procrun-engine: execution engine process.
//!
//! Speaks the procrun framed protocol on stdin/stdout. Logs go to stderr,
//! and so does the stdout of every launched program.

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use procrun::config::CHILD_STDOUT_ENV;
use procrun::{ChildStdout, EngineConfig};

/// Initialize tracing with PROCRUN_LOG and LOG_FORMAT support.
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let base_level = match std::env::var("PROCRUN_LOG").as_deref() {
            Ok("trace") => "trace",
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };

        EnvFilter::new(format!(
            "procrun={level},procrun_engine={level},procrun::bridge::codec=off",
            level = base_level
        ))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    info!("procrun-engine {}", env!("CARGO_PKG_VERSION"));

    let mut config = EngineConfig::from_env(ChildStdout::Stderr);
    if config.child_stdout == ChildStdout::Inherit {
        // stdout carries protocol frames
        warn!(
            "{}=inherit would corrupt the protocol stream, using stderr",
            CHILD_STDOUT_ENV
        );
        config.child_stdout = ChildStdout::Stderr;
    }

    procrun::engine::serve(tokio::io::stdin(), tokio::io::stdout(), config)
        .await
        .context("engine protocol loop failed")?;

    Ok(())
}
