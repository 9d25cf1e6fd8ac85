//! relaypiped — runs a relaypipe chain built from configuration.
//!
//! Each stdin line is transmitted as one message; every message the chain
//! delivers is printed to stdout. Exits on ctrl-c, or once stdin is closed
//! and in-flight traffic has had time to settle.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;

use relaypipe_core::config::PipeConfig;
use relaypipe_core::ByteMessage;
use relaypipe_stages::StageEvent;

mod factory;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    let config = match std::env::args().nth(1).map(PathBuf::from) {
        Some(path) => PipeConfig::load_from(&path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => {
            if let Err(e) = PipeConfig::write_default_if_missing() {
                tracing::warn!(error = %e, "failed to write default config");
            }
            PipeConfig::load().unwrap_or_else(|e| {
                tracing::warn!(error = %e, "failed to load config, using defaults");
                PipeConfig::default()
            })
        }
    };

    let chain = factory::build_chain(&config)
        .await
        .context("failed to build chain")?;
    let mut events = chain.subscribe()?;
    chain.start().context("failed to start chain")?;
    tracing::info!(
        stages = chain.len(),
        interface = chain.interface().map(|s| s.name()).unwrap_or(""),
        "relaypiped running"
    );

    // After stdin closes, wait long enough for a message to exhaust its
    // retries before leaving.
    let linger = config.reliable.ack_timeout() * config.reliable.retry_budget;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_closed_at: Option<Instant> = None;

    loop {
        let deadline = stdin_closed_at.map(|t| t + linger);
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted");
                break;
            }

            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                tracing::info!("stdin closed, exiting");
                break;
            }

            line = lines.next_line(), if stdin_closed_at.is_none() => match line {
                Ok(Some(line)) => {
                    if let Err(e) = chain.transmit(ByteMessage::from(line.into_bytes())) {
                        tracing::warn!(error = %e, "transmit failed");
                    }
                }
                Ok(None) => stdin_closed_at = Some(Instant::now()),
                Err(e) => {
                    tracing::error!(error = %e, "stdin read failed");
                    stdin_closed_at = Some(Instant::now());
                }
            },

            event = events.recv() => match event {
                Ok(StageEvent::MessageAvailable(msg)) => {
                    tracing::debug!(len = msg.len(), port = msg.port(), "message delivered");
                    println!("{}", String::from_utf8_lossy(&msg.to_vec()));
                }
                Ok(StageEvent::Exception(fault)) => {
                    tracing::warn!(stage = %fault.stage, error = %fault.error, "stage exception");
                }
                Ok(StageEvent::BrokenPipe { stage }) => {
                    tracing::error!(%stage, "pipe broken, shutting down");
                    break;
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event stream lagged");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    let faults = chain.take_exceptions();
    if !faults.is_empty() {
        tracing::warn!(count = faults.len(), "exceptions recorded during run");
    }
    chain.dispose();
    // Let writers drain their queues and release their handles.
    if tokio::time::timeout(CLOSE_TIMEOUT, chain.closed()).await.is_err() {
        tracing::warn!("stages did not close in time");
    }
    Ok(())
}
