//! Builds a chain from the `[[stages]]` list of the configuration.
//!
//! Stage kinds and their parameters:
//!
//! | kind       | params                                                |
//! |------------|-------------------------------------------------------|
//! | `loopback` | `mtu`                                                 |
//! | `udp`      | `local` (required), `remote`                          |
//! | `serial`   | `path` (required), `baud` (115200)                    |
//! | `file_in`  | `path` (required)                                     |
//! | `file_out` | `path` (required)                                     |
//! | `cobs`     | `max_frame`                                           |
//! | `reliable` | `fragment_size`, `ack_timeout_ms`, `retry_budget`     |
//!
//! `reliable` parameters override the `[reliable]` table for that stage.

use std::fmt::Display;
use std::io;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use relaypipe_core::config::{ConfigError, PipeConfig, StageSpec};
use relaypipe_stages::{
    Chain, CobsCodec, FileInputInterface, FileOutputInterface, FramingStage, LoopbackInterface,
    ReliableTransport, SerialInterface, Stage, StageError, UdpTransceiver,
};
use relaypipe_stages::interfaces::DEFAULT_BAUD;

#[derive(Debug, thiserror::Error)]
pub enum FactoryError {
    #[error("unknown stage kind {0:?}")]
    UnknownKind(String),

    #[error("{kind}: missing parameter {param:?}")]
    MissingParam { kind: String, param: &'static str },

    #[error("{kind}: bad value {value:?} for {param}: {reason}")]
    BadParam {
        kind: String,
        param: &'static str,
        value: String,
        reason: String,
    },

    #[error("{kind}: {source}")]
    Io {
        kind: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Topology(#[from] StageError),
}

/// Build the configured chain, interface first. With no `[[stages]]` the
/// chain is a loopback echo under a reliable transport.
pub async fn build_chain(config: &PipeConfig) -> Result<Chain, FactoryError> {
    let default_stages = [StageSpec::new("loopback"), StageSpec::new("reliable")];
    let specs: &[StageSpec] = if config.stages.is_empty() {
        &default_stages
    } else {
        &config.stages
    };

    let mut chain = Chain::new();
    for spec in specs {
        let stage = build_stage(spec, config).await?;
        tracing::debug!(kind = %spec.kind, stage = stage.name(), "stage built");
        chain.add(stage)?;
    }
    Ok(chain)
}

pub async fn build_stage(
    spec: &StageSpec,
    config: &PipeConfig,
) -> Result<Arc<dyn Stage>, FactoryError> {
    let events = config.events.queue_length;
    let stage: Arc<dyn Stage> = match spec.kind.as_str() {
        "loopback" => LoopbackInterface::echo(optional(spec, "mtu")?),
        "udp" => {
            let local: SocketAddr = required(spec, "local")?;
            let remote: Option<SocketAddr> = optional(spec, "remote")?;
            UdpTransceiver::bind(local, remote)
                .await
                .map_err(|source| FactoryError::Io {
                    kind: spec.kind.clone(),
                    source,
                })?
        }
        "serial" => {
            let path: String = required(spec, "path")?;
            let baud = optional(spec, "baud")?.unwrap_or(DEFAULT_BAUD);
            SerialInterface::open(&path, baud).map_err(|source| FactoryError::Io {
                kind: spec.kind.clone(),
                source,
            })?
        }
        "file_in" => FileInputInterface::open(required::<String>(spec, "path")?),
        "file_out" => FileOutputInterface::create(required::<String>(spec, "path")?).map_err(
            |source| FactoryError::Io {
                kind: spec.kind.clone(),
                source,
            },
        )?,
        "cobs" => {
            let codec = match optional(spec, "max_frame")? {
                Some(max) => CobsCodec::with_max_frame(max),
                None => CobsCodec::new(),
            };
            FramingStage::with_event_capacity("cobs", codec, events)
        }
        "reliable" => {
            let mut reliable = config.reliable.clone();
            if let Some(v) = optional(spec, "fragment_size")? {
                reliable.fragment_size = v;
            }
            if let Some(v) = optional(spec, "ack_timeout_ms")? {
                reliable.ack_timeout_ms = v;
            }
            if let Some(v) = optional(spec, "retry_budget")? {
                reliable.retry_budget = v;
            }
            ReliableTransport::with_event_capacity(reliable, events)?
        }
        other => return Err(FactoryError::UnknownKind(other.to_string())),
    };
    Ok(stage)
}

// ── Parameters ────────────────────────────────────────────────────────────────

fn optional<T>(spec: &StageSpec, param: &'static str) -> Result<Option<T>, FactoryError>
where
    T: FromStr,
    T::Err: Display,
{
    let Some(value) = spec.params.get(param) else {
        return Ok(None);
    };
    value
        .parse()
        .map(Some)
        .map_err(|e: T::Err| FactoryError::BadParam {
            kind: spec.kind.clone(),
            param,
            value: value.clone(),
            reason: e.to_string(),
        })
}

fn required<T>(spec: &StageSpec, param: &'static str) -> Result<T, FactoryError>
where
    T: FromStr,
    T::Err: Display,
{
    optional(spec, param)?.ok_or_else(|| FactoryError::MissingParam {
        kind: spec.kind.clone(),
        param,
    })
}
