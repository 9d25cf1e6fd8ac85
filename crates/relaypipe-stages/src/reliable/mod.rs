//! Reliable transport: a stop-and-wait ARQ stage.
//!
//! Outbound messages are queued and a background worker splits each into
//! fragments of at most `fragment_size` bytes. Every fragment waits for an
//! ACK from the peer before the next one goes out, and is resent on NACK
//! or timeout until the retry budget is spent. The receive side verifies
//! checksums, answers every fragment, drops duplicates and hands the
//! reassembled message up.
//!
//! Both ends of a link run the same stage; ACKs travel in the same frames
//! as data, marked by the control bit.

mod ack;
mod fragment;
mod reassembly;
mod send_worker;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use relaypipe_core::config::{ConfigError, ReliableConfig, DEFAULT_EVENT_QUEUE_LENGTH};
use relaypipe_core::wire::{control_frame, FRAME_OVERHEAD};
use relaypipe_core::{ByteMessage, ControlCode, PacketHeader};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::stage::{lock, Stage, StageCore, StageError};
use ack::AckSlot;
use reassembly::{Outcome, Reassembler};
use send_worker::SendWorker;

pub struct ReliableTransport {
    core: StageCore,
    config: ReliableConfig,
    outbound: mpsc::UnboundedSender<ByteMessage>,
    /// Receiving end of `outbound`, until `start` hands it to the worker.
    queue: Mutex<Option<mpsc::UnboundedReceiver<ByteMessage>>>,
    ack: AckSlot,
    reassembler: Mutex<Reassembler>,
    stats: ArqStats,
    worker: Mutex<Option<JoinHandle<()>>>,
    shutdown: broadcast::Sender<()>,
    closed: AtomicBool,
}

impl ReliableTransport {
    pub fn new(config: ReliableConfig) -> Result<Arc<Self>, ConfigError> {
        Self::with_event_capacity(config, DEFAULT_EVENT_QUEUE_LENGTH)
    }

    pub fn with_event_capacity(
        config: ReliableConfig,
        event_capacity: usize,
    ) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;
        let (outbound, queue) = mpsc::unbounded_channel();
        let (shutdown, _) = broadcast::channel(1);
        Ok(Arc::new(Self {
            core: StageCore::with_event_capacity("reliable", event_capacity),
            config,
            outbound,
            queue: Mutex::new(Some(queue)),
            ack: AckSlot::default(),
            reassembler: Mutex::new(Reassembler::default()),
            stats: ArqStats::default(),
            worker: Mutex::new(None),
            shutdown,
            closed: AtomicBool::new(false),
        }))
    }

    pub fn config(&self) -> &ReliableConfig {
        &self.config
    }

    /// Largest frame this stage hands to the stage below.
    pub fn frame_size(&self) -> usize {
        self.config.fragment_size + FRAME_OVERHEAD
    }

    pub fn stats(&self) -> ArqStatsSnapshot {
        self.stats.snapshot()
    }

    fn handle_control(&self, header: PacketHeader, mut body: ByteMessage) {
        match body.try_pop_front().map(ControlCode::try_from) {
            Some(Ok(code)) => {
                if self.ack.resolve(header.sequence(), code) {
                    tracing::trace!(%header, ?code, "reply matched");
                } else {
                    tracing::trace!(%header, ?code, "stale reply ignored");
                }
            }
            Some(Err(e)) => tracing::warn!(%header, error = %e, "control frame dropped"),
            None => tracing::warn!(%header, "truncated control frame dropped"),
        }
    }

    /// Answer the fragment `sequence`, routed the same way as `inbound`.
    fn reply(&self, sequence: u8, code: ControlCode, inbound: &ByteMessage) -> Result<(), StageError> {
        let mut frame = ByteMessage::from(control_frame(sequence, code));
        frame.inherit_metadata(inbound);
        self.core.forward_down(frame)
    }
}

impl Stage for ReliableTransport {
    fn core(&self) -> &StageCore {
        &self.core
    }

    fn handle_transmit(&self, msg: ByteMessage) -> Result<(), StageError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StageError::Closed(self.core.name().to_string()));
        }
        self.outbound
            .send(msg)
            .map_err(|_| StageError::Closed(self.core.name().to_string()))
    }

    fn handle_deliver(&self, mut frame: ByteMessage) -> Result<(), StageError> {
        let Some(first) = frame.try_pop_front() else {
            tracing::warn!("empty frame dropped");
            return Ok(());
        };
        let header = PacketHeader::decode(first);
        if header.is_control() {
            self.handle_control(header, frame);
            return Ok(());
        }

        let mut routing = ByteMessage::new();
        routing.inherit_metadata(&frame);

        let verdict = lock(&self.reassembler).accept(header, frame);
        self.stats.record_inbound(verdict.outcome);
        match verdict.outcome {
            Outcome::ChecksumFailed | Outcome::Discarded => {
                tracing::debug!(%header, outcome = ?verdict.outcome, "fragment rejected");
            }
            Outcome::Truncated => tracing::warn!(%header, "truncated fragment dropped"),
            _ => tracing::trace!(%header, outcome = ?verdict.outcome, "fragment received"),
        }

        // Answer first so the sender is not kept waiting on our upper stages.
        let replied = match verdict.reply {
            Some(code) => self.reply(header.sequence(), code, &routing),
            None => Ok(()),
        };
        if let Some(msg) = verdict.message {
            tracing::debug!(len = msg.len(), "message reassembled");
            if let Err(e) = self.core.forward_up(msg) {
                if let Err(reply_err) = &replied {
                    tracing::warn!(%header, error = %reply_err, "reply not sent");
                }
                return Err(e);
            }
        }
        replied
    }

    fn start(self: Arc<Self>) -> Result<(), StageError> {
        let runtime =
            Handle::try_current().map_err(|_| StageError::NoRuntime(self.core.name().to_string()))?;
        if self.closed.load(Ordering::SeqCst) {
            return Err(StageError::Closed(self.core.name().to_string()));
        }
        let Some(queue) = lock(&self.queue).take() else {
            return Ok(());
        };

        let worker = SendWorker::new(Arc::downgrade(&self), queue, self.shutdown.subscribe());
        let span = tracing::info_span!("send_worker", stage = %self.core.name());
        *lock(&self.worker) = Some(runtime.spawn(worker.run().instrument(span)));

        tracing::info!(
            fragment_size = self.config.fragment_size,
            ack_timeout_ms = self.config.ack_timeout_ms,
            retry_budget = self.config.retry_budget,
            "reliable transport started"
        );
        Ok(())
    }

    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown.send(());
        self.ack.disarm();
        tracing::debug!(stats = ?self.stats.snapshot(), "reliable transport stopped");
    }

    fn take_tasks(&self) -> Vec<JoinHandle<()>> {
        lock(&self.worker).take().into_iter().collect()
    }
}

// ── Counters ──────────────────────────────────────────────────────────────────

#[derive(Default)]
struct ArqStats {
    frames_sent: AtomicU64,
    retransmissions: AtomicU64,
    messages_sent: AtomicU64,
    messages_abandoned: AtomicU64,
    fragments_accepted: AtomicU64,
    duplicates: AtomicU64,
    checksum_failures: AtomicU64,
    messages_delivered: AtomicU64,
}

/// Point-in-time copy of a [`ReliableTransport`]'s counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArqStatsSnapshot {
    pub frames_sent: u64,
    pub retransmissions: u64,
    pub messages_sent: u64,
    pub messages_abandoned: u64,
    pub fragments_accepted: u64,
    pub duplicates: u64,
    pub checksum_failures: u64,
    pub messages_delivered: u64,
}

impl ArqStats {
    fn record_frame_sent(&self, retransmission: bool) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        if retransmission {
            self.retransmissions.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn record_message_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    fn record_abandoned(&self) {
        self.messages_abandoned.fetch_add(1, Ordering::Relaxed);
    }

    fn record_inbound(&self, outcome: Outcome) {
        let counter = match outcome {
            Outcome::Accepted => &self.fragments_accepted,
            Outcome::Completed => {
                self.fragments_accepted.fetch_add(1, Ordering::Relaxed);
                &self.messages_delivered
            }
            Outcome::Duplicate => &self.duplicates,
            Outcome::ChecksumFailed | Outcome::Discarded => &self.checksum_failures,
            Outcome::Truncated => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ArqStatsSnapshot {
        ArqStatsSnapshot {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            retransmissions: self.retransmissions.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_abandoned: self.messages_abandoned.load(Ordering::Relaxed),
            fragments_accepted: self.fragments_accepted.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            checksum_failures: self.checksum_failures.load(Ordering::Relaxed),
            messages_delivered: self.messages_delivered.load(Ordering::Relaxed),
        }
    }
}
