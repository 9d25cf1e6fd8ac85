//! Send worker: takes messages off the outbound queue and pushes them
//! through the stop-and-wait exchange, one fragment at a time.

use std::sync::atomic::Ordering;
use std::sync::Weak;

use relaypipe_core::wire::SEQUENCE_MODULUS;
use relaypipe_core::{ByteMessage, ControlCode};
use tokio::sync::{broadcast, mpsc};

use super::fragment::{fragment, Frame};
use super::ReliableTransport;
use crate::stage::{Stage, StageError};

enum SendError {
    /// Shutdown was signalled mid-exchange.
    Cancelled,
    Failed(StageError),
}

pub(crate) struct SendWorker {
    stage: Weak<ReliableTransport>,
    queue: mpsc::UnboundedReceiver<ByteMessage>,
    shutdown: broadcast::Receiver<()>,
}

impl SendWorker {
    pub(crate) fn new(
        stage: Weak<ReliableTransport>,
        queue: mpsc::UnboundedReceiver<ByteMessage>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            stage,
            queue,
            shutdown,
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("send worker shutting down");
                    return;
                }

                msg = self.queue.recv() => {
                    let Some(msg) = msg else {
                        tracing::info!("outbound queue closed, send worker exiting");
                        return;
                    };
                    let Some(stage) = self.stage.upgrade() else {
                        return;
                    };
                    match self.send_message(&stage, msg).await {
                        Ok(()) => {}
                        Err(SendError::Cancelled) => {
                            tracing::info!("send worker shutting down mid-message");
                            return;
                        }
                        Err(SendError::Failed(e)) => {
                            tracing::warn!(error = %e, "message abandoned");
                            stage.stats.record_abandoned();
                            stage.core().report_exception(e);
                        }
                    }
                }
            }
        }
    }

    async fn send_message(
        &mut self,
        stage: &ReliableTransport,
        msg: ByteMessage,
    ) -> Result<(), SendError> {
        let first_sequence = rand::random::<u8>() % SEQUENCE_MODULUS;
        let frames = fragment(&msg, stage.config.fragment_size, first_sequence);
        tracing::debug!(
            len = msg.len(),
            fragments = frames.len(),
            first_sequence,
            "sending message"
        );

        for frame in frames {
            self.send_frame(stage, frame).await?;
        }
        stage.stats.record_message_sent();
        Ok(())
    }

    /// Send one fragment until it is ACKed or the retry budget (total
    /// transmissions) runs out. A NACK resends at once; silence resends
    /// after the ACK timeout.
    async fn send_frame(
        &mut self,
        stage: &ReliableTransport,
        frame: Frame,
    ) -> Result<(), SendError> {
        let sequence = frame.header.sequence();
        let budget = stage.config.retry_budget;
        let timeout = stage.config.ack_timeout();

        for attempt in 1..=budget {
            if stage.closed.load(Ordering::SeqCst) {
                return Err(SendError::Cancelled);
            }
            // Armed before sending: the reply can arrive before we await it.
            let reply = stage.ack.arm(sequence);
            if let Err(e) = stage.core().forward_down(frame.bytes.copy()) {
                stage.ack.disarm();
                return Err(SendError::Failed(e));
            }
            stage.stats.record_frame_sent(attempt > 1);

            let outcome = tokio::select! {
                biased;
                _ = self.shutdown.recv() => {
                    stage.ack.disarm();
                    return Err(SendError::Cancelled);
                }
                code = reply => match code {
                    Ok(code) => Some(code),
                    // Only shutdown disarms a slot we are waiting on.
                    Err(_) => return Err(SendError::Cancelled),
                },
                _ = tokio::time::sleep(timeout) => None,
            };
            stage.ack.disarm();

            match outcome {
                Some(ControlCode::Ack) => {
                    tracing::trace!(header = %frame.header, attempt, "fragment acknowledged");
                    return Ok(());
                }
                Some(ControlCode::Nack) => {
                    tracing::debug!(header = %frame.header, attempt, "fragment rejected, resending");
                }
                None => {
                    tracing::debug!(header = %frame.header, attempt, "ack timeout");
                }
            }
        }

        Err(SendError::Failed(StageError::RetriesExhausted {
            sequence,
            attempts: budget,
        }))
    }
}
