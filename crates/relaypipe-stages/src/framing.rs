//! Message framing over byte-stream links.
//!
//! A [`FramingStage`] sits above an interface that does not preserve
//! message boundaries (a serial line, a pipe, a file). Outbound messages
//! are encoded by a [`FrameCodec`] and cut into pieces the interface can
//! take; inbound bytes are fed to the codec and every complete message is
//! delivered up.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use relaypipe_core::config::DEFAULT_EVENT_QUEUE_LENGTH;
use relaypipe_core::ByteMessage;

use crate::stage::{lock, Stage, StageCore, StageError};

/// Turns messages into a delimited byte stream and back.
pub trait FrameCodec: Send + 'static {
    /// Consume raw bytes from the link. Complete messages become available
    /// through [`take_message`](Self::take_message).
    fn feed(&mut self, bytes: &[u8]);

    /// Complete messages waiting to be taken.
    fn pending_count(&self) -> usize;

    fn take_message(&mut self) -> Option<ByteMessage>;

    fn encode(&self, msg: &ByteMessage) -> Vec<u8>;

    /// Frames dropped as corrupt or oversized so far.
    fn receive_errors(&self) -> u64 {
        0
    }
}

// ── COBS ──────────────────────────────────────────────────────────────────────

/// Largest encoded frame [`CobsCodec`] buffers by default.
pub const DEFAULT_MAX_FRAME: usize = 64 * 1024;

/// Consistent Overhead Byte Stuffing with a `0x00` delimiter after every
/// frame.
pub struct CobsCodec {
    buf: Vec<u8>,
    max_frame: usize,
    /// Set after an oversized frame; bytes are skipped until the next
    /// delimiter.
    in_overflow: bool,
    ready: VecDeque<ByteMessage>,
    errors: u64,
}

impl CobsCodec {
    pub fn new() -> Self {
        Self::with_max_frame(DEFAULT_MAX_FRAME)
    }

    pub fn with_max_frame(max_frame: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_frame,
            in_overflow: false,
            ready: VecDeque::new(),
            errors: 0,
        }
    }

    fn end_of_frame(&mut self) {
        if self.in_overflow {
            self.in_overflow = false;
        } else if !self.buf.is_empty() {
            match cobs::decode_in_place(&mut self.buf) {
                Ok(n) => self.ready.push_back(ByteMessage::from(&self.buf[..n])),
                Err(_) => {
                    self.errors += 1;
                    tracing::debug!(len = self.buf.len(), "undecodable cobs frame dropped");
                }
            }
        }
        self.buf.clear();
    }
}

impl Default for CobsCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec for CobsCodec {
    fn feed(&mut self, bytes: &[u8]) {
        for &b in bytes {
            if b == 0 {
                self.end_of_frame();
            } else if self.in_overflow {
                continue;
            } else if self.buf.len() >= self.max_frame {
                self.errors += 1;
                self.in_overflow = true;
                self.buf.clear();
                tracing::debug!(max = self.max_frame, "oversized cobs frame dropped");
            } else {
                self.buf.push(b);
            }
        }
    }

    fn pending_count(&self) -> usize {
        self.ready.len()
    }

    fn take_message(&mut self) -> Option<ByteMessage> {
        self.ready.pop_front()
    }

    fn encode(&self, msg: &ByteMessage) -> Vec<u8> {
        let mut out = cobs::encode_vec(&msg.to_vec());
        out.push(0);
        out
    }

    fn receive_errors(&self) -> u64 {
        self.errors
    }
}

// ── Stage ─────────────────────────────────────────────────────────────────────

pub struct FramingStage<C: FrameCodec> {
    core: StageCore,
    codec: Mutex<C>,
}

impl<C: FrameCodec> FramingStage<C> {
    pub fn new(name: &str, codec: C) -> Arc<Self> {
        Self::with_event_capacity(name, codec, DEFAULT_EVENT_QUEUE_LENGTH)
    }

    pub fn with_event_capacity(name: &str, codec: C, event_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            core: StageCore::with_event_capacity(name, event_capacity),
            codec: Mutex::new(codec),
        })
    }

    pub fn receive_errors(&self) -> u64 {
        lock(&self.codec).receive_errors()
    }
}

impl FramingStage<CobsCodec> {
    pub fn cobs() -> Arc<Self> {
        Self::new("cobs", CobsCodec::new())
    }
}

impl<C: FrameCodec> Stage for FramingStage<C> {
    fn core(&self) -> &StageCore {
        &self.core
    }

    fn handle_transmit(&self, msg: ByteMessage) -> Result<(), StageError> {
        let encoded = lock(&self.codec).encode(&msg);
        let piece = match self.core.downward().and_then(|down| down.mtu().map(|m| (down, m))) {
            Some((down, 0)) => {
                return Err(StageError::Precondition(format!(
                    "{} reports an mtu of 0",
                    down.name()
                )))
            }
            Some((_, mtu)) => mtu,
            None => encoded.len().max(1),
        };

        for chunk in encoded.chunks(piece) {
            let mut out = ByteMessage::from(chunk);
            out.inherit_metadata(&msg);
            self.core.forward_down(out)?;
        }
        Ok(())
    }

    fn handle_deliver(&self, msg: ByteMessage) -> Result<(), StageError> {
        let complete: Vec<ByteMessage> = {
            let mut codec = lock(&self.codec);
            codec.feed(&msg.to_vec());
            std::iter::from_fn(|| codec.take_message()).collect()
        };
        for mut out in complete {
            out.inherit_metadata(&msg);
            self.core.forward_up(out)?;
        }
        Ok(())
    }
}
