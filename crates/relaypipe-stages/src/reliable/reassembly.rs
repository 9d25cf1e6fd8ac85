//! Receive side of the ARQ: duplicate suppression, checksum verification
//! and fragment reassembly.
//!
//! [`Reassembler::accept`] is pure bookkeeping. It decides what to answer
//! and what to deliver, and the stage acts on that after releasing its
//! lock.

use relaypipe_core::wire::next_sequence;
use relaypipe_core::{checksum, ByteMessage, ControlCode, PacketHeader, PacketState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    /// A `First` or `Middle` fragment was appended.
    Accepted,
    /// A `Last` fragment completed a message.
    Completed,
    /// The fragment repeats the last accepted one; only the ACK is resent.
    Duplicate,
    ChecksumFailed,
    /// The final fragment of a multi-fragment message was corrupt. The
    /// partial message is dropped.
    Discarded,
    /// Too short to carry a checksum.
    Truncated,
}

#[derive(Debug)]
pub(crate) struct Verdict {
    pub outcome: Outcome,
    pub reply: Option<ControlCode>,
    pub message: Option<ByteMessage>,
}

impl Verdict {
    fn reply(outcome: Outcome, code: ControlCode) -> Self {
        Self {
            outcome,
            reply: Some(code),
            message: None,
        }
    }

    fn silent(outcome: Outcome) -> Self {
        Self {
            outcome,
            reply: None,
            message: None,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct Reassembler {
    buffer: Vec<u8>,
    in_progress: bool,
    /// Sequence of the last intermediate fragment accepted. Cleared when a
    /// message completes or is dropped.
    last_accepted: Option<u8>,
}

impl Reassembler {
    /// Process one payload frame. `body` is the frame without its header
    /// byte: payload followed by the checksum.
    pub(crate) fn accept(&mut self, header: PacketHeader, mut body: ByteMessage) -> Verdict {
        let sequence = header.sequence();
        if self.last_accepted == Some(sequence) {
            return Verdict::reply(Outcome::Duplicate, ControlCode::Ack);
        }

        let Some(received) = body.try_pop_back() else {
            return Verdict::silent(Outcome::Truncated);
        };
        let valid = checksum(body.iter()) == received;

        match header.state() {
            PacketState::First | PacketState::Middle => {
                if !valid {
                    return Verdict::reply(Outcome::ChecksumFailed, ControlCode::Nack);
                }
                if header.state() == PacketState::First {
                    self.buffer.clear();
                }
                self.buffer.extend(body.iter());
                self.in_progress = true;
                self.last_accepted = Some(sequence);
                Verdict::reply(Outcome::Accepted, ControlCode::Ack)
            }
            PacketState::Last => {
                let continues = self.in_progress
                    && self.last_accepted.map(|s| next_sequence(s, 1)) == Some(sequence);
                if self.in_progress && !continues {
                    // The sender gave up on the previous message part way.
                    tracing::debug!(
                        stale_bytes = self.buffer.len(),
                        "dropping unfinished message"
                    );
                    self.reset();
                }

                if !valid {
                    if continues {
                        self.reset();
                        return Verdict::reply(Outcome::Discarded, ControlCode::Ack);
                    }
                    // Single fragment: stay silent and let the sender time out.
                    return Verdict::silent(Outcome::ChecksumFailed);
                }

                let mut message: ByteMessage =
                    self.buffer.drain(..).chain(body.iter()).collect();
                message.inherit_metadata(&body);
                self.reset();
                Verdict {
                    outcome: Outcome::Completed,
                    reply: Some(ControlCode::Ack),
                    message: Some(message),
                }
            }
        }
    }

    fn reset(&mut self) {
        self.buffer.clear();
        self.in_progress = false;
        self.last_accepted = None;
    }
}
