//! Splitting an outbound message into ARQ frames.

use relaypipe_core::wire::next_sequence;
use relaypipe_core::{checksum, ByteMessage, PacketHeader, PacketState};

/// One wire-ready fragment: `[header][payload][checksum]`.
#[derive(Debug, Clone)]
pub(crate) struct Frame {
    pub header: PacketHeader,
    pub bytes: ByteMessage,
}

/// Number of fragments `len` payload bytes need. Never zero: an empty
/// message still travels as one (empty) `Last` fragment.
pub(crate) fn fragment_count(len: usize, fragment_size: usize) -> usize {
    if len == 0 {
        1
    } else {
        (len + fragment_size - 1) / fragment_size
    }
}

/// Split `msg` into frames of at most `fragment_size` payload bytes.
///
/// Sequences start at `first_sequence` and advance by one per fragment.
/// A single fragment is sent as `Last`; longer messages are
/// `First, Middle.., Last`. Every frame keeps the message's port and
/// annotation so lower stages route it the same way.
pub(crate) fn fragment(msg: &ByteMessage, fragment_size: usize, first_sequence: u8) -> Vec<Frame> {
    let count = fragment_count(msg.len(), fragment_size);
    let mut remaining = msg.copy();

    (0..count)
        .map(|i| {
            let state = if i + 1 == count {
                PacketState::Last
            } else if i == 0 {
                PacketState::First
            } else {
                PacketState::Middle
            };
            let header = PacketHeader::payload(state, next_sequence(first_sequence, i));
            let chunk = remaining.pop_front_n(fragment_size);

            let mut bytes = ByteMessage::with_capacity(chunk.len() + 2);
            bytes.push_back(header.encode());
            bytes.extend_back(&chunk);
            bytes.push_back(checksum(chunk.iter().copied()));
            bytes.inherit_metadata(msg);

            Frame { header, bytes }
        })
        .collect()
}
