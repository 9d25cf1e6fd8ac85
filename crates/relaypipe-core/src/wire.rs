//! relaypipe ARQ wire format.
//!
//! Every frame produced by the reliable transport starts with one header
//! byte:
//!
//! ```text
//!   bit  7 6   5    4     3 2 1 0
//!       state  ctl  rsvd  sequence
//! ```
//!
//! Payload frames are `[header][payload..][checksum]`, control frames are
//! `[header][code]`. Changing any of this is a breaking change for every
//! peer on the link.

use std::fmt;

// ── Packet state ─────────────────────────────────────────────────────────────

/// Role of a fragment within its message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketState {
    /// First fragment of a multi-fragment message.
    First = 0,
    /// Interior fragment.
    Middle = 1,
    /// Final fragment, or the only fragment of a short message.
    Last = 2,
}

impl PacketState {
    /// Decode the two state bits. The unused combination `0b11` is read as
    /// `Last` so that every header byte decodes.
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => PacketState::First,
            1 => PacketState::Middle,
            _ => PacketState::Last,
        }
    }
}

// ── Header ────────────────────────────────────────────────────────────────────

const STATE_SHIFT: u8 = 6;
const CONTROL_BIT: u8 = 1 << 5;
const SEQUENCE_MASK: u8 = 0x0F;

/// Number of distinct sequence values (4-bit rolling counter).
pub const SEQUENCE_MODULUS: u8 = 16;

/// One-byte ARQ packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PacketHeader {
    state: PacketState,
    is_control: bool,
    sequence: u8,
}

impl PacketHeader {
    pub fn new(state: PacketState, is_control: bool, sequence: u8) -> Self {
        Self {
            state,
            is_control,
            sequence: sequence & SEQUENCE_MASK,
        }
    }

    /// Header for a payload fragment.
    pub fn payload(state: PacketState, sequence: u8) -> Self {
        Self::new(state, false, sequence)
    }

    /// Header for an ACK/NACK answering the fragment with `sequence`.
    pub fn control(sequence: u8) -> Self {
        Self::new(PacketState::First, true, sequence)
    }

    /// Total over all 256 values. Bit 4 is reserved and ignored.
    pub fn decode(byte: u8) -> Self {
        Self {
            state: PacketState::from_bits(byte >> STATE_SHIFT),
            is_control: byte & CONTROL_BIT != 0,
            sequence: byte & SEQUENCE_MASK,
        }
    }

    /// Encode to the wire byte. The reserved bit is always written as 0.
    pub fn encode(&self) -> u8 {
        let ctl = if self.is_control { CONTROL_BIT } else { 0 };
        ((self.state as u8) << STATE_SHIFT) | ctl | (self.sequence & SEQUENCE_MASK)
    }

    pub fn state(&self) -> PacketState {
        self.state
    }

    pub fn set_state(&mut self, state: PacketState) {
        self.state = state;
    }

    pub fn is_control(&self) -> bool {
        self.is_control
    }

    pub fn set_control(&mut self, is_control: bool) {
        self.is_control = is_control;
    }

    pub fn sequence(&self) -> u8 {
        self.sequence
    }

    /// Masks to 4 bits; out-of-range values wrap instead of being rejected.
    pub fn set_sequence(&mut self, sequence: u8) {
        self.sequence = sequence & SEQUENCE_MASK;
    }
}

impl From<u8> for PacketHeader {
    fn from(byte: u8) -> Self {
        Self::decode(byte)
    }
}

impl From<PacketHeader> for u8 {
    fn from(h: PacketHeader) -> u8 {
        h.encode()
    }
}

impl fmt::Display for PacketHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}{}#{}",
            self.state,
            if self.is_control { "/ctl" } else { "" },
            self.sequence
        )
    }
}

/// Advance a 4-bit sequence by `n`, wrapping mod 16.
pub fn next_sequence(sequence: u8, n: usize) -> u8 {
    ((sequence as usize + n) % SEQUENCE_MODULUS as usize) as u8
}

// ── Control codes ─────────────────────────────────────────────────────────────

/// Body byte of a control frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlCode {
    Ack = 0,
    Nack = 1,
}

impl TryFrom<u8> for ControlCode {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ControlCode::Ack),
            1 => Ok(ControlCode::Nack),
            other => Err(WireError::UnknownControlCode(other)),
        }
    }
}

impl From<ControlCode> for u8 {
    fn from(c: ControlCode) -> u8 {
        c as u8
    }
}

// ── Checksum ──────────────────────────────────────────────────────────────────

/// XOR applied to the byte sum.
pub const CHECKSUM_SEED: u8 = 0x55;

/// Bytes the reliable transport adds around each fragment payload
/// (header + checksum).
pub const FRAME_OVERHEAD: usize = 2;

/// Byte-wise sum modulo 256, XORed with [`CHECKSUM_SEED`].
///
/// A weak integrity check against line noise, not a cryptographic one:
/// swapping two bytes, or a +1/-1 pair of changes, leaves it unchanged.
/// Any single-byte change is always detected.
pub fn checksum<I>(bytes: I) -> u8
where
    I: IntoIterator<Item = u8>,
{
    bytes.into_iter().fold(0u8, |sum, b| sum.wrapping_add(b)) ^ CHECKSUM_SEED
}

// ── Frames ────────────────────────────────────────────────────────────────────

/// Encode a control frame acknowledging (or rejecting) `sequence`.
pub fn control_frame(sequence: u8, code: ControlCode) -> [u8; 2] {
    [PacketHeader::control(sequence).encode(), code.into()]
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("frame too short: {0} bytes")]
    Truncated(usize),

    #[error("unknown control code: 0x{0:02x}")]
    UnknownControlCode(u8),

    #[error("checksum mismatch: expected 0x{expected:02x}, got 0x{actual:02x}")]
    ChecksumMismatch { expected: u8, actual: u8 },
}

// ── Tests ─────────────────────────────────────────────────────────────────────
