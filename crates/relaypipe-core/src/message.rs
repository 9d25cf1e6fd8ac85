//! ByteMessage — the unit of exchange between every pipeline stage.
//!
//! A message is an ordered byte sequence that can grow and shrink at both
//! ends in O(1), so stages can prefix headers and strip trailers without
//! copying the payload. Alongside the bytes it carries a small `port` tag
//! used for multiplexing, a creation timestamp, and an untyped annotation
//! (a destination address, a topic string, ...).

use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;

/// Untyped side-channel value attached to a message.
pub type Annotation = Arc<dyn Any + Send + Sync>;

#[derive(Clone)]
pub struct ByteMessage {
    data: VecDeque<u8>,
    port: u8,
    annotation: Option<Annotation>,
    created_at: SystemTime,
}

impl ByteMessage {
    pub fn new() -> Self {
        Self::from_deque(VecDeque::new())
    }

    fn from_deque(data: VecDeque<u8>) -> Self {
        Self {
            data,
            port: 0,
            annotation: None,
            created_at: SystemTime::now(),
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self::from_deque(VecDeque::with_capacity(capacity))
    }

    /// Deep copy. The returned message owns its own byte storage; mutating
    /// either one never affects the other. Tag, annotation and timestamp
    /// are carried over.
    pub fn copy(&self) -> Self {
        self.clone()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn push_front(&mut self, byte: u8) {
        self.data.push_front(byte);
    }

    pub fn push_back(&mut self, byte: u8) {
        self.data.push_back(byte);
    }

    pub fn extend_back(&mut self, bytes: &[u8]) {
        self.data.extend(bytes.iter().copied());
    }

    /// Remove and return the first byte.
    ///
    /// # Panics
    /// Panics if the message is empty. Use [`try_pop_front`](Self::try_pop_front)
    /// when the length has not been checked.
    pub fn pop_front(&mut self) -> u8 {
        self.data
            .pop_front()
            .expect("pop_front called on an empty ByteMessage")
    }

    /// Remove and return the last byte.
    ///
    /// # Panics
    /// Panics if the message is empty.
    pub fn pop_back(&mut self) -> u8 {
        self.data
            .pop_back()
            .expect("pop_back called on an empty ByteMessage")
    }

    pub fn try_pop_front(&mut self) -> Option<u8> {
        self.data.pop_front()
    }

    pub fn try_pop_back(&mut self) -> Option<u8> {
        self.data.pop_back()
    }

    /// Remove up to `n` bytes from the front and return them in their
    /// original order. Takes `min(n, len)` bytes; never fails.
    pub fn pop_front_n(&mut self, n: usize) -> Vec<u8> {
        let take = n.min(self.data.len());
        self.data.drain(..take).collect()
    }

    pub fn front(&self) -> Option<u8> {
        self.data.front().copied()
    }

    pub fn back(&self) -> Option<u8> {
        self.data.back().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = u8> + '_ {
        self.data.iter().copied()
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.data.iter().copied().collect()
    }

    /// Contiguous snapshot of the payload, for handing to socket and file
    /// writers.
    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.to_vec())
    }

    pub fn port(&self) -> u8 {
        self.port
    }

    pub fn set_port(&mut self, port: u8) {
        self.port = port;
    }

    pub fn with_port(mut self, port: u8) -> Self {
        self.port = port;
        self
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    pub fn annotation(&self) -> Option<&Annotation> {
        self.annotation.as_ref()
    }

    /// Typed view of the annotation, if one is set and has type `T`.
    pub fn annotation_as<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.annotation.as_deref().and_then(|a| a.downcast_ref::<T>())
    }

    pub fn set_annotation<T: Any + Send + Sync>(&mut self, value: T) {
        self.annotation = Some(Arc::new(value));
    }

    pub fn with_annotation<T: Any + Send + Sync>(mut self, value: T) -> Self {
        self.set_annotation(value);
        self
    }

    pub fn clear_annotation(&mut self) {
        self.annotation = None;
    }

    /// Take port and annotation from `other`. Used when a stage builds a
    /// new message (a fragment, a reply, a reassembled payload) that must
    /// keep routing to the same place.
    pub fn inherit_metadata(&mut self, other: &ByteMessage) {
        self.port = other.port;
        self.annotation = other.annotation.clone();
    }
}

impl Default for ByteMessage {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Vec<u8>> for ByteMessage {
    fn from(v: Vec<u8>) -> Self {
        Self::from_deque(VecDeque::from(v))
    }
}

impl From<&[u8]> for ByteMessage {
    fn from(s: &[u8]) -> Self {
        Self::from_deque(s.iter().copied().collect())
    }
}

impl<const N: usize> From<[u8; N]> for ByteMessage {
    fn from(a: [u8; N]) -> Self {
        Self::from_deque(VecDeque::from(a.to_vec()))
    }
}

impl From<Bytes> for ByteMessage {
    fn from(b: Bytes) -> Self {
        Self::from(b.as_ref())
    }
}

impl FromIterator<u8> for ByteMessage {
    fn from_iter<I: IntoIterator<Item = u8>>(iter: I) -> Self {
        Self::from_deque(iter.into_iter().collect())
    }
}

impl PartialEq for ByteMessage {
    /// Messages compare by content and port; timestamp and annotation are
    /// metadata and do not participate.
    fn eq(&self, other: &Self) -> bool {
        self.port == other.port && self.data == other.data
    }
}

impl Eq for ByteMessage {}

impl fmt::Debug for ByteMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteMessage")
            .field("port", &self.port)
            .field("len", &self.data.len())
            .field("data", &hex::encode(self.to_vec()))
            .field("annotated", &self.annotation.is_some())
            .finish()
    }
}

impl fmt::Display for ByteMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:[{}]", self.port, hex::encode_upper(self.to_vec()))
    }
}
