//! Stage abstraction: one processing step in a pipe chain.
//!
//! A chain is a doubly-linked list of stages. Outbound messages travel
//! down from the top stage towards the interface, inbound messages travel
//! up from the interface. Each stage holds its downward neighbor strongly
//! and its upward neighbor weakly, so whoever holds the top of the chain
//! keeps every stage alive and there is no ownership cycle.
//!
//! Stages are shared across tasks (`Arc<dyn Stage>`) and every entry point
//! takes `&self`; mutable state lives behind the stage's own locks. A stage
//! must never hold one of its locks while calling a neighbor.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak,
};

use relaypipe_core::config::DEFAULT_EVENT_QUEUE_LENGTH;
use relaypipe_core::ByteMessage;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Faults kept per stage before the oldest are discarded.
const MAX_RETAINED_FAULTS: usize = 256;

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Downward,
    Upward,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Downward => f.write_str("downward"),
            Direction::Upward => f.write_str("upward"),
        }
    }
}

/// Everything a stage operation can fail with.
///
/// Only [`Io`](StageError::Io) and [`Precondition`](StageError::Precondition)
/// are fatal: raised by a stage's own work they put that stage into the
/// broken state. The rest are reported to the caller and the stage keeps
/// running.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StageError {
    #[error("{stage}: {direction} neighbor already attached")]
    AlreadyAttached { stage: String, direction: Direction },

    #[error("invalid topology: {0}")]
    InvalidTopology(String),

    #[error("{0}: no downward neighbor")]
    NotLinked(String),

    #[error("pipe broken at {0}")]
    PipeBroken(String),

    #[error("message of {len} bytes exceeds mtu {mtu}")]
    MtuExceeded { len: usize, mtu: usize },

    #[error("fragment #{sequence} unacknowledged after {attempts} attempts")]
    RetriesExhausted { sequence: u8, attempts: u32 },

    #[error("{0}: stage is shut down")]
    Closed(String),

    #[error("{0}: no tokio runtime to run on")]
    NoRuntime(String),

    #[error("{0}")]
    Unsupported(String),

    #[error("no destination for outbound message")]
    Unroutable,

    #[error("i/o failure: {0}")]
    Io(Arc<io::Error>),

    #[error("precondition violated: {0}")]
    Precondition(String),
}

impl StageError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, StageError::Io(_) | StageError::Precondition(_))
    }
}

impl From<io::Error> for StageError {
    fn from(e: io::Error) -> Self {
        StageError::Io(Arc::new(e))
    }
}

/// An error together with the stage that raised it.
#[derive(Debug, Clone)]
pub struct Fault {
    pub stage: String,
    pub error: StageError,
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.stage, self.error)
    }
}

// ── Events ────────────────────────────────────────────────────────────────────

/// Published on a stage's event channel. Every stage re-publishes the
/// faults and broken-pipe notices of the stages below it, so subscribing
/// to the top of a chain sees everything.
#[derive(Debug, Clone)]
pub enum StageEvent {
    /// A message passed up through this stage.
    MessageAvailable(ByteMessage),
    Exception(Fault),
    /// `stage` entered the broken state. Sent once per transition.
    BrokenPipe { stage: String },
}

// ── Shared state ──────────────────────────────────────────────────────────────

/// Links, broken flag, fault log and event channel shared by every stage
/// implementation. Stages embed one and return it from [`Stage::core`].
pub struct StageCore {
    name: String,
    downward: RwLock<Option<Arc<dyn Stage>>>,
    upward: RwLock<Option<Weak<dyn Stage>>>,
    broken: AtomicBool,
    faults: Mutex<Vec<Fault>>,
    events: broadcast::Sender<StageEvent>,
}

impl StageCore {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_event_capacity(name, DEFAULT_EVENT_QUEUE_LENGTH)
    }

    /// `capacity` bounds the event queue; subscribers that fall behind
    /// lose the oldest events.
    pub fn with_event_capacity(name: impl Into<String>, capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            name: name.into(),
            downward: RwLock::new(None),
            upward: RwLock::new(None),
            broken: AtomicBool::new(false),
            faults: Mutex::new(Vec::new()),
            events,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn downward(&self) -> Option<Arc<dyn Stage>> {
        read(&self.downward).clone()
    }

    pub fn upward(&self) -> Option<Arc<dyn Stage>> {
        read(&self.upward).as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn set_downward(
        &self,
        stage: Arc<dyn Stage>,
        overwrite: bool,
    ) -> Result<(), StageError> {
        let mut slot = write(&self.downward);
        if slot.is_some() && !overwrite {
            return Err(StageError::AlreadyAttached {
                stage: self.name.clone(),
                direction: Direction::Downward,
            });
        }
        *slot = Some(stage);
        Ok(())
    }

    pub(crate) fn set_upward(
        &self,
        stage: &Arc<dyn Stage>,
        overwrite: bool,
    ) -> Result<(), StageError> {
        let mut slot = write(&self.upward);
        // A neighbor that has been dropped no longer counts as attached.
        let occupied = slot.as_ref().is_some_and(|w| w.strong_count() > 0);
        if occupied && !overwrite {
            return Err(StageError::AlreadyAttached {
                stage: self.name.clone(),
                direction: Direction::Upward,
            });
        }
        *slot = Some(Arc::downgrade(stage));
        Ok(())
    }

    pub(crate) fn detach_upward(&self) {
        write(&self.upward).take();
    }

    /// Hand `msg` to the downward neighbor's [`Stage::transmit`].
    ///
    /// A fatal error from the neighbor has already broken that neighbor;
    /// it comes back as [`StageError::PipeBroken`] so it does not break
    /// this stage too.
    pub fn forward_down(&self, msg: ByteMessage) -> Result<(), StageError> {
        match self.downward() {
            Some(down) => down.transmit(msg).map_err(|e| passed_through(&*down, e)),
            None => Err(StageError::NotLinked(self.name.clone())),
        }
    }

    /// Notify subscribers, then hand `msg` to the upward neighbor's
    /// [`Stage::deliver`]. With no upward neighbor the message ends here.
    pub fn forward_up(&self, msg: ByteMessage) -> Result<(), StageError> {
        if self.events.receiver_count() > 0 {
            self.publish(StageEvent::MessageAvailable(msg.copy()));
        }
        match self.upward() {
            Some(up) => up.deliver(msg).map_err(|e| passed_through(&*up, e)),
            None => Ok(()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StageEvent> {
        self.events.subscribe()
    }

    pub fn publish(&self, event: StageEvent) {
        // Err only means nobody is listening.
        let _ = self.events.send(event);
    }

    /// Record a non-fatal condition on this stage and everything above it.
    pub fn report_exception(&self, error: StageError) {
        self.record(Fault {
            stage: self.name.clone(),
            error,
        });
    }

    fn record(&self, fault: Fault) {
        {
            let mut faults = lock(&self.faults);
            if faults.len() >= MAX_RETAINED_FAULTS {
                faults.remove(0);
            }
            faults.push(fault.clone());
        }
        self.publish(StageEvent::Exception(fault.clone()));
        if let Some(up) = self.upward() {
            up.core().record(fault);
        }
    }

    /// Drain the faults recorded here (including those propagated from
    /// below), oldest first.
    pub fn take_exceptions(&self) -> Vec<Fault> {
        std::mem::take(&mut *lock(&self.faults))
    }

    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::SeqCst)
    }

    /// Enter the broken state: further transmit/deliver calls fail with
    /// [`StageError::PipeBroken`] until [`reset`](Self::reset). The error is
    /// recorded and a single `BrokenPipe` event travels up the chain.
    pub fn mark_broken(&self, error: StageError) {
        if self.broken.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::error!(stage = %self.name, error = %error, "pipe broken");
        self.report_exception(error);
        self.announce_broken(&self.name);
    }

    fn announce_broken(&self, origin: &str) {
        self.publish(StageEvent::BrokenPipe {
            stage: origin.to_string(),
        });
        if let Some(up) = self.upward() {
            up.core().announce_broken(origin);
        }
    }

    /// Leave the broken state. Recorded faults are kept.
    pub fn reset(&self) {
        if self.broken.swap(false, Ordering::SeqCst) {
            tracing::info!(stage = %self.name, "pipe reset");
        }
    }

    pub(crate) fn ensure_open(&self) -> Result<(), StageError> {
        if self.is_broken() {
            Err(StageError::PipeBroken(self.name.clone()))
        } else {
            Ok(())
        }
    }

    /// Break this stage if `error` is fatal. Returns the error unchanged.
    pub fn escalate(&self, error: StageError) -> StageError {
        if error.is_fatal() {
            self.mark_broken(error.clone());
        }
        error
    }
}

impl fmt::Debug for StageCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageCore")
            .field("name", &self.name)
            .field("broken", &self.is_broken())
            .field("has_downward", &read(&self.downward).is_some())
            .field("has_upward", &self.upward().is_some())
            .finish()
    }
}

// ── Stage trait ───────────────────────────────────────────────────────────────

/// One element of a pipe chain.
///
/// Implementors provide [`core`](Stage::core) and override the
/// `handle_*` hooks for their own processing. The provided
/// [`transmit`](Stage::transmit) and [`deliver`](Stage::deliver) wrap the
/// hooks with the broken-state gate and should not be overridden.
pub trait Stage: Send + Sync + 'static {
    fn core(&self) -> &StageCore;

    fn name(&self) -> &str {
        self.core().name()
    }

    /// Interfaces sit at the bottom of a chain and perform real I/O. They
    /// have no downward neighbor.
    fn is_interface(&self) -> bool {
        false
    }

    /// Largest message this stage accepts on transmit, if bounded.
    fn mtu(&self) -> Option<usize> {
        None
    }

    /// Outbound processing. The default passes the message down unchanged.
    fn handle_transmit(&self, msg: ByteMessage) -> Result<(), StageError> {
        self.core().forward_down(msg)
    }

    /// Inbound processing. The default passes the message up unchanged.
    fn handle_deliver(&self, msg: ByteMessage) -> Result<(), StageError> {
        self.core().forward_up(msg)
    }

    /// Spawn background workers. Called once the chain is assembled, from
    /// within a tokio runtime.
    fn start(self: Arc<Self>) -> Result<(), StageError> {
        Ok(())
    }

    /// Stop background workers and release OS resources. Idempotent.
    fn shutdown(&self) {}

    /// Hand over the stage's background tasks, once, so a caller can wait
    /// for them to finish after [`shutdown`](Self::shutdown).
    fn take_tasks(&self) -> Vec<JoinHandle<()>> {
        Vec::new()
    }

    fn transmit(&self, msg: ByteMessage) -> Result<(), StageError> {
        let core = self.core();
        core.ensure_open()?;
        self.handle_transmit(msg).map_err(|e| core.escalate(e))
    }

    fn deliver(&self, msg: ByteMessage) -> Result<(), StageError> {
        let core = self.core();
        core.ensure_open()?;
        self.handle_deliver(msg).map_err(|e| core.escalate(e))
    }

    fn attach_downward(&self, stage: Arc<dyn Stage>, overwrite: bool) -> Result<(), StageError> {
        if self.is_interface() {
            return Err(StageError::InvalidTopology(format!(
                "interface {} cannot have a downward neighbor",
                self.name()
            )));
        }
        self.core().set_downward(stage, overwrite)
    }

    fn attach_upward(&self, stage: &Arc<dyn Stage>, overwrite: bool) -> Result<(), StageError> {
        self.core().set_upward(stage, overwrite)
    }

    fn is_broken(&self) -> bool {
        self.core().is_broken()
    }
}

fn passed_through(neighbor: &dyn Stage, error: StageError) -> StageError {
    if error.is_fatal() {
        StageError::PipeBroken(neighbor.name().to_string())
    } else {
        error
    }
}

// ── Lock helpers ──────────────────────────────────────────────────────────────
//
// Stage state stays consistent across a panicking holder (every critical
// section is a plain read or assignment), so poisoning is ignored.

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(l: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(l: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(PoisonError::into_inner)
}
