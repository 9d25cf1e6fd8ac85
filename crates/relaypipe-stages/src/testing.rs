//! Test doubles shared by the unit tests in this crate.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use relaypipe_core::ByteMessage;

use crate::stage::{lock, Stage, StageCore, StageError};

/// Interface that records what it is asked to send.
pub(crate) struct Recorder {
    core: StageCore,
    sent: Mutex<Vec<ByteMessage>>,
    fail: AtomicBool,
}

impl Recorder {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            core: StageCore::new(name),
            sent: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
        }
    }

    pub(crate) fn sent(&self) -> Vec<ByteMessage> {
        lock(&self.sent).clone()
    }

    /// When set, every transmit fails with an I/O error.
    pub(crate) fn fail_with_io(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

impl Stage for Recorder {
    fn core(&self) -> &StageCore {
        &self.core
    }

    fn is_interface(&self) -> bool {
        true
    }

    fn handle_transmit(&self, msg: ByteMessage) -> Result<(), StageError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "link down").into());
        }
        lock(&self.sent).push(msg);
        Ok(())
    }
}

/// Stage with the default hooks only.
pub(crate) struct Passthrough {
    core: StageCore,
}

impl Passthrough {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            core: StageCore::new(name),
        }
    }
}

impl Stage for Passthrough {
    fn core(&self) -> &StageCore {
        &self.core
    }
}
