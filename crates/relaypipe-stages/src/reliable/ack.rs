//! Single-slot rendezvous between the send worker, waiting for a reply to
//! the fragment it just sent, and the inbound path that receives it.

use std::sync::Mutex;

use relaypipe_core::ControlCode;
use tokio::sync::oneshot;

use crate::stage::lock;

struct PendingAck {
    sequence: u8,
    tx: oneshot::Sender<ControlCode>,
}

#[derive(Default)]
pub(crate) struct AckSlot {
    pending: Mutex<Option<PendingAck>>,
}

impl AckSlot {
    /// Wait for a reply to `sequence`. Replaces any earlier wait, whose
    /// receiver then sees the channel closed.
    pub(crate) fn arm(&self, sequence: u8) -> oneshot::Receiver<ControlCode> {
        let (tx, rx) = oneshot::channel();
        *lock(&self.pending) = Some(PendingAck { sequence, tx });
        rx
    }

    /// Hand `code` to the waiter if it is waiting on `sequence`. Returns
    /// false for a stale or unexpected reply, which is ignored.
    pub(crate) fn resolve(&self, sequence: u8, code: ControlCode) -> bool {
        let mut slot = lock(&self.pending);
        match slot.take() {
            Some(p) if p.sequence == sequence => p.tx.send(code).is_ok(),
            other => {
                *slot = other;
                false
            }
        }
    }

    pub(crate) fn disarm(&self) {
        lock(&self.pending).take();
    }
}
