//! In-process link. Two paired interfaces behave like the ends of a wire;
//! an echo interface is wired to itself.
//!
//! Delivery always happens on the receiving interface's own task, never
//! inside the sender's `transmit` call, so a reply sent from within
//! `deliver` cannot re-enter the stage that is still sending.

use std::io;
use std::sync::{Arc, Mutex, Weak};

use relaypipe_core::ByteMessage;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::stage::{lock, Stage, StageCore, StageError};

/// Decides whether an outbound message is lost on the wire (`true` = drop).
pub type DropFilter = Box<dyn FnMut(&ByteMessage) -> bool + Send>;

pub struct LoopbackInterface {
    core: StageCore,
    mtu: Option<usize>,
    inbox_tx: mpsc::UnboundedSender<ByteMessage>,
    inbox_rx: Mutex<Option<mpsc::UnboundedReceiver<ByteMessage>>>,
    /// Inbox of whoever receives what we transmit.
    outbox: Mutex<Option<mpsc::UnboundedSender<ByteMessage>>>,
    drop_filter: Mutex<Option<DropFilter>>,
    wiretap: Mutex<Option<Vec<ByteMessage>>>,
    delivery: Mutex<Option<JoinHandle<()>>>,
    shutdown: broadcast::Sender<()>,
}

impl LoopbackInterface {
    fn unlinked(name: &str, mtu: Option<usize>) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = broadcast::channel(1);
        Self {
            core: StageCore::new(name),
            mtu,
            inbox_tx,
            inbox_rx: Mutex::new(Some(inbox_rx)),
            outbox: Mutex::new(None),
            drop_filter: Mutex::new(None),
            wiretap: Mutex::new(None),
            delivery: Mutex::new(None),
            shutdown,
        }
    }

    /// Two interfaces wired to each other.
    pub fn pair(mtu: Option<usize>) -> (Arc<Self>, Arc<Self>) {
        let a = Self::unlinked("loopback-a", mtu);
        let b = Self::unlinked("loopback-b", mtu);
        *lock(&a.outbox) = Some(b.inbox_tx.clone());
        *lock(&b.outbox) = Some(a.inbox_tx.clone());
        (Arc::new(a), Arc::new(b))
    }

    /// An interface that delivers everything it transmits back to itself.
    pub fn echo(mtu: Option<usize>) -> Arc<Self> {
        let echo = Self::unlinked("loopback-echo", mtu);
        *lock(&echo.outbox) = Some(echo.inbox_tx.clone());
        Arc::new(echo)
    }

    /// Install a loss model for outbound traffic.
    pub fn set_drop_filter(&self, filter: impl FnMut(&ByteMessage) -> bool + Send + 'static) {
        *lock(&self.drop_filter) = Some(Box::new(filter));
    }

    pub fn clear_drop_filter(&self) {
        lock(&self.drop_filter).take();
    }

    /// Start recording every transmitted message, dropped ones included.
    pub fn enable_wiretap(&self) {
        lock(&self.wiretap).get_or_insert_with(Vec::new);
    }

    pub fn transmitted(&self) -> Vec<ByteMessage> {
        lock(&self.wiretap).clone().unwrap_or_default()
    }

    /// Cut the wire. Every later transmit fails with an I/O error.
    pub fn sever(&self) {
        lock(&self.outbox).take();
    }
}

impl Stage for LoopbackInterface {
    fn core(&self) -> &StageCore {
        &self.core
    }

    fn is_interface(&self) -> bool {
        true
    }

    fn mtu(&self) -> Option<usize> {
        self.mtu
    }

    fn handle_transmit(&self, msg: ByteMessage) -> Result<(), StageError> {
        if let Some(mtu) = self.mtu {
            if msg.len() > mtu {
                return Err(StageError::MtuExceeded { len: msg.len(), mtu });
            }
        }
        if let Some(tap) = lock(&self.wiretap).as_mut() {
            tap.push(msg.copy());
        }
        if lock(&self.drop_filter).as_mut().is_some_and(|filter| filter(&msg)) {
            tracing::trace!(stage = %self.core.name(), len = msg.len(), "message lost on the wire");
            return Ok(());
        }

        let outbox = lock(&self.outbox).clone();
        let Some(outbox) = outbox else {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "loopback link severed").into());
        };
        outbox
            .send(msg)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "loopback peer is gone").into())
    }

    fn start(self: Arc<Self>) -> Result<(), StageError> {
        let runtime =
            Handle::try_current().map_err(|_| StageError::NoRuntime(self.core.name().to_string()))?;
        let Some(inbox) = lock(&self.inbox_rx).take() else {
            return Ok(());
        };
        let task = runtime.spawn(delivery_loop(
            Arc::downgrade(&self),
            inbox,
            self.shutdown.subscribe(),
        ));
        *lock(&self.delivery) = Some(task);
        Ok(())
    }

    fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    fn take_tasks(&self) -> Vec<JoinHandle<()>> {
        lock(&self.delivery).take().into_iter().collect()
    }
}

async fn delivery_loop(
    stage: Weak<LoopbackInterface>,
    mut inbox: mpsc::UnboundedReceiver<ByteMessage>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::debug!("loopback delivery stopped");
                return;
            }

            msg = inbox.recv() => {
                let Some(msg) = msg else { return };
                let Some(stage) = stage.upgrade() else { return };
                if let Err(e) = stage.deliver(msg) {
                    tracing::warn!(stage = %stage.name(), error = %e, "inbound message not delivered");
                }
            }
        }
    }
}
