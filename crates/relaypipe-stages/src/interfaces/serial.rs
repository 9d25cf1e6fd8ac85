//! Serial port interface.
//!
//! A serial line is a byte stream: reads return whatever has arrived, with
//! no message boundaries. Put a [`FramingStage`](crate::FramingStage) on top
//! to carry messages over it.

use std::io;
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use relaypipe_core::ByteMessage;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_serial::{SerialPortBuilderExt, SerialStream};

use crate::stage::{lock, Stage, StageCore, StageError};

pub const DEFAULT_BAUD: u32 = 115_200;

const READ_BUFFER: usize = 4096;

pub struct SerialInterface {
    core: StageCore,
    /// The open port, until `start` splits it between the loops.
    port: Mutex<Option<SerialStream>>,
    outbound_tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Bytes>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: broadcast::Sender<()>,
}

impl SerialInterface {
    /// Open `path` at `baud`, 8N1. Must be called from within a tokio
    /// runtime.
    pub fn open(path: &str, baud: u32) -> io::Result<Arc<Self>> {
        let port = tokio_serial::new(path, baud).open_native_async()?;
        tracing::info!(path, baud, "serial port opened");
        Ok(Self::from_stream(format!("serial:{path}"), port))
    }

    /// Wrap an already open port.
    pub fn from_stream(name: impl Into<String>, port: SerialStream) -> Arc<Self> {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = broadcast::channel(1);
        Arc::new(Self {
            core: StageCore::new(name),
            port: Mutex::new(Some(port)),
            outbound_tx: Mutex::new(Some(outbound_tx)),
            outbound_rx: Mutex::new(Some(outbound_rx)),
            tasks: Mutex::new(Vec::new()),
            shutdown,
        })
    }

    fn closed_error(&self) -> StageError {
        StageError::Closed(self.core.name().to_string())
    }
}

impl Stage for SerialInterface {
    fn core(&self) -> &StageCore {
        &self.core
    }

    fn is_interface(&self) -> bool {
        true
    }

    fn handle_transmit(&self, msg: ByteMessage) -> Result<(), StageError> {
        let outbound = lock(&self.outbound_tx).clone();
        let Some(outbound) = outbound else {
            return Err(self.closed_error());
        };
        outbound
            .send(msg.to_bytes())
            .map_err(|_| self.closed_error())
    }

    fn start(self: Arc<Self>) -> Result<(), StageError> {
        let runtime =
            Handle::try_current().map_err(|_| StageError::NoRuntime(self.core.name().to_string()))?;
        let Some(port) = lock(&self.port).take() else {
            return Ok(());
        };
        let Some(outbound) = lock(&self.outbound_rx).take() else {
            return Err(self.closed_error());
        };
        let (rx, tx) = tokio::io::split(port);
        let read = runtime.spawn(read_loop(
            Arc::downgrade(&self),
            rx,
            self.shutdown.subscribe(),
        ));
        let write = runtime.spawn(write_loop(
            Arc::downgrade(&self),
            tx,
            outbound,
            self.shutdown.subscribe(),
        ));
        lock(&self.tasks).extend([read, write]);
        Ok(())
    }

    fn shutdown(&self) {
        let _ = self.shutdown.send(());
        lock(&self.outbound_tx).take();
        lock(&self.outbound_rx).take();
        lock(&self.port).take();
    }

    fn take_tasks(&self) -> Vec<JoinHandle<()>> {
        std::mem::take(&mut *lock(&self.tasks))
    }
}

async fn read_loop(
    stage: Weak<SerialInterface>,
    mut rx: ReadHalf<SerialStream>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut buf = vec![0u8; READ_BUFFER];
    loop {
        let result = tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("serial reader shutting down");
                return;
            }
            r = rx.read(&mut buf) => r,
        };
        let Some(stage) = stage.upgrade() else { return };
        match result {
            Ok(0) => {
                let hangup = io::Error::new(io::ErrorKind::UnexpectedEof, "serial port closed");
                stage.core().mark_broken(hangup.into());
                return;
            }
            Ok(n) => {
                tracing::trace!(stage = %stage.name(), len = n, "serial bytes received");
                if let Err(e) = stage.deliver(ByteMessage::from(&buf[..n])) {
                    tracing::warn!(stage = %stage.name(), error = %e, "serial bytes not delivered");
                }
            }
            Err(e) => {
                stage.core().mark_broken(e.into());
                return;
            }
        }
    }
}

async fn write_loop(
    stage: Weak<SerialInterface>,
    mut tx: WriteHalf<SerialStream>,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        let bytes = tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("serial writer shutting down");
                return;
            }
            next = outbound.recv() => match next {
                Some(bytes) => bytes,
                None => return,
            },
        };
        let result = match tx.write_all(&bytes).await {
            Ok(()) => tx.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            if let Some(stage) = stage.upgrade() {
                stage.core().mark_broken(e.into());
            }
            return;
        }
    }
}
