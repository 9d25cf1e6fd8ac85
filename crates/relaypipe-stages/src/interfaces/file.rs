//! File-backed interfaces: a reader that delivers a file's contents up the
//! chain in fixed-size blocks, and a writer that appends every transmitted
//! message to a file.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use relaypipe_core::ByteMessage;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::stage::{lock, Stage, StageCore, StageError};

/// Bytes per message delivered by [`FileInputInterface`].
pub const FILE_READ_BLOCK: usize = 1024;

// ── Input ─────────────────────────────────────────────────────────────────────

pub struct FileInputInterface {
    core: StageCore,
    path: PathBuf,
    started: AtomicBool,
    reader: Mutex<Option<JoinHandle<()>>>,
    shutdown: broadcast::Sender<()>,
}

impl FileInputInterface {
    /// Nothing is read until the chain is started.
    pub fn open(path: impl Into<PathBuf>) -> Arc<Self> {
        let path = path.into();
        let (shutdown, _) = broadcast::channel(1);
        Arc::new(Self {
            core: StageCore::new(format!("file_in:{}", path.display())),
            path,
            started: AtomicBool::new(false),
            reader: Mutex::new(None),
            shutdown,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Stage for FileInputInterface {
    fn core(&self) -> &StageCore {
        &self.core
    }

    fn is_interface(&self) -> bool {
        true
    }

    fn handle_transmit(&self, _msg: ByteMessage) -> Result<(), StageError> {
        Err(StageError::Unsupported(format!(
            "{} is receive-only",
            self.core.name()
        )))
    }

    fn start(self: Arc<Self>) -> Result<(), StageError> {
        let runtime =
            Handle::try_current().map_err(|_| StageError::NoRuntime(self.core.name().to_string()))?;
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let task = runtime.spawn(read_loop(
            Arc::downgrade(&self),
            self.path.clone(),
            self.shutdown.subscribe(),
        ));
        *lock(&self.reader) = Some(task);
        Ok(())
    }

    fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    fn take_tasks(&self) -> Vec<JoinHandle<()>> {
        lock(&self.reader).take().into_iter().collect()
    }
}

async fn read_loop(
    stage: Weak<FileInputInterface>,
    path: PathBuf,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut file = match tokio::fs::File::open(&path).await {
        Ok(f) => f,
        Err(e) => {
            if let Some(stage) = stage.upgrade() {
                stage.core().mark_broken(e.into());
            }
            return;
        }
    };

    let mut buf = vec![0u8; FILE_READ_BLOCK];
    let mut total = 0usize;
    loop {
        let result = tokio::select! {
            _ = shutdown.recv() => return,
            r = file.read(&mut buf) => r,
        };
        let Some(stage) = stage.upgrade() else { return };
        match result {
            Ok(0) => {
                tracing::info!(path = %path.display(), bytes = total, "end of file");
                return;
            }
            Ok(n) => {
                total += n;
                if let Err(e) = stage.deliver(ByteMessage::from(&buf[..n])) {
                    tracing::warn!(error = %e, "file block not delivered");
                }
            }
            Err(e) => {
                stage.core().mark_broken(e.into());
                return;
            }
        }
    }
}

// ── Output ────────────────────────────────────────────────────────────────────

pub struct FileOutputInterface {
    core: StageCore,
    path: PathBuf,
    /// Queue to the writer task. Dropped on shutdown, which lets the writer
    /// drain what is queued, sync, and close the file.
    outbound: Mutex<Option<mpsc::UnboundedSender<ByteMessage>>>,
    /// The file and the queue's receiving end, until `start` hands them to
    /// the writer.
    pending: Mutex<Option<(tokio::fs::File, mpsc::UnboundedReceiver<ByteMessage>)>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl FileOutputInterface {
    /// Create (or truncate) `path`. Messages transmitted before the chain
    /// is started are queued.
    pub fn create(path: impl Into<PathBuf>) -> io::Result<Arc<Self>> {
        let path = path.into();
        let file = tokio::fs::File::from_std(std::fs::File::create(&path)?);
        let (outbound, queue) = mpsc::unbounded_channel();
        Ok(Arc::new(Self {
            core: StageCore::new(format!("file_out:{}", path.display())),
            path,
            outbound: Mutex::new(Some(outbound)),
            pending: Mutex::new(Some((file, queue))),
            writer: Mutex::new(None),
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

}

impl Stage for FileOutputInterface {
    fn core(&self) -> &StageCore {
        &self.core
    }

    fn is_interface(&self) -> bool {
        true
    }

    fn handle_transmit(&self, msg: ByteMessage) -> Result<(), StageError> {
        let outbound = lock(&self.outbound).clone();
        let closed = || StageError::Closed(self.core.name().to_string());
        outbound.ok_or_else(closed)?.send(msg).map_err(|_| closed())
    }

    fn start(self: Arc<Self>) -> Result<(), StageError> {
        let runtime =
            Handle::try_current().map_err(|_| StageError::NoRuntime(self.core.name().to_string()))?;
        let Some((file, queue)) = lock(&self.pending).take() else {
            return Ok(());
        };
        let task = runtime.spawn(write_loop(
            Arc::downgrade(&self),
            self.path.clone(),
            file,
            queue,
        ));
        *lock(&self.writer) = Some(task);
        Ok(())
    }

    fn shutdown(&self) {
        lock(&self.outbound).take();
        // Never started: nobody else holds the file.
        lock(&self.pending).take();
    }

    /// The writer finishes once everything queued before shutdown is
    /// written and the file is closed.
    fn take_tasks(&self) -> Vec<JoinHandle<()>> {
        lock(&self.writer).take().into_iter().collect()
    }
}

async fn write_loop(
    stage: Weak<FileOutputInterface>,
    path: PathBuf,
    mut file: tokio::fs::File,
    mut queue: mpsc::UnboundedReceiver<ByteMessage>,
) {
    let mut written = 0usize;
    while let Some(msg) = queue.recv().await {
        let bytes = msg.to_vec();
        let result = match file.write_all(&bytes).await {
            Ok(()) => file.flush().await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => written += bytes.len(),
            Err(e) => {
                // Keep draining: a broken stage refuses new messages until
                // it is reset, and a reset stage can write again.
                if let Some(stage) = stage.upgrade() {
                    stage.core().mark_broken(e.into());
                }
            }
        }
    }
    if let Err(e) = file.sync_all().await {
        tracing::warn!(path = %path.display(), error = %e, "sync on close failed");
    }
    tracing::debug!(path = %path.display(), bytes = written, "file output closed");
}
