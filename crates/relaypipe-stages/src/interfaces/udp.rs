//! UDP transceiver: one datagram per message.
//!
//! Inbound datagrams are delivered with the sender's `SocketAddr` as the
//! message annotation. Outbound messages go to the address in their
//! annotation if there is one, otherwise to the configured remote, so a
//! reply built from an inbound message finds its way back.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use relaypipe_core::ByteMessage;
use tokio::net::UdpSocket;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::stage::{lock, Stage, StageCore, StageError};

/// Largest UDP payload over IPv4.
pub const MAX_DATAGRAM: usize = 65_507;

type Outgoing = (Bytes, SocketAddr);

pub struct UdpTransceiver {
    core: StageCore,
    /// Released on shutdown; the loops hold their own clones until they stop.
    socket: Mutex<Option<Arc<UdpSocket>>>,
    local: SocketAddr,
    remote: Option<SocketAddr>,
    outbound_tx: Mutex<Option<mpsc::UnboundedSender<Outgoing>>>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Outgoing>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: broadcast::Sender<()>,
}

impl UdpTransceiver {
    pub async fn bind(local: SocketAddr, remote: Option<SocketAddr>) -> io::Result<Arc<Self>> {
        let socket = UdpSocket::bind(local).await?;
        let local = socket.local_addr()?;
        tracing::info!(%local, ?remote, "udp transceiver bound");

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = broadcast::channel(1);
        Ok(Arc::new(Self {
            core: StageCore::new(format!("udp:{local}")),
            socket: Mutex::new(Some(Arc::new(socket))),
            local,
            remote,
            outbound_tx: Mutex::new(Some(outbound_tx)),
            outbound_rx: Mutex::new(Some(outbound_rx)),
            tasks: Mutex::new(Vec::new()),
            shutdown,
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn remote(&self) -> Option<SocketAddr> {
        self.remote
    }

    fn closed_error(&self) -> StageError {
        StageError::Closed(self.core.name().to_string())
    }
}

impl Stage for UdpTransceiver {
    fn core(&self) -> &StageCore {
        &self.core
    }

    fn is_interface(&self) -> bool {
        true
    }

    fn mtu(&self) -> Option<usize> {
        Some(MAX_DATAGRAM)
    }

    fn handle_transmit(&self, msg: ByteMessage) -> Result<(), StageError> {
        if msg.len() > MAX_DATAGRAM {
            return Err(StageError::MtuExceeded {
                len: msg.len(),
                mtu: MAX_DATAGRAM,
            });
        }
        let dest = msg
            .annotation_as::<SocketAddr>()
            .copied()
            .or(self.remote)
            .ok_or(StageError::Unroutable)?;
        let outbound = lock(&self.outbound_tx).clone();
        let Some(outbound) = outbound else {
            return Err(self.closed_error());
        };
        outbound
            .send((msg.to_bytes(), dest))
            .map_err(|_| self.closed_error())
    }

    fn start(self: Arc<Self>) -> Result<(), StageError> {
        let runtime =
            Handle::try_current().map_err(|_| StageError::NoRuntime(self.core.name().to_string()))?;
        let Some(socket) = lock(&self.socket).clone() else {
            return Err(self.closed_error());
        };
        let Some(outbound) = lock(&self.outbound_rx).take() else {
            return Ok(());
        };
        let recv = runtime.spawn(recv_loop(
            Arc::downgrade(&self),
            socket.clone(),
            self.shutdown.subscribe(),
        ));
        let send = runtime.spawn(send_loop(
            Arc::downgrade(&self),
            socket,
            outbound,
            self.shutdown.subscribe(),
        ));
        lock(&self.tasks).extend([recv, send]);
        Ok(())
    }

    fn shutdown(&self) {
        let _ = self.shutdown.send(());
        lock(&self.outbound_tx).take();
        lock(&self.outbound_rx).take();
        if lock(&self.socket).take().is_some() {
            tracing::debug!(local = %self.local, "udp socket released");
        }
    }

    fn take_tasks(&self) -> Vec<JoinHandle<()>> {
        std::mem::take(&mut *lock(&self.tasks))
    }
}

async fn recv_loop(
    stage: Weak<UdpTransceiver>,
    socket: Arc<UdpSocket>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM + 1];
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("udp receiver shutting down");
                return;
            }

            result = socket.recv_from(&mut buf) => {
                let Some(stage) = stage.upgrade() else { return };
                let (len, from) = match result {
                    Ok(r) => r,
                    // ICMP port unreachable from an earlier send; the
                    // socket itself is fine.
                    Err(e) if e.kind() == io::ErrorKind::ConnectionReset
                        || e.kind() == io::ErrorKind::ConnectionRefused =>
                    {
                        tracing::debug!(error = %e, "peer unreachable");
                        continue;
                    }
                    Err(e) => {
                        stage.core().mark_broken(e.into());
                        return;
                    }
                };
                tracing::trace!(%from, len, "datagram received");
                let msg = ByteMessage::from(&buf[..len]).with_annotation(from);
                if let Err(e) = stage.deliver(msg) {
                    tracing::warn!(%from, error = %e, "inbound datagram not delivered");
                }
            }
        }
    }
}

async fn send_loop(
    stage: Weak<UdpTransceiver>,
    socket: Arc<UdpSocket>,
    mut outbound: mpsc::UnboundedReceiver<Outgoing>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("udp sender shutting down");
                return;
            }

            next = outbound.recv() => {
                let Some((payload, dest)) = next else { return };
                if let Err(e) = socket.send_to(&payload, dest).await {
                    if let Some(stage) = stage.upgrade() {
                        stage.core().mark_broken(e.into());
                    }
                    return;
                }
            }
        }
    }
}
