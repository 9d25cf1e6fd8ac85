//! relaypipe integration test harness.
//!
//! End-to-end tests over whole chains: two chains joined by a loopback
//! pair or by real UDP sockets on 127.0.0.1, with faults injected on the
//! link. Nothing here needs root or network setup.
//!
//!   cargo test --test integration

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::broadcast;

use relaypipe_core::config::ReliableConfig;
use relaypipe_core::ByteMessage;
use relaypipe_stages::{Chain, Fault, LoopbackInterface, ReliableTransport, StageEvent};

mod failures;
mod fault;
mod framing;
mod reliable;
mod udp;

// ── Harness ───────────────────────────────────────────────────────────────────

/// Upper bound for anything a test waits on.
pub const WAIT: Duration = Duration::from_secs(5);

/// ARQ settings that keep retry-heavy tests fast.
pub fn fast_reliable(fragment_size: usize) -> ReliableConfig {
    ReliableConfig {
        fragment_size,
        ack_timeout_ms: 30,
        retry_budget: 10,
    }
}

/// Two started chains, each a reliable transport over one end of a
/// loopback pair.
pub struct ReliablePair {
    pub left: Chain,
    pub right: Chain,
    pub left_link: Arc<LoopbackInterface>,
    pub right_link: Arc<LoopbackInterface>,
    pub left_arq: Arc<ReliableTransport>,
    pub right_arq: Arc<ReliableTransport>,
}

pub fn reliable_pair(config: ReliableConfig) -> Result<ReliablePair> {
    let (left_link, right_link) = LoopbackInterface::pair(None);
    let left_arq = ReliableTransport::new(config.clone())?;
    let right_arq = ReliableTransport::new(config)?;

    let left = Chain::new()
        .with(left_link.clone())?
        .with(left_arq.clone())?;
    let right = Chain::new()
        .with(right_link.clone())?
        .with(right_arq.clone())?;
    left.start().context("failed to start left chain")?;
    right.start().context("failed to start right chain")?;

    Ok(ReliablePair {
        left,
        right,
        left_link,
        right_link,
        left_arq,
        right_arq,
    })
}

/// Next message delivered out of the top of `chain`'s event stream.
pub async fn next_message(events: &mut broadcast::Receiver<StageEvent>) -> Result<ByteMessage> {
    tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(StageEvent::MessageAvailable(msg)) => return Ok(msg),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => bail!("event stream closed"),
            }
        }
    })
    .await
    .context("timed out waiting for a message")?
}

/// Next fault published on `events`.
pub async fn next_fault(events: &mut broadcast::Receiver<StageEvent>) -> Result<Fault> {
    tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(StageEvent::Exception(fault)) => return Ok(fault),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => bail!("event stream closed"),
            }
        }
    })
    .await
    .context("timed out waiting for a fault")?
}

/// Deterministic test payload of `len` bytes.
pub fn payload(len: usize, seed: u8) -> ByteMessage {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

// ── Tests ─────────────────────────────────────────────────────────────────────

/// `[1,2,3]` with two-byte fragments: two frames out, two ACKs back, one
/// delivery.
#[tokio::test]
async fn test_three_bytes_over_two_byte_fragments() -> Result<()> {
    let pair = reliable_pair(ReliableConfig {
        fragment_size: 2,
        ..ReliableConfig::default()
    })?;
    pair.left_link.enable_wiretap();
    pair.right_link.enable_wiretap();
    let mut events = pair.right.subscribe()?;

    pair.left.transmit(ByteMessage::from([1u8, 2, 3]))?;
    let got = next_message(&mut events).await?;
    assert_eq!(got.to_vec(), vec![1, 2, 3]);

    // Give the final ACK time to land before inspecting the wire.
    tokio::time::timeout(WAIT, async {
        while pair.left_arq.stats().messages_sent == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await?;

    let frames = pair.left_link.transmitted();
    assert_eq!(frames.len(), 2, "frames: {frames:?}");
    let first = frames[0].to_vec();
    let last = frames[1].to_vec();
    assert_eq!(first[0] >> 6, 0, "first fragment state");
    assert_eq!(last[0] >> 6, 2, "last fragment state");
    assert_eq!(last[0] & 0x0F, (first[0].wrapping_add(1)) & 0x0F);
    assert_eq!(&first[1..3], &[1, 2]);
    assert_eq!(&last[1..2], &[3]);

    let acks = pair.right_link.transmitted();
    assert_eq!(acks.len(), 2, "acks: {acks:?}");
    assert_eq!(acks[0].to_vec(), vec![0x20 | (first[0] & 0x0F), 0x00]);
    assert_eq!(acks[1].to_vec(), vec![0x20 | (last[0] & 0x0F), 0x00]);

    assert_eq!(pair.right_arq.stats().messages_delivered, 1);
    Ok(())
}
