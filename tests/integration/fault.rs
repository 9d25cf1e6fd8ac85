use crate::*;
use std::sync::atomic::{AtomicUsize, Ordering};

// ── Fault guard ───────────────────────────────────────────────────────────────

/// Removes an injected link fault when dropped, even if the test panics.
/// Each fault helper returns one; bind it to a named variable.
pub struct FaultGuard {
    link: Arc<LoopbackInterface>,
}

impl Drop for FaultGuard {
    fn drop(&mut self) {
        self.link.clear_drop_filter();
    }
}

// ── Link faults ───────────────────────────────────────────────────────────────

/// Lose every `nth` message leaving `link`.
pub fn add_periodic_loss(link: &Arc<LoopbackInterface>, nth: usize) -> FaultGuard {
    let count = AtomicUsize::new(0);
    link.set_drop_filter(move |_| (count.fetch_add(1, Ordering::Relaxed) + 1) % nth == 0);
    FaultGuard { link: link.clone() }
}

/// Lose everything leaving `link`.
pub fn add_blackhole(link: &Arc<LoopbackInterface>) -> FaultGuard {
    link.set_drop_filter(|_| true);
    FaultGuard { link: link.clone() }
}

/// Lose the first copy of every distinct frame leaving `link`; repeats
/// get through.
pub fn add_loss_of_first_attempts(link: &Arc<LoopbackInterface>) -> FaultGuard {
    let mut seen = std::collections::HashSet::new();
    link.set_drop_filter(move |frame| seen.insert(frame.to_vec()));
    FaultGuard { link: link.clone() }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_lossy_data_path_still_delivers() -> Result<()> {
    let pair = reliable_pair(fast_reliable(8))?;
    let mut events = pair.right.subscribe()?;
    let _loss = add_periodic_loss(&pair.left_link, 3);

    let sent = payload(200, 3);
    pair.left.transmit(sent.copy())?;
    assert_eq!(next_message(&mut events).await?, sent);
    assert!(pair.left_arq.stats().retransmissions > 0);
    Ok(())
}

#[tokio::test]
async fn test_lossy_ack_path_does_not_duplicate_bytes() -> Result<()> {
    let pair = reliable_pair(fast_reliable(8))?;
    let mut events = pair.right.subscribe()?;
    // Only ACKs leave the right side, so this loses every other ACK.
    let _loss = add_periodic_loss(&pair.right_link, 2);

    // Eight fragments: every one after the first loses its first ACK.
    let sent = payload(63, 9);
    pair.left.transmit(sent.copy())?;
    let got = next_message(&mut events).await?;
    assert_eq!(got.len(), sent.len());
    assert_eq!(got, sent);
    assert!(pair.right_arq.stats().duplicates > 0);
    Ok(())
}

#[tokio::test]
async fn test_every_first_attempt_lost() -> Result<()> {
    let pair = reliable_pair(fast_reliable(4))?;
    let mut events = pair.right.subscribe()?;
    let _loss = add_loss_of_first_attempts(&pair.left_link);

    let sent = payload(17, 4);
    pair.left.transmit(sent.copy())?;
    assert_eq!(next_message(&mut events).await?, sent);

    let stats = pair.left_arq.stats();
    assert_eq!(stats.retransmissions, stats.frames_sent / 2);
    Ok(())
}

#[tokio::test]
async fn test_dead_link_exhausts_budget_then_recovers() -> Result<()> {
    let config = ReliableConfig {
        fragment_size: 8,
        ack_timeout_ms: 10,
        retry_budget: 4,
    };
    let pair = reliable_pair(config)?;
    let mut left_events = pair.left.subscribe()?;
    let mut right_events = pair.right.subscribe()?;
    pair.left_link.enable_wiretap();

    {
        let _dead = add_blackhole(&pair.left_link);
        pair.left.transmit(payload(20, 0))?;
        let fault = next_fault(&mut left_events).await?;
        assert!(
            matches!(
                fault.error,
                relaypipe_stages::StageError::RetriesExhausted { attempts: 4, .. }
            ),
            "unexpected fault: {fault}"
        );
    }
    // Exactly one report and exactly `retry_budget` attempts of the
    // first fragment.
    assert_eq!(pair.left.take_exceptions().len(), 1);
    assert_eq!(pair.left_link.transmitted().len(), 4);
    assert!(!pair.left.is_broken());

    // The link is back; the next message goes through.
    let sent = payload(5, 1);
    pair.left.transmit(sent.copy())?;
    assert_eq!(next_message(&mut right_events).await?, sent);
    Ok(())
}

#[tokio::test]
async fn test_dispose_stops_retransmission_mid_message() -> Result<()> {
    let config = ReliableConfig {
        fragment_size: 8,
        ack_timeout_ms: 10,
        retry_budget: 1000,
    };
    let pair = reliable_pair(config)?;
    pair.left_link.enable_wiretap();
    let _dead = add_blackhole(&pair.left_link);

    pair.left.transmit(payload(20, 0))?;
    tokio::time::timeout(WAIT, async {
        while pair.left_link.transmitted().len() < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await?;

    pair.left.dispose();
    let at_dispose = pair.left_link.transmitted().len();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(pair.left_link.transmitted().len(), at_dispose);

    // Shutdown cancels; it is not reported as a failure.
    assert!(pair.left.take_exceptions().is_empty());
    assert_eq!(pair.left_arq.stats().messages_abandoned, 0);
    Ok(())
}
