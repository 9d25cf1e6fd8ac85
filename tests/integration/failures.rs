use crate::*;
use relaypipe_stages::{FileOutputInterface, FramingStage, Stage, StageError};
use std::path::Path;

/// Next `BrokenPipe` notice on `events`, as the name of the stage that broke.
async fn next_broken(events: &mut broadcast::Receiver<StageEvent>) -> Result<String> {
    tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(StageEvent::BrokenPipe { stage }) => return Ok(stage),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => bail!("event stream closed"),
            }
        }
    })
    .await
    .context("timed out waiting for a broken pipe")?
}

#[tokio::test]
async fn test_severed_link_breaks_the_interface_only() -> Result<()> {
    let pair = reliable_pair(fast_reliable(8))?;
    let mut events = pair.left.subscribe()?;
    pair.left_link.sever();

    // Queued fine; the worker hits the dead link.
    pair.left.transmit(payload(12, 0))?;
    assert_eq!(next_broken(&mut events).await?, "loopback-a");

    // The transport gives up on the message and blames its neighbor.
    let abandoned = next_fault(&mut events).await?;
    assert_eq!(abandoned.stage, "reliable");
    assert!(matches!(abandoned.error, StageError::PipeBroken(ref s) if s == "loopback-a"));
    assert_eq!(pair.left_arq.stats().messages_abandoned, 1);

    assert!(pair.left.is_broken());
    assert!(pair.left_link.is_broken());
    assert!(!pair.left_arq.is_broken());

    let faults = pair.left.take_exceptions();
    assert_eq!(faults.len(), 2, "faults: {faults:?}");
    assert_eq!(faults[0].stage, "loopback-a");
    assert!(matches!(faults[0].error, StageError::Io(_)));
    assert_eq!(faults[1].stage, "reliable");

    // Everything through the broken interface now fails fast.
    let err = pair.left_link.transmit(ByteMessage::from([1u8])).unwrap_err();
    assert!(matches!(err, StageError::PipeBroken(ref s) if s == "loopback-a"));
    Ok(())
}

#[tokio::test]
async fn test_reset_reopens_the_chain() -> Result<()> {
    let pair = reliable_pair(fast_reliable(8))?;
    let mut left_events = pair.left.subscribe()?;
    let mut right_events = pair.right.subscribe()?;

    // Break the right side's interface directly; the left is untouched.
    pair.right_link
        .core()
        .mark_broken(std::io::Error::other("simulated").into());
    assert_eq!(next_broken(&mut right_events).await?, "loopback-b");
    assert!(pair.right.is_broken());

    // Frames reaching a broken interface are refused, so nothing is ACKed.
    pair.left.transmit(payload(4, 1))?;
    let fault = next_fault(&mut left_events).await?;
    assert!(matches!(fault.error, StageError::RetriesExhausted { .. }));

    pair.right.reset();
    assert!(!pair.right.is_broken());
    let sent = payload(4, 2);
    pair.left.transmit(sent.copy())?;
    assert_eq!(next_message(&mut right_events).await?, sent);
    Ok(())
}

#[tokio::test]
async fn test_full_disk_breaks_file_output() -> Result<()> {
    let dev_full = Path::new("/dev/full");
    if !dev_full.exists() {
        return Ok(());
    }
    let out = FileOutputInterface::create(dev_full)?;
    let chain = Chain::new().with(out.clone())?.with(FramingStage::cobs())?;
    let mut events = chain.subscribe()?;
    chain.start()?;

    // Writes happen on the writer task; the failure arrives as an event.
    chain.transmit(ByteMessage::from([1u8, 2, 3]))?;
    assert_eq!(next_broken(&mut events).await?, out.name());
    assert!(out.is_broken());

    let err = chain.transmit(ByteMessage::from([4u8])).unwrap_err();
    assert!(matches!(err, StageError::PipeBroken(ref s) if s == out.name()), "got {err}");

    let faults = chain.take_exceptions();
    assert_eq!(faults.len(), 1);
    assert!(matches!(faults[0].error, StageError::Io(_)));
    Ok(())
}

#[tokio::test]
async fn test_topology_is_checked_when_stacking() -> Result<()> {
    let arq = ReliableTransport::new(ReliableConfig::default())?;
    let err = Chain::new().with(arq.clone()).err().context("expected an error")?;
    assert!(matches!(err, StageError::InvalidTopology(_)));

    let (a, b) = LoopbackInterface::pair(None);
    let _first = Chain::new().with(a)?.with(arq.clone())?;
    let err = Chain::new().with(b)?.with(arq).err().context("expected an error")?;
    assert!(matches!(err, StageError::AlreadyAttached { .. }));
    Ok(())
}
