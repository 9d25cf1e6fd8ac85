use crate::*;
use relaypipe_stages::{FileInputInterface, FileOutputInterface, FramingStage, Stage};
use std::path::PathBuf;

/// A reliable transport over COBS over one end of a small-MTU loopback.
fn framed_chain(link: Arc<LoopbackInterface>, config: ReliableConfig) -> Result<Chain> {
    let chain = Chain::new()
        .with(link)?
        .with(FramingStage::cobs())?
        .with(ReliableTransport::new(config)?)?;
    chain.start()?;
    Ok(chain)
}

fn temp_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("relaypipe-it-{name}-{}", std::process::id()))
}

#[tokio::test]
async fn test_reliable_over_cobs_over_tiny_mtu() -> Result<()> {
    let (a, b) = LoopbackInterface::pair(Some(16));
    a.enable_wiretap();
    let left = framed_chain(a.clone(), fast_reliable(32))?;
    let right = framed_chain(b, fast_reliable(32))?;
    let mut events = right.subscribe()?;

    // Zero bytes everywhere exercise the stuffing.
    let mut sent = payload(200, 0);
    for i in (0..200).step_by(7) {
        sent.push_back(0);
        sent.push_back(i as u8);
    }
    left.transmit(sent.copy())?;
    assert_eq!(next_message(&mut events).await?, sent);

    let pieces = a.transmitted();
    assert!(pieces.iter().all(|p| p.len() <= 16));
    assert!(pieces.len() > sent.len() / 16);
    Ok(())
}

#[tokio::test]
async fn test_cobs_file_round_trip() -> Result<()> {
    let path = temp_path("cobs");
    let messages = [
        ByteMessage::from([0u8, 0, 0]),
        payload(3000, 5),
        ByteMessage::from(b"last".to_vec()),
    ];

    let writer = Chain::new()
        .with(FileOutputInterface::create(&path)?)?
        .with(FramingStage::cobs())?;
    writer.start()?;
    for msg in &messages {
        writer.transmit(msg.copy())?;
    }
    writer.dispose();
    tokio::time::timeout(WAIT, writer.closed()).await?;

    let input = FileInputInterface::open(&path);
    let reader = Chain::new()
        .with(input.clone())?
        .with(FramingStage::cobs())?;
    let mut inbox = reader.messages()?;
    reader.start()?;

    for expected in messages {
        let got = tokio::time::timeout(WAIT, inbox.next())
            .await?
            .context("reader stopped early")?;
        assert_eq!(got, expected);
    }
    assert!(!input.is_broken());
    let _ = std::fs::remove_file(&path);
    Ok(())
}

#[tokio::test]
async fn test_missing_input_file_breaks_the_reader() -> Result<()> {
    let input = FileInputInterface::open(temp_path("does-not-exist"));
    let reader = Chain::new()
        .with(input.clone())?
        .with(FramingStage::cobs())?;
    let mut events = reader.subscribe()?;
    reader.start()?;

    let fault = next_fault(&mut events).await?;
    assert_eq!(fault.stage, input.name());
    assert!(reader.is_broken());
    Ok(())
}
