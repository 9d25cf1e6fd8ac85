use crate::*;

#[tokio::test]
async fn test_fragment_boundaries_round_trip() -> Result<()> {
    const F: usize = 16;
    let pair = reliable_pair(fast_reliable(F))?;
    let mut events = pair.right.subscribe()?;

    for (i, len) in [0, 1, F - 1, F, F + 1, 10 * F].into_iter().enumerate() {
        let sent = payload(len, i as u8);
        pair.left.transmit(sent.copy())?;
        let got = next_message(&mut events).await?;
        assert_eq!(got, sent, "length {len}");
    }
    Ok(())
}

#[tokio::test]
async fn test_large_message_with_default_settings() -> Result<()> {
    let pair = reliable_pair(ReliableConfig::default())?;
    let mut events = pair.right.subscribe()?;

    let sent = payload(10_000, 7);
    pair.left.transmit(sent.copy())?;
    let got = next_message(&mut events).await?;
    assert_eq!(got.len(), 10_000);
    assert_eq!(got, sent);
    Ok(())
}

#[tokio::test]
async fn test_queued_messages_keep_fifo_order() -> Result<()> {
    let pair = reliable_pair(fast_reliable(4))?;
    let mut events = pair.right.subscribe()?;

    let sent: Vec<ByteMessage> = (0..20u8).map(|i| payload(i as usize * 3, i)).collect();
    for msg in &sent {
        pair.left.transmit(msg.copy())?;
    }
    for (i, expected) in sent.into_iter().enumerate() {
        let got = next_message(&mut events).await?;
        assert_eq!(got, expected, "message {i}");
    }
    Ok(())
}

#[tokio::test]
async fn test_both_directions_at_once() -> Result<()> {
    let pair = reliable_pair(fast_reliable(8))?;
    let mut left_events = pair.left.subscribe()?;
    let mut right_events = pair.right.subscribe()?;

    let to_right = payload(100, 1);
    let to_left = payload(77, 2);
    pair.left.transmit(to_right.copy())?;
    pair.right.transmit(to_left.copy())?;

    let (at_right, at_left) = tokio::join!(
        next_message(&mut right_events),
        next_message(&mut left_events)
    );
    assert_eq!(at_right?, to_right);
    assert_eq!(at_left?, to_left);

    // Data and ACKs share the link in both directions.
    assert_eq!(pair.left_arq.stats().messages_delivered, 1);
    assert_eq!(pair.right_arq.stats().messages_delivered, 1);
    Ok(())
}

#[tokio::test]
async fn test_port_tag_survives_the_trip() -> Result<()> {
    let pair = reliable_pair(fast_reliable(4))?;
    let mut events = pair.right.subscribe()?;

    pair.left.transmit(payload(10, 0).with_port(5))?;
    let got = next_message(&mut events).await?;
    assert_eq!(got.port(), 5);
    Ok(())
}
