use crate::*;
use relaypipe_stages::UdpTransceiver;
use std::net::SocketAddr;

fn any_local() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 0))
}

/// A reliable transport over a UDP socket bound to an ephemeral port.
async fn udp_chain(
    remote: Option<SocketAddr>,
    config: ReliableConfig,
) -> Result<(Chain, Arc<UdpTransceiver>)> {
    udp_chain_at(any_local(), remote, config).await
}

async fn udp_chain_at(
    local: SocketAddr,
    remote: Option<SocketAddr>,
    config: ReliableConfig,
) -> Result<(Chain, Arc<UdpTransceiver>)> {
    let udp = UdpTransceiver::bind(local, remote).await?;
    let chain = Chain::new()
        .with(udp.clone())?
        .with(ReliableTransport::new(config)?)?;
    chain.start()?;
    Ok((chain, udp))
}

#[tokio::test]
async fn test_client_and_server_exchange_messages() -> Result<()> {
    // The server knows no peer; its replies follow the source address of
    // whatever it receives.
    let (server, server_udp) = udp_chain(None, fast_reliable(64)).await?;
    let (client, client_udp) =
        udp_chain(Some(server_udp.local_addr()), fast_reliable(64)).await?;
    let mut at_server = server.subscribe()?;
    let mut at_client = client.subscribe()?;

    let request = payload(300, 1);
    client.transmit(request.copy())?;
    let got = next_message(&mut at_server).await?;
    assert_eq!(got, request);
    assert_eq!(
        got.annotation_as::<SocketAddr>(),
        Some(&client_udp.local_addr())
    );

    // Echo it back using the delivered message's own routing.
    let mut reply = got.copy();
    reply.push_back(0xFF);
    server.transmit(reply.copy())?;
    let back = next_message(&mut at_client).await?;
    assert_eq!(back, reply);
    assert_eq!(
        back.annotation_as::<SocketAddr>(),
        Some(&server_udp.local_addr())
    );
    Ok(())
}

#[tokio::test]
async fn test_unaddressed_message_from_server_is_abandoned() -> Result<()> {
    let (server, _udp) = udp_chain(None, fast_reliable(64)).await?;
    let mut events = server.subscribe()?;

    server.transmit(payload(10, 0))?;
    let fault = next_fault(&mut events).await?;
    assert_eq!(fault.stage, "reliable");
    assert!(matches!(fault.error, relaypipe_stages::StageError::Unroutable));
    assert!(!server.is_broken());
    Ok(())
}

#[tokio::test]
async fn test_peer_that_never_answers() -> Result<()> {
    // Bound but not started: datagrams land in its socket buffer unread.
    let silent = UdpTransceiver::bind(any_local(), None).await?;
    let config = ReliableConfig {
        fragment_size: 16,
        ack_timeout_ms: 10,
        retry_budget: 3,
    };
    let (client, _udp) = udp_chain(Some(silent.local_addr()), config).await?;
    let mut events = client.subscribe()?;

    client.transmit(payload(40, 0))?;
    let fault = next_fault(&mut events).await?;
    assert!(matches!(
        fault.error,
        relaypipe_stages::StageError::RetriesExhausted { attempts: 3, .. }
    ));
    assert!(!client.is_broken());
    Ok(())
}

#[tokio::test]
async fn test_port_is_free_after_dispose() -> Result<()> {
    let (server, server_udp) = udp_chain(None, fast_reliable(64)).await?;
    let addr = server_udp.local_addr();

    server.dispose();
    tokio::time::timeout(WAIT, server.closed()).await?;

    // The old chain is still held; a new one takes over its port.
    let (replacement, replacement_udp) = udp_chain_at(addr, None, fast_reliable(64)).await?;
    assert_eq!(replacement_udp.local_addr(), addr);

    let (client, _udp) = udp_chain(Some(addr), fast_reliable(64)).await?;
    let mut events = replacement.subscribe()?;
    let sent = payload(20, 6);
    client.transmit(sent.copy())?;
    assert_eq!(next_message(&mut events).await?, sent);

    assert!(matches!(
        server.transmit(payload(1, 0)),
        Err(relaypipe_stages::StageError::Closed(_))
    ));
    Ok(())
}
