//! Timeouts, refusals and hostile datagrams.

use std::time::Duration;

use anyhow::Result;
use tokio::net::UdpSocket;

use knock_core::{Handshake, Keypair};
use knock_session::{CloseReason, TransportError};

use crate::*;

#[tokio::test]
async fn silent_peer_times_out() -> Result<()> {
    let mut a = TestNode::spawn(test_config()).await?;
    let silent = UdpSocket::bind("127.0.0.1:0").await?;
    let target = silent.local_addr()?;

    let err = a.node.open_session(target).await.unwrap_err();
    assert!(matches!(err, TransportError::HandshakeTimeout));

    let (handle, reason) = a.expect_closed().await?;
    assert_eq!(handle.endpoint, target);
    assert_eq!(reason, CloseReason::HandshakeTimeout);
    assert!(a.node.sessions().is_empty());

    // Message 1 was retransmitted while waiting.
    let mut buf = [0u8; 64];
    let mut copies = 0;
    while let Ok(Ok((len, _))) =
        tokio::time::timeout(Duration::from_millis(50), silent.recv_from(&mut buf)).await
    {
        assert_eq!(len, 36);
        copies += 1;
    }
    assert!(copies > 1, "expected retransmissions, saw {copies}");
    Ok(())
}

#[tokio::test]
async fn inbound_disabled_ignores_handshakes() -> Result<()> {
    let mut closed = test_config();
    closed.network.accept_inbound = false;

    let a = TestNode::spawn(test_config()).await?;
    let mut b = TestNode::spawn(closed).await?;

    let err = a.node.open_session(b.addr()).await.unwrap_err();
    assert!(matches!(err, TransportError::HandshakeTimeout));
    assert!(b.node.sessions().is_empty());
    assert!(b.quiet_for(Duration::from_millis(200)).await);

    // Outbound still works from the closed side.
    b.node.open_session(a.addr()).await?;
    Ok(())
}

#[tokio::test]
async fn garbage_does_not_disturb_established_session() -> Result<()> {
    let (a, mut b, at_a, _) = connected_pair().await?;
    let raw = UdpSocket::bind("127.0.0.1:0").await?;

    let noise: [&[u8]; 5] = [
        b"",
        b"\x01",
        b"\x10\x01\x00\x00garbage that is not a sealed packet",
        b"\x77\x01\x00\x00",
        b"\x01\x09\x00\x00",
    ];
    for datagram in noise {
        raw.send_to(datagram, b.addr()).await?;
    }

    a.node.send(&at_a, b"unharmed").await?;
    let (_, payload) = b.expect_message().await?;
    assert_eq!(&payload[..], b"unharmed");
    assert_eq!(b.node.sessions().len(), 1);
    Ok(())
}

#[tokio::test]
async fn malformed_handshake_aborts_pending_session() -> Result<()> {
    let b = TestNode::spawn(test_config()).await?;
    let raw = UdpSocket::bind("127.0.0.1:0").await?;

    let mut handshake = Handshake::initiator(&Keypair::generate())?;
    let msg1 = handshake.start()?;
    raw.send_to(msg1.as_bytes(), b.addr()).await?;
    assert!(eventually(EVENT_WAIT, || b.node.sessions().len() == 1).await);

    // Right kind, wrong length.
    let mut truncated = vec![0x03, 0x01, 0x00, 0x00];
    truncated.extend_from_slice(&[0u8; 10]);
    raw.send_to(&truncated, b.addr()).await?;

    assert!(eventually(EVENT_WAIT, || b.node.sessions().is_empty()).await);
    Ok(())
}

#[tokio::test]
async fn forged_handshake_completion_fails_pending_session() -> Result<()> {
    let b = TestNode::spawn(test_config()).await?;
    let raw = UdpSocket::bind("127.0.0.1:0").await?;

    let mut handshake = Handshake::initiator(&Keypair::generate())?;
    let msg1 = handshake.start()?;
    raw.send_to(msg1.as_bytes(), b.addr()).await?;
    assert!(eventually(EVENT_WAIT, || b.node.sessions().len() == 1).await);

    // Well-formed message 3 that authenticates nothing.
    let mut forged = vec![0x03, 0x01, 0x00, 0x00];
    forged.extend_from_slice(&[0x5Au8; 64]);
    raw.send_to(&forged, b.addr()).await?;

    assert!(eventually(EVENT_WAIT, || b.node.sessions().is_empty()).await);
    Ok(())
}
