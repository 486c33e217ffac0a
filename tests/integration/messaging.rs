//! Application data over established sessions.

use anyhow::Result;

use knock_session::{CloseReason, TransportError};

use crate::*;

#[tokio::test]
async fn ping_pong() -> Result<()> {
    let (mut a, mut b, at_a, at_b) = connected_pair().await?;

    a.node.send(&at_a, b"ping").await?;
    let (from, payload) = b.expect_message().await?;
    assert_eq!(from, at_b);
    assert_eq!(&payload[..], b"ping");

    b.node.send(&at_b, b"pong").await?;
    let (from, payload) = a.expect_message().await?;
    assert_eq!(from, at_a);
    assert_eq!(&payload[..], b"pong");
    Ok(())
}

#[tokio::test]
async fn burst_arrives_in_order() -> Result<()> {
    let (a, mut b, at_a, _) = connected_pair().await?;

    for i in 0u32..50 {
        a.node.send(&at_a, &i.to_le_bytes()).await?;
    }
    for i in 0u32..50 {
        let (_, payload) = b.expect_message().await?;
        assert_eq!(&payload[..], &i.to_le_bytes());
    }
    Ok(())
}

#[tokio::test]
async fn empty_and_large_payloads() -> Result<()> {
    let (a, mut b, at_a, _) = connected_pair().await?;

    a.node.send(&at_a, b"").await?;
    let (_, payload) = b.expect_message().await?;
    assert!(payload.is_empty());

    let large = vec![0xA5u8; 8 * 1024];
    a.node.send(&at_a, &large).await?;
    let (_, payload) = b.expect_message().await?;
    assert_eq!(&payload[..], &large[..]);
    Ok(())
}

#[tokio::test]
async fn close_notifies_peer() -> Result<()> {
    let (mut a, mut b, at_a, at_b) = connected_pair().await?;

    a.node.close(&at_a).await?;
    let (closed, reason) = a.expect_closed().await?;
    assert_eq!(closed, at_a);
    assert_eq!(reason, CloseReason::Local);

    let (closed, reason) = b.expect_closed().await?;
    assert_eq!(closed, at_b);
    assert_eq!(reason, CloseReason::Peer);
    assert!(b.node.sessions().is_empty());

    let err = a.node.send(&at_a, b"late").await.unwrap_err();
    assert!(matches!(err, TransportError::UnknownSession));
    Ok(())
}

#[tokio::test]
async fn shutdown_closes_sessions() -> Result<()> {
    let (mut a, mut b, at_a, _) = connected_pair().await?;

    a.node.shutdown().await;
    let (_, reason) = a.expect_closed().await?;
    assert_eq!(reason, CloseReason::Shutdown);
    let (_, reason) = b.expect_closed().await?;
    assert_eq!(reason, CloseReason::Peer);

    let err = a.node.send(&at_a, b"after").await.unwrap_err();
    assert!(matches!(err, TransportError::Shutdown));
    let err = a.node.open_session(b.addr()).await.unwrap_err();
    assert!(matches!(err, TransportError::Shutdown));
    Ok(())
}
