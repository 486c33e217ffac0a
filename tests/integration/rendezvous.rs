//! Public endpoint discovery against a local reflector.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::broadcast;

use knock_session::{LocalSocket, Reflector, SessionHandle, TransportError};

use crate::*;

#[tokio::test]
async fn discovers_public_endpoint_through_reflector() -> Result<()> {
    let (shutdown_tx, _) = broadcast::channel(1);
    let socket = Arc::new(LocalSocket::bind("127.0.0.1:0".parse()?)?);
    let server = socket.local_addr();
    let reflector = tokio::spawn(Reflector::new(socket, shutdown_tx.subscribe()).run());

    let a = TestNode::spawn(test_config()).await?;
    assert!(a.node.public_endpoint().is_none());

    let public = a
        .node
        .discover_public_endpoint("127.0.0.1", server.port())
        .await?;
    // No NAT on loopback: the observed address is the bound one.
    assert_eq!(public, a.addr());
    assert_eq!(a.node.public_endpoint(), Some(public));

    let _ = shutdown_tx.send(());
    reflector.await??;
    Ok(())
}

async fn ping_once(a: &TestNode, at_a: &SessionHandle, b: &mut TestNode) -> Result<()> {
    a.node.send(at_a, b"still here").await?;
    let (_, payload) = b.expect_message().await?;
    assert_eq!(&payload[..], b"still here");
    tokio::time::sleep(Duration::from_millis(25)).await;
    Ok(())
}

#[tokio::test]
async fn unreachable_rendezvous_does_not_stall_sessions() -> Result<()> {
    let (a, mut b, at_a, _) = connected_pair().await?;

    // Bound, never answers.
    let silent = tokio::net::UdpSocket::bind("127.0.0.1:0").await?;
    let silent_port = silent.local_addr()?.port();

    let discovery = a.node.discover_public_endpoint("127.0.0.1", silent_port);
    tokio::pin!(discovery);

    let mut delivered = 0;
    let result = loop {
        tokio::select! {
            result = &mut discovery => break result,
            pinged = ping_once(&a, &at_a, &mut b) => {
                pinged?;
                delivered += 1;
            }
        }
    };
    assert!(delivered > 0);

    let err = result.unwrap_err();
    assert!(matches!(
        err,
        TransportError::RendezvousUnreachable { attempts: 3 }
    ));
    assert!(a.node.public_endpoint().is_none());
    Ok(())
}

#[tokio::test]
async fn unresolvable_host_fails_fast() -> Result<()> {
    let a = TestNode::spawn(test_config()).await?;
    let err = a
        .node
        .discover_public_endpoint("no-such-host.invalid", 3478)
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::Resolve(_)));
    Ok(())
}
