//! Session lifecycle: establishment, deduplication, idle sweep.

use std::time::Duration;

use anyhow::Result;
use tokio::net::UdpSocket;

use knock_core::{Handshake, HandshakeMessage, HandshakeStep, Keypair, SecureChannel};
use knock_session::CloseReason;

use crate::*;

#[tokio::test]
async fn open_session_authenticates_both_sides() -> Result<()> {
    let mut a = TestNode::spawn(test_config()).await?;
    let mut b = TestNode::spawn(test_config()).await?;

    let at_a = a.node.open_session(b.addr()).await?;
    assert_eq!(at_a.endpoint, b.addr());

    let (_, key_seen_by_a) = a.expect_established().await?;
    let (at_b, key_seen_by_b) = b.expect_established().await?;
    assert_eq!(key_seen_by_a, b.public_key);
    assert_eq!(key_seen_by_b, a.public_key);
    assert_eq!(at_b.endpoint, a.addr());

    let info_a = &a.node.sessions()[0];
    let info_b = &b.node.sessions()[0];
    assert_eq!(info_a.remote_static, Some(b.public_key));
    assert_eq!(info_b.remote_static, Some(a.public_key));
    assert!(info_a.channel_id.is_some());
    assert_eq!(info_a.channel_id, info_b.channel_id);
    Ok(())
}

#[tokio::test]
async fn reopening_returns_the_established_session() -> Result<()> {
    let (a, b, at_a, _) = connected_pair().await?;

    let again = a.node.open_session(b.addr()).await?;
    assert_eq!(again, at_a);
    assert_eq!(a.node.sessions().len(), 1);
    assert_eq!(a.node.session(b.addr()), Some(at_a));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_opens_share_one_handshake() -> Result<()> {
    let a = TestNode::spawn(test_config()).await?;
    let b = TestNode::spawn(test_config()).await?;

    let (first, second) = tokio::join!(
        a.node.open_session(b.addr()),
        a.node.open_session(b.addr())
    );
    assert_eq!(first?, second?);
    assert_eq!(a.node.sessions().len(), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn simultaneous_open_yields_one_session() -> Result<()> {
    let mut a = TestNode::spawn(test_config()).await?;
    let mut b = TestNode::spawn(test_config()).await?;

    let (at_a, at_b) = tokio::join!(
        a.node.open_session(b.addr()),
        b.node.open_session(a.addr())
    );
    let (at_a, at_b) = (at_a?, at_b?);

    assert_eq!(a.node.sessions().len(), 1);
    assert_eq!(b.node.sessions().len(), 1);
    assert_eq!(
        a.node.sessions()[0].channel_id,
        b.node.sessions()[0].channel_id
    );
    assert_ne!(a.node.sessions()[0].role, b.node.sessions()[0].role);

    a.node.send(&at_a, b"from a").await?;
    let (_, payload) = b.expect_message().await?;
    assert_eq!(&payload[..], b"from a");

    b.node.send(&at_b, b"from b").await?;
    let (_, payload) = a.expect_message().await?;
    assert_eq!(&payload[..], b"from b");
    Ok(())
}

#[tokio::test]
async fn idle_session_is_swept_and_reestablished() -> Result<()> {
    let mut config = test_config();
    config.session.idle_timeout_secs = 1;

    let mut a = TestNode::spawn(config.clone()).await?;
    let mut b = TestNode::spawn(config).await?;

    let first = a.node.open_session(b.addr()).await?;
    let _ = b.expect_established().await?;

    let (swept, reason) = a.expect_closed().await?;
    assert_eq!(swept, first);
    assert_eq!(reason, CloseReason::Idle);
    let (_, reason) = b.expect_closed().await?;
    assert_eq!(reason, CloseReason::Idle);
    assert!(a.node.sessions().is_empty());
    assert!(b.node.sessions().is_empty());

    // The old handle is dead; a new open runs a fresh handshake.
    assert!(a.node.send(&first, b"stale").await.is_err());
    let second = a.node.open_session(b.addr()).await?;
    assert_ne!(second.id, first.id);

    a.node.send(&second, b"again").await?;
    let (_, payload) = b.expect_message().await?;
    assert_eq!(&payload[..], b"again");
    Ok(())
}

#[tokio::test]
async fn keepalives_hold_a_quiet_session_open() -> Result<()> {
    let mut config = test_config();
    config.session.idle_timeout_secs = 2;
    config.session.keepalive_secs = 1;

    let mut a = TestNode::spawn(config.clone()).await?;
    let b = TestNode::spawn(config).await?;
    a.node.open_session(b.addr()).await?;
    let _ = a.expect_established().await?;

    // Nothing but keepalives flows for twice the idle timeout.
    assert!(a.quiet_for(Duration::from_secs(4)).await);
    assert_eq!(a.node.sessions().len(), 1);
    assert_eq!(b.node.sessions().len(), 1);
    Ok(())
}

/// A peer that retransmits message 1 gets the cached message 2 back and
/// the node keeps exactly one session for it.
#[tokio::test]
async fn duplicate_handshake_init_is_answered_from_cache() -> Result<()> {
    let mut b = TestNode::spawn(test_config()).await?;
    let raw = UdpSocket::bind("127.0.0.1:0").await?;
    let identity = Keypair::generate();

    let mut handshake = Handshake::initiator(&identity)?;
    let msg1 = handshake.start()?;
    raw.send_to(msg1.as_bytes(), b.addr()).await?;
    raw.send_to(msg1.as_bytes(), b.addr()).await?;

    let mut buf = [0u8; 1500];
    let (len, _) = tokio::time::timeout(EVENT_WAIT, raw.recv_from(&mut buf)).await??;
    let first = buf[..len].to_vec();
    let (len, _) = tokio::time::timeout(EVENT_WAIT, raw.recv_from(&mut buf)).await??;
    assert_eq!(&buf[..len], &first[..]);
    assert_eq!(b.node.sessions().len(), 1);

    let msg2 = HandshakeMessage::decode(&first)?;
    let HandshakeStep::Complete {
        reply: Some(msg3),
        keys,
    } = handshake.read(&msg2)?
    else {
        panic!("initiator should complete on message 2");
    };
    assert_eq!(keys.remote_static, b.public_key);
    raw.send_to(msg3.as_bytes(), b.addr()).await?;

    let (_, key) = b.expect_established().await?;
    assert_eq!(key, identity.public);

    let mut channel = SecureChannel::from_keys(keys);
    let packet = channel.encode(b"hand rolled")?;
    raw.send_to(&packet, b.addr()).await?;
    let (_, payload) = b.expect_message().await?;
    assert_eq!(&payload[..], b"hand rolled");
    assert_eq!(b.node.sessions().len(), 1);
    Ok(())
}
