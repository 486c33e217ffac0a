//! Static key allowlists.

use std::time::Duration;

use anyhow::Result;

use knock_core::{HandshakeError, Keypair};
use knock_session::TransportError;

use crate::*;

fn trusting(keys: &[[u8; 32]]) -> knock_core::KnockConfig {
    let mut config = test_config();
    config.trust.trusted_peers = keys.iter().map(hex::encode).collect();
    config
}

#[tokio::test]
async fn trusted_peer_is_accepted() -> Result<()> {
    let a_identity = Keypair::generate();
    let a_key = a_identity.public;

    let a = TestNode::spawn_with(test_config(), a_identity).await?;
    let mut b = TestNode::spawn(trusting(&[a_key])).await?;

    a.node.open_session(b.addr()).await?;
    let (_, key) = b.expect_established().await?;
    assert_eq!(key, a_key);
    Ok(())
}

#[tokio::test]
async fn initiator_rejects_untrusted_responder() -> Result<()> {
    let stranger = Keypair::generate().public;

    let a = TestNode::spawn(trusting(&[stranger])).await?;
    let b = TestNode::spawn(test_config()).await?;

    let err = a.node.open_session(b.addr()).await.unwrap_err();
    assert!(matches!(
        err,
        TransportError::HandshakeFailed(HandshakeError::AuthenticationFailed)
    ));
    assert!(a.node.sessions().is_empty());
    Ok(())
}

#[tokio::test]
async fn responder_rejects_untrusted_initiator() -> Result<()> {
    let stranger = Keypair::generate().public;

    let a = TestNode::spawn(test_config()).await?;
    let mut b = TestNode::spawn(trusting(&[stranger])).await?;

    // The initiator finishes before the responder sees its key, so only
    // the responder side refuses.
    let at_a = a.node.open_session(b.addr()).await?;
    assert!(b.quiet_for(Duration::from_millis(300)).await);
    assert!(eventually(EVENT_WAIT, || b.node.sessions().is_empty()).await);

    // Data from the rejected peer is dropped at admission.
    a.node.send(&at_a, b"let me in").await?;
    assert!(b.quiet_for(Duration::from_millis(300)).await);
    assert!(b.node.sessions().is_empty());
    Ok(())
}
