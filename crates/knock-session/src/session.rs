//! Per-endpoint session state: one handshake attempt, then one channel.
//!
//! A `PeerSession` never touches the registry. It decides what an inbound
//! handshake message means for *this* session (`classify`), advances the
//! engine (`apply`), and owns the timers the maintenance loop polls.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use knock_core::{
    CodecError, Decoded, Handshake, HandshakeError, HandshakeMessage, HandshakeStep, Keypair,
    Phase, Role, SecureChannel,
};

use crate::Endpoint;

/// Process-unique session identifier. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Read-only view of a session for callers and logs.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: SessionId,
    pub endpoint: SocketAddr,
    pub role: Role,
    pub phase: Phase,
    /// Known once established.
    pub remote_static: Option<[u8; 32]>,
    pub channel_id: Option<[u8; 32]>,
    pub created_at: Instant,
    pub last_activity_at: Instant,
}

/// What an inbound handshake message means for the current session.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Disposition {
    /// Feed it to the engine.
    Process,
    /// A duplicate of a message we already answered: resend our answer.
    Resend(Vec<u8>),
    Ignore,
    /// A new message 1: replace this session with a fresh responder.
    Supersede,
    /// Belongs to a new handshake racing this established session. The
    /// session stays in place until that handshake authenticates.
    Challenge,
}

pub(crate) enum Applied {
    Reply(Vec<u8>),
    Established {
        reply: Option<Vec<u8>>,
        remote_static: [u8; 32],
    },
}

pub struct PeerSession {
    id: SessionId,
    endpoint: Endpoint,
    role: Role,
    handshake: Option<Handshake>,
    channel: Option<SecureChannel>,
    /// Our message 1 ephemeral key, for the simultaneous-open tie-break.
    ephemeral: Option<[u8; 32]>,
    /// The peer message our `outbound` answers.
    answered: Option<Vec<u8>>,
    /// A peer message 1 that lost the simultaneous-open tie-break.
    declined: Option<Vec<u8>>,
    /// Last handshake message we produced, kept for retransmission.
    outbound: Option<HandshakeMessage>,
    created_at: Instant,
    last_activity_at: Instant,
    last_sent_at: Instant,
}

impl PeerSession {
    pub(crate) fn new(
        id: SessionId,
        endpoint: Endpoint,
        role: Role,
        keypair: &Keypair,
    ) -> Result<Self, HandshakeError> {
        let handshake = match role {
            Role::Initiator => Handshake::initiator(keypair)?,
            Role::Responder => Handshake::responder(keypair)?,
        };
        let now = Instant::now();
        Ok(Self {
            id,
            endpoint,
            role,
            handshake: Some(handshake),
            channel: None,
            ephemeral: None,
            answered: None,
            declined: None,
            outbound: None,
            created_at: now,
            last_activity_at: now,
            last_sent_at: now,
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn phase(&self) -> Phase {
        if self.channel.is_some() {
            return Phase::Established;
        }
        self.handshake.as_ref().map_or(Phase::Failed, Handshake::phase)
    }

    pub fn is_established(&self) -> bool {
        self.channel.is_some()
    }

    pub fn last_activity_at(&self) -> Instant {
        self.last_activity_at
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            endpoint: self.endpoint,
            role: self.role,
            phase: self.phase(),
            remote_static: self.channel.as_ref().map(|c| *c.remote_static()),
            channel_id: self.channel.as_ref().map(|c| *c.channel_id()),
            created_at: self.created_at,
            last_activity_at: self.last_activity_at,
        }
    }

    /// Write message 1. Initiator sessions only, once.
    pub(crate) fn start(&mut self, now: Instant) -> Result<Vec<u8>, HandshakeError> {
        let handshake = self
            .handshake
            .as_mut()
            .ok_or(HandshakeError::UnexpectedPhase)?;
        let msg1 = match handshake.start() {
            Ok(m) => m,
            Err(e) => {
                self.handshake = None;
                return Err(e);
            }
        };
        self.ephemeral = msg1.noise_msg().try_into().ok();
        self.outbound = Some(msg1);
        self.last_sent_at = now;
        Ok(msg1.as_bytes().to_vec())
    }

    pub(crate) fn classify(&mut self, msg: &HandshakeMessage) -> Disposition {
        let phase = self.phase();

        // Retransmits of a declined message 1 keep arriving after we win.
        if self.declined.as_deref() == Some(msg.as_bytes()) {
            return Disposition::Ignore;
        }

        if self.answered.as_deref() == Some(msg.as_bytes()) {
            // A late copy of the message 1 that started an established
            // session needs no answer; the peer already has everything.
            if msg.number() == 1 && phase == Phase::Established {
                return Disposition::Ignore;
            }
            return match self.outbound {
                Some(out) => Disposition::Resend(out.as_bytes().to_vec()),
                None => Disposition::Ignore,
            };
        }

        match (msg.number(), self.role, phase) {
            (1, Role::Responder, Phase::AwaitingMsg1) => Disposition::Process,
            // Simultaneous open: the lower ephemeral keeps the initiator role.
            (1, Role::Initiator, Phase::SentMsg1) => match self.ephemeral {
                Some(ours) if ours.as_slice() < msg.noise_msg() => {
                    self.declined = Some(msg.as_bytes().to_vec());
                    Disposition::Ignore
                }
                _ => Disposition::Supersede,
            },
            (1 | 3, _, Phase::Established) => Disposition::Challenge,
            (1, _, _) => Disposition::Supersede,
            (_, _, Phase::Established) => Disposition::Ignore,
            _ => Disposition::Process,
        }
    }

    pub(crate) fn apply(
        &mut self,
        msg: &HandshakeMessage,
        now: Instant,
    ) -> Result<Applied, HandshakeError> {
        let step = match self.handshake.as_mut() {
            Some(handshake) => handshake.read(msg),
            None => return Err(HandshakeError::UnexpectedPhase),
        };
        self.last_activity_at = now;

        match step {
            Err(e) => {
                self.handshake = None;
                Err(e)
            }
            Ok(HandshakeStep::Reply(reply)) => {
                self.answered = Some(msg.as_bytes().to_vec());
                self.outbound = Some(reply);
                self.last_sent_at = now;
                Ok(Applied::Reply(reply.as_bytes().to_vec()))
            }
            Ok(HandshakeStep::Complete { reply, keys }) => {
                let remote_static = keys.remote_static;
                self.channel = Some(SecureChannel::from_keys(keys));
                self.handshake = None;
                self.last_sent_at = now;
                if reply.is_some() {
                    self.answered = Some(msg.as_bytes().to_vec());
                    self.outbound = reply;
                }
                Ok(Applied::Established {
                    reply: reply.map(|r| r.as_bytes().to_vec()),
                    remote_static,
                })
            }
        }
    }

    /// The last handshake message again, if one is owed and due.
    pub(crate) fn retransmit(&mut self, now: Instant, interval: Duration) -> Option<Vec<u8>> {
        if !matches!(self.phase(), Phase::SentMsg1 | Phase::SentMsg2) {
            return None;
        }
        if now.saturating_duration_since(self.last_sent_at) < interval {
            return None;
        }
        let out = self.outbound?;
        self.last_sent_at = now;
        Some(out.as_bytes().to_vec())
    }

    pub(crate) fn handshake_expired(&self, now: Instant, timeout: Duration) -> bool {
        !self.is_established() && now.saturating_duration_since(self.created_at) >= timeout
    }

    pub(crate) fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity_at)
    }

    /// A Keepalive packet if nothing was sent for `interval`. Does not count
    /// as activity.
    pub(crate) fn keepalive(
        &mut self,
        now: Instant,
        interval: Duration,
    ) -> Option<Result<Vec<u8>, CodecError>> {
        let channel = self.channel.as_mut()?;
        if now.saturating_duration_since(self.last_sent_at) < interval {
            return None;
        }
        self.last_sent_at = now;
        Some(channel.keepalive())
    }

    pub(crate) fn encode(&mut self, plaintext: &[u8], now: Instant) -> Result<Vec<u8>, CodecError> {
        let channel = self
            .channel
            .as_mut()
            .ok_or(CodecError::SessionNotEstablished)?;
        let packet = channel.encode(plaintext)?;
        // Only the peer's traffic counts as activity.
        self.last_sent_at = now;
        Ok(packet)
    }

    pub(crate) fn close_notice(&mut self) -> Result<Vec<u8>, CodecError> {
        self.channel
            .as_mut()
            .ok_or(CodecError::SessionNotEstablished)?
            .close_notice()
    }

    pub(crate) fn decode(&mut self, packet: &[u8], now: Instant) -> Result<Decoded, CodecError> {
        let decoded = self
            .channel
            .as_mut()
            .ok_or(CodecError::SessionNotEstablished)?
            .decode(packet)?;
        self.last_activity_at = now;
        Ok(decoded)
    }

    /// Drop the handshake and wipe the channel keys.
    pub(crate) fn clear(&mut self) {
        if let Some(channel) = self.channel.as_mut() {
            channel.clear();
        }
        self.channel = None;
        self.handshake = None;
        self.outbound = None;
        self.answered = None;
        self.declined = None;
    }
}

impl std::fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSession")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("role", &self.role)
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> Endpoint {
        "127.0.0.1:50000".parse().unwrap()
    }

    fn initiator(id: u64, kp: &Keypair) -> PeerSession {
        PeerSession::new(SessionId(id), endpoint(), Role::Initiator, kp).unwrap()
    }

    fn responder(id: u64, kp: &Keypair) -> PeerSession {
        PeerSession::new(SessionId(id), endpoint(), Role::Responder, kp).unwrap()
    }

    fn decode(bytes: &[u8]) -> HandshakeMessage {
        HandshakeMessage::decode(bytes).unwrap()
    }

    fn reply_of(applied: Applied) -> Vec<u8> {
        match applied {
            Applied::Reply(b) => b,
            Applied::Established { .. } => panic!("expected a reply"),
        }
    }

    #[test]
    fn duplicate_msg1_resends_cached_msg2() {
        let now = Instant::now();
        let mut i = initiator(1, &Keypair::generate());
        let mut r = responder(2, &Keypair::generate());

        let msg1 = decode(&i.start(now).unwrap());
        assert_eq!(r.classify(&msg1), Disposition::Process);
        let msg2 = reply_of(r.apply(&msg1, now).unwrap());

        assert_eq!(r.classify(&msg1), Disposition::Resend(msg2));
        assert_eq!(r.phase(), Phase::SentMsg2);
    }

    #[test]
    fn late_msg1_after_establishment_is_ignored() {
        let now = Instant::now();
        let mut i = initiator(1, &Keypair::generate());
        let mut r = responder(2, &Keypair::generate());

        let msg1 = decode(&i.start(now).unwrap());
        let msg2 = decode(&reply_of(r.apply(&msg1, now).unwrap()));
        let Applied::Established {
            reply: Some(msg3), ..
        } = i.apply(&msg2, now).unwrap()
        else {
            panic!("initiator should establish");
        };
        let msg3 = decode(&msg3);
        assert!(matches!(r.apply(&msg3, now), Ok(Applied::Established { reply: None, .. })));

        assert_eq!(r.classify(&msg1), Disposition::Ignore);
        // A message 3 can only matter to a handshake running alongside.
        assert_eq!(r.classify(&msg3), Disposition::Challenge);
        // The initiator answers a duplicate msg2 with its cached msg3.
        assert_eq!(
            i.classify(&msg2),
            Disposition::Resend(msg3.as_bytes().to_vec())
        );
    }

    #[test]
    fn simultaneous_open_lower_ephemeral_wins() {
        let now = Instant::now();
        let mut a = initiator(1, &Keypair::generate());
        let mut b = initiator(2, &Keypair::generate());
        let a1 = decode(&a.start(now).unwrap());
        let b1 = decode(&b.start(now).unwrap());

        let (a_says, b_says) = (a.classify(&b1), b.classify(&a1));
        if a1.noise_msg() < b1.noise_msg() {
            assert_eq!(a_says, Disposition::Ignore);
            assert_eq!(b_says, Disposition::Supersede);
        } else {
            assert_eq!(a_says, Disposition::Supersede);
            assert_eq!(b_says, Disposition::Ignore);
        }
    }

    #[test]
    fn declined_msg1_stays_ignored_after_establishment() {
        let now = Instant::now();
        let mut a = initiator(1, &Keypair::generate());
        let mut b = initiator(2, &Keypair::generate());
        let a1 = decode(&a.start(now).unwrap());
        let b1 = decode(&b.start(now).unwrap());
        let (mut winner, winner_msg1, loser_msg1) = if a1.noise_msg() < b1.noise_msg() {
            (a, a1, b1)
        } else {
            (b, b1, a1)
        };
        assert_eq!(winner.classify(&loser_msg1), Disposition::Ignore);

        let mut r = responder(3, &Keypair::generate());
        let msg2 = decode(&reply_of(r.apply(&winner_msg1, now).unwrap()));
        assert!(matches!(
            winner.apply(&msg2, now),
            Ok(Applied::Established { .. })
        ));
        assert_eq!(winner.classify(&loser_msg1), Disposition::Ignore);
    }

    #[test]
    fn new_msg1_supersedes_responder() {
        let now = Instant::now();
        let mut r = responder(1, &Keypair::generate());
        let first = decode(&initiator(2, &Keypair::generate()).start(now).unwrap());
        r.apply(&first, now).unwrap();

        let second = decode(&initiator(3, &Keypair::generate()).start(now).unwrap());
        assert_eq!(r.classify(&second), Disposition::Supersede);
    }

    #[test]
    fn out_of_phase_message_fails_in_progress_session() {
        let now = Instant::now();
        let mut r = responder(1, &Keypair::generate());
        let bogus = HandshakeMessage::from_noise(3, &[0u8; 64]).unwrap();
        assert_eq!(r.classify(&bogus), Disposition::Process);
        assert!(matches!(
            r.apply(&bogus, now),
            Err(HandshakeError::UnexpectedPhase)
        ));
        assert_eq!(r.phase(), Phase::Failed);
    }

    #[test]
    fn retransmit_waits_for_interval() {
        let now = Instant::now();
        let mut i = initiator(1, &Keypair::generate());
        let msg1 = i.start(now).unwrap();
        let interval = Duration::from_millis(500);

        assert!(i.retransmit(now, interval).is_none());
        assert_eq!(i.retransmit(now + interval, interval), Some(msg1.clone()));
        assert!(i.retransmit(now + interval, interval).is_none());
        assert_eq!(i.retransmit(now + interval * 2, interval), Some(msg1));
    }

    #[test]
    fn handshake_expiry_only_before_establishment() {
        let timeout = Duration::from_secs(5);
        let mut i = initiator(1, &Keypair::generate());
        let mut r = responder(2, &Keypair::generate());
        let created = i.info().created_at;
        assert!(!i.handshake_expired(created, timeout));
        assert!(i.handshake_expired(created + timeout, timeout));

        let now = Instant::now();
        let msg1 = decode(&i.start(now).unwrap());
        let msg2 = decode(&reply_of(r.apply(&msg1, now).unwrap()));
        assert!(matches!(i.apply(&msg2, now), Ok(Applied::Established { .. })));
        assert!(!i.handshake_expired(created + timeout * 10, timeout));
    }

    #[test]
    fn own_data_does_not_count_as_activity() {
        let now = Instant::now();
        let mut i = initiator(1, &Keypair::generate());
        let mut r = responder(2, &Keypair::generate());
        let msg1 = decode(&i.start(now).unwrap());
        let msg2 = decode(&reply_of(r.apply(&msg1, now).unwrap()));
        assert!(matches!(i.apply(&msg2, now), Ok(Applied::Established { .. })));

        let later = now + Duration::from_secs(30);
        i.encode(b"into the void", later).unwrap();
        assert_eq!(i.last_activity_at(), now);
        assert_eq!(i.idle_for(later), Duration::from_secs(30));
    }

    #[test]
    fn encode_before_establishment_is_refused() {
        let mut i = initiator(1, &Keypair::generate());
        assert_eq!(
            i.encode(b"early", Instant::now()),
            Err(CodecError::SessionNotEstablished)
        );
        assert!(i.keepalive(Instant::now(), Duration::ZERO).is_none());
    }

    #[test]
    fn clear_leaves_session_failed() {
        let mut i = initiator(1, &Keypair::generate());
        i.clear();
        assert_eq!(i.phase(), Phase::Failed);
    }
}
