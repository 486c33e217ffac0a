//! Noise_XX handshake engine.
//!
//! ```text
//! Initiator                                Responder
//!     |  -> e                                  |   msg 1
//!     |--------------------------------------->|
//!     |  <- e, ee, s, es                       |   msg 2 (authenticates responder)
//!     |<---------------------------------------|
//!     |  -> s, se                              |   msg 3 (authenticates initiator)
//!     |--------------------------------------->|
//!     [  both directional cipher states exist  ]
//! ```
//!
//! snow drives the pattern; at completion the two split keys are pulled out
//! into `CipherState`s so the datagram codec can use explicit nonces.
//!
//! Every message is a *response*: message 2 is only written after message 1
//! was read, message 3 only after message 2 was read and validated. Any
//! out-of-phase, malformed, or unauthenticated message moves the handshake
//! to `Failed` and the state is dropped. There is no retry in here.

use snow::{Builder, HandshakeState};
use thiserror::Error;
use zeroize::Zeroizing;

use crate::crypto::{CipherState, Keypair};
use crate::wire::{HandshakeMessage, NOISE_MSG2_LEN};

/// The Noise protocol pattern Knock uses.
///
/// Noise_XX: mutual authentication, both static keys transmitted encrypted.
const NOISE_PATTERN: &str = "Noise_XX_25519_ChaChaPoly_BLAKE2s";

/// Scratch size for handshake reads/writes. Largest message is msg 2.
const SCRATCH_LEN: usize = NOISE_MSG2_LEN + 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Initiator,
    Responder,
}

/// Handshake phase.
///
/// Initiator: `Idle → SentMsg1 → Established` (message 3 is written on the
/// way to Established). Responder: `AwaitingMsg1 → SentMsg2 → Established`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    /// Initiator sent message 1, waiting for message 2.
    SentMsg1,
    /// Responder waiting for message 1.
    AwaitingMsg1,
    /// Responder sent message 2, waiting for message 3.
    SentMsg2,
    Established,
    Failed,
}

impl Phase {
    /// A handshake that has started but not yet finished either way.
    pub fn in_progress(self) -> bool {
        matches!(self, Phase::SentMsg1 | Phase::AwaitingMsg1 | Phase::SentMsg2)
    }
}

/// Output of a completed handshake. Dropping it wipes both keys.
pub struct SessionKeys {
    pub send: CipherState,
    pub recv: CipherState,
    /// Noise handshake hash `h` — identical on both sides.
    pub transcript_hash: [u8; 32],
    /// The peer's authenticated static public key.
    pub remote_static: [u8; 32],
}

/// What the caller must do after feeding a message in.
pub enum HandshakeStep {
    /// Send this message and wait for the next one.
    Reply(HandshakeMessage),
    /// Both cipher states exist. `reply` is message 3 on the initiator side.
    Complete {
        reply: Option<HandshakeMessage>,
        keys: SessionKeys,
    },
}

/// One side of one handshake attempt.
pub struct Handshake {
    role: Role,
    phase: Phase,
    state: Option<Box<HandshakeState>>,
}

impl Handshake {
    /// A fresh initiator in `Idle`. Call `start` to produce message 1.
    pub fn initiator(keypair: &Keypair) -> Result<Self, HandshakeError> {
        let state = builder()?
            .local_private_key(keypair.private())
            .build_initiator()
            .map_err(|e| HandshakeError::Setup(e.to_string()))?;
        Ok(Self {
            role: Role::Initiator,
            phase: Phase::Idle,
            state: Some(Box::new(state)),
        })
    }

    /// A fresh responder waiting for message 1.
    pub fn responder(keypair: &Keypair) -> Result<Self, HandshakeError> {
        let state = builder()?
            .local_private_key(keypair.private())
            .build_responder()
            .map_err(|e| HandshakeError::Setup(e.to_string()))?;
        Ok(Self {
            role: Role::Responder,
            phase: Phase::AwaitingMsg1,
            state: Some(Box::new(state)),
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Write message 1. Only valid for an initiator in `Idle`.
    pub fn start(&mut self) -> Result<HandshakeMessage, HandshakeError> {
        if self.role != Role::Initiator || self.phase != Phase::Idle {
            return Err(self.fail(HandshakeError::UnexpectedPhase));
        }
        let msg1 = self.write(1)?;
        self.phase = Phase::SentMsg1;
        Ok(msg1)
    }

    /// Feed the next inbound handshake message.
    pub fn read(&mut self, msg: &HandshakeMessage) -> Result<HandshakeStep, HandshakeError> {
        let expected = match (self.role, self.phase) {
            (Role::Responder, Phase::AwaitingMsg1) => 1,
            (Role::Initiator, Phase::SentMsg1) => 2,
            (Role::Responder, Phase::SentMsg2) => 3,
            _ => return Err(self.fail(HandshakeError::UnexpectedPhase)),
        };
        if msg.number() != expected {
            return Err(self.fail(HandshakeError::UnexpectedPhase));
        }

        let read = match self.state.as_mut() {
            Some(state) => {
                let mut payload = vec![0u8; SCRATCH_LEN];
                state.read_message(msg.noise_msg(), &mut payload)
            }
            None => return Err(self.fail(HandshakeError::UnexpectedPhase)),
        };
        if let Err(e) = read {
            return Err(self.fail(classify(&e)));
        }

        match expected {
            1 => {
                let msg2 = self.write(2)?;
                self.phase = Phase::SentMsg2;
                Ok(HandshakeStep::Reply(msg2))
            }
            2 => {
                let msg3 = self.write(3)?;
                let keys = self.split()?;
                Ok(HandshakeStep::Complete {
                    reply: Some(msg3),
                    keys,
                })
            }
            _ => {
                let keys = self.split()?;
                Ok(HandshakeStep::Complete { reply: None, keys })
            }
        }
    }

    fn write(&mut self, number: u8) -> Result<HandshakeMessage, HandshakeError> {
        let written = match self.state.as_mut() {
            Some(state) => {
                let mut out = vec![0u8; SCRATCH_LEN];
                state.write_message(&[], &mut out).map(|len| {
                    out.truncate(len);
                    out
                })
            }
            None => return Err(self.fail(HandshakeError::UnexpectedPhase)),
        };
        let bytes = written.map_err(|e| self.fail(HandshakeError::Setup(e.to_string())))?;
        HandshakeMessage::from_noise(number, &bytes)
            .map_err(|_| self.fail(HandshakeError::MalformedMessage))
    }

    /// Pull both directional keys out of the finished Noise state.
    fn split(&mut self) -> Result<SessionKeys, HandshakeError> {
        let mut state = match self.state.take() {
            Some(s) if s.is_handshake_finished() => s,
            _ => return Err(self.fail(HandshakeError::UnexpectedPhase)),
        };

        let transcript_hash: [u8; 32] = match state.get_handshake_hash().try_into() {
            Ok(h) => h,
            Err(_) => return Err(self.fail(HandshakeError::MalformedMessage)),
        };
        let remote_static: [u8; 32] = match state.get_remote_static().map(<[u8; 32]>::try_from) {
            Some(Ok(k)) => k,
            _ => return Err(self.fail(HandshakeError::MalformedMessage)),
        };

        // k1 protects initiator → responder, k2 the reverse.
        let (k1, k2) = state.dangerously_get_raw_split();
        let (k1, k2) = (Zeroizing::new(k1), Zeroizing::new(k2));
        let (send, recv) = match self.role {
            Role::Initiator => (CipherState::new(*k1), CipherState::new(*k2)),
            Role::Responder => (CipherState::new(*k2), CipherState::new(*k1)),
        };

        self.phase = Phase::Established;
        Ok(SessionKeys {
            send,
            recv,
            transcript_hash,
            remote_static,
        })
    }

    fn fail(&mut self, err: HandshakeError) -> HandshakeError {
        self.phase = Phase::Failed;
        self.state = None;
        err
    }
}

fn builder<'a>() -> Result<Builder<'a>, HandshakeError> {
    let params = NOISE_PATTERN.parse().map_err(|_| HandshakeError::BadPattern)?;
    Ok(Builder::new(params))
}

fn classify(e: &snow::Error) -> HandshakeError {
    match e {
        snow::Error::Decrypt => HandshakeError::AuthenticationFailed,
        _ => HandshakeError::MalformedMessage,
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Why a handshake was abandoned. Never carries key material.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    #[error("malformed handshake message")]
    MalformedMessage,

    #[error("handshake authentication failed")]
    AuthenticationFailed,

    #[error("handshake message out of phase")]
    UnexpectedPhase,

    #[error("invalid Noise pattern string — this is a bug")]
    BadPattern,

    #[error("Noise setup failed: {0}")]
    Setup(String),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
