//! Session registry — exactly one session per endpoint.
//!
//! An established session is never replaced by an unauthenticated message.
//! A new message 1 for it starts a *challenger*: a responder handshake kept
//! beside the session, promoted only once its message 3 authenticates.
//!
//! Lock order: the map is only ever touched with no session lock held.
//! Iterating operations clone the slots out of the map first, then lock
//! sessions one at a time. Nothing here awaits; callers send the bytes
//! these methods return.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use knock_core::{Decoded, HandshakeError, HandshakeMessage, Keypair, Phase, Role};

use crate::error::TransportError;
use crate::session::{Applied, Disposition, PeerSession, SessionId, SessionInfo};
use crate::trust::TrustPolicy;
use crate::Endpoint;

#[derive(Clone)]
struct SessionSlot {
    id: SessionId,
    session: Arc<Mutex<PeerSession>>,
}

/// Result of asking for an outbound handshake.
#[derive(Debug, PartialEq, Eq)]
pub enum Initiation {
    /// Message 1 to send.
    Started { session: SessionId, msg1: Vec<u8> },
    InProgress(SessionId),
    Established(SessionId),
}

#[derive(Debug, PartialEq, Eq)]
pub enum HandshakeOutcome {
    NeedsReply(Vec<u8>),
    Established {
        reply: Option<Vec<u8>>,
        remote_static: [u8; 32],
    },
    Failed(HandshakeError),
    /// Duplicates, simultaneous-open losers, strays to established sessions.
    Ignored,
}

/// Result of feeding one handshake message to the registry.
#[derive(Debug)]
pub struct Advance {
    /// The session the outcome belongs to, if any.
    pub session: Option<SessionId>,
    /// A session this message replaced.
    pub superseded: Option<RemovedSession>,
    pub outcome: HandshakeOutcome,
}

/// A session taken out of the registry. Its keys are already wiped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovedSession {
    pub endpoint: Endpoint,
    pub id: SessionId,
    pub was_established: bool,
}

pub struct SessionRegistry {
    sessions: DashMap<Endpoint, SessionSlot>,
    challengers: DashMap<Endpoint, SessionSlot>,
    keypair: Arc<Keypair>,
    trust: TrustPolicy,
    accept_inbound: bool,
    next_id: AtomicU64,
    sweeping: AtomicBool,
}

impl SessionRegistry {
    pub fn new(keypair: Arc<Keypair>, trust: TrustPolicy, accept_inbound: bool) -> Self {
        Self {
            sessions: DashMap::new(),
            challengers: DashMap::new(),
            keypair,
            trust,
            accept_inbound,
            next_id: AtomicU64::new(1),
            sweeping: AtomicBool::new(false),
        }
    }

    pub fn accepts_inbound(&self) -> bool {
        self.accept_inbound
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// True if `endpoint` has a session or a handshake running beside one.
    pub fn contains(&self, endpoint: Endpoint) -> bool {
        self.sessions.contains_key(&endpoint) || self.challengers.contains_key(&endpoint)
    }

    /// Id of the session currently registered for `endpoint`.
    pub fn current(&self, endpoint: Endpoint) -> Option<SessionId> {
        self.sessions.get(&endpoint).map(|slot| slot.id)
    }

    pub fn is_current(&self, endpoint: Endpoint, id: SessionId) -> bool {
        self.current(endpoint) == Some(id)
    }

    /// `id` is the current session or the challenger for `endpoint`.
    pub fn is_live(&self, endpoint: Endpoint, id: SessionId) -> bool {
        self.is_current(endpoint, id)
            || self
                .challengers
                .get(&endpoint)
                .is_some_and(|slot| slot.id == id)
    }

    /// The existing session for `endpoint`, else a fresh one with `role`.
    pub fn get_or_create(&self, endpoint: Endpoint, role: Role) -> Result<SessionId, HandshakeError> {
        Ok(self.slot_or_insert(endpoint, role)?.id)
    }

    /// Start an outbound handshake unless one exists already.
    pub fn initiate(&self, endpoint: Endpoint) -> Result<Initiation, HandshakeError> {
        let slot = self.slot_or_insert(endpoint, Role::Initiator)?;
        let started = {
            let mut session = lock(&slot.session);
            match session.phase() {
                Phase::Idle => session.start(Instant::now()),
                Phase::Established => return Ok(Initiation::Established(slot.id)),
                _ => return Ok(Initiation::InProgress(slot.id)),
            }
        };
        match started {
            Ok(msg1) => {
                tracing::debug!(peer = %endpoint, session = %slot.id, "handshake started");
                Ok(Initiation::Started {
                    session: slot.id,
                    msg1,
                })
            }
            Err(e) => {
                self.remove_session(endpoint, slot.id);
                Err(e)
            }
        }
    }

    /// Feed one inbound handshake message for `endpoint`.
    pub fn advance(&self, endpoint: Endpoint, msg: &HandshakeMessage, now: Instant) -> Advance {
        let mut superseded = None;
        let mut slot = match self.sessions.get(&endpoint).map(|s| s.value().clone()) {
            Some(slot) => slot,
            // The old session went away while its successor was mid-handshake.
            None if self.challengers.contains_key(&endpoint) => {
                return self.challenge(endpoint, msg, now);
            }
            None if msg.number() == 1 && self.accept_inbound => {
                match self.slot_or_insert(endpoint, Role::Responder) {
                    Ok(slot) => slot,
                    Err(e) => return failed(None, None, e),
                }
            }
            None => return ignored(None, None),
        };

        // At most one supersession per message: the replacement always
        // processes the message itself.
        for _ in 0..2 {
            let applied = {
                let mut session = lock(&slot.session);
                match session.classify(msg) {
                    Disposition::Process => Some(session.apply(msg, now)),
                    Disposition::Resend(bytes) => {
                        return Advance {
                            session: Some(slot.id),
                            superseded,
                            outcome: HandshakeOutcome::NeedsReply(bytes),
                        };
                    }
                    Disposition::Ignore => return ignored(Some(slot.id), superseded),
                    Disposition::Supersede if superseded.is_none() => None,
                    Disposition::Supersede => return ignored(Some(slot.id), superseded),
                    Disposition::Challenge => {
                        drop(session);
                        return self.challenge(endpoint, msg, now);
                    }
                }
            };

            match applied {
                Some(Ok(Applied::Reply(bytes))) => {
                    return Advance {
                        session: Some(slot.id),
                        superseded,
                        outcome: HandshakeOutcome::NeedsReply(bytes),
                    };
                }
                Some(Ok(Applied::Established {
                    reply,
                    remote_static,
                })) => {
                    if !self.trust.allows(&remote_static) {
                        tracing::warn!(
                            peer = %endpoint,
                            key = hex::encode(&remote_static[..8]),
                            "static key rejected by trust policy"
                        );
                        self.remove_session(endpoint, slot.id);
                        return failed(Some(slot.id), superseded, HandshakeError::AuthenticationFailed);
                    }
                    return Advance {
                        session: Some(slot.id),
                        superseded,
                        outcome: HandshakeOutcome::Established {
                            reply,
                            remote_static,
                        },
                    };
                }
                Some(Err(e)) => {
                    self.remove_session(endpoint, slot.id);
                    return failed(Some(slot.id), superseded, e);
                }
                None => match self.replace(endpoint, slot.id) {
                    Ok((old, fresh)) => {
                        tracing::info!(peer = %endpoint, old = %slot.id, new = %fresh.id, "session superseded");
                        superseded = old;
                        slot = fresh;
                    }
                    Err(e) => return failed(None, superseded, e),
                },
            }
        }
        ignored(Some(slot.id), superseded)
    }

    /// Feed `msg` to the handshake running beside `endpoint`'s established
    /// session, starting one for a message 1. The established session is
    /// swapped out only when the challenger completes and passes trust.
    fn challenge(&self, endpoint: Endpoint, msg: &HandshakeMessage, now: Instant) -> Advance {
        let mut slot = match self.challengers.get(&endpoint).map(|s| s.value().clone()) {
            Some(slot) => slot,
            None if msg.number() == 1 => match self.new_challenger(endpoint) {
                Ok(slot) => slot,
                Err(e) => return failed(None, None, e),
            },
            None => return ignored(self.current(endpoint), None),
        };

        for _ in 0..2 {
            let applied = {
                let mut session = lock(&slot.session);
                match session.classify(msg) {
                    Disposition::Process => session.apply(msg, now),
                    Disposition::Resend(bytes) => {
                        return Advance {
                            session: Some(slot.id),
                            superseded: None,
                            outcome: HandshakeOutcome::NeedsReply(bytes),
                        };
                    }
                    Disposition::Supersede => {
                        drop(session);
                        self.drop_challenger(endpoint, slot.id);
                        slot = match self.new_challenger(endpoint) {
                            Ok(fresh) => fresh,
                            Err(e) => return failed(None, None, e),
                        };
                        continue;
                    }
                    Disposition::Ignore | Disposition::Challenge => {
                        return ignored(Some(slot.id), None);
                    }
                }
            };

            return match applied {
                Ok(Applied::Reply(bytes)) => Advance {
                    session: Some(slot.id),
                    superseded: None,
                    outcome: HandshakeOutcome::NeedsReply(bytes),
                },
                Ok(Applied::Established {
                    reply,
                    remote_static,
                }) => {
                    if !self.trust.allows(&remote_static) {
                        tracing::warn!(
                            peer = %endpoint,
                            key = hex::encode(&remote_static[..8]),
                            "static key rejected by trust policy"
                        );
                        self.drop_challenger(endpoint, slot.id);
                        return failed(Some(slot.id), None, HandshakeError::AuthenticationFailed);
                    }
                    self.challengers.remove_if(&endpoint, |_, c| c.id == slot.id);
                    let superseded = self
                        .sessions
                        .insert(endpoint, slot.clone())
                        .map(|old| retire(endpoint, &old));
                    if let Some(old) = &superseded {
                        tracing::info!(peer = %endpoint, old = %old.id, new = %slot.id, "session superseded");
                    }
                    Advance {
                        session: Some(slot.id),
                        superseded,
                        outcome: HandshakeOutcome::Established {
                            reply,
                            remote_static,
                        },
                    }
                }
                Err(e) => {
                    self.drop_challenger(endpoint, slot.id);
                    failed(Some(slot.id), None, e)
                }
            };
        }
        ignored(Some(slot.id), None)
    }

    /// Fail an in-progress handshake. Established sessions are left alone.
    pub fn abort_handshake(&self, endpoint: Endpoint) -> Option<RemovedSession> {
        if let Some(id) = self.challengers.get(&endpoint).map(|c| c.id) {
            self.drop_challenger(endpoint, id);
        }
        let slot = self.sessions.get(&endpoint).map(|s| s.value().clone())?;
        if lock(&slot.session).is_established() {
            return None;
        }
        self.remove_session(endpoint, slot.id)
    }

    /// Tear down whatever session `endpoint` has.
    pub fn remove(&self, endpoint: Endpoint) -> Option<RemovedSession> {
        let (_, slot) = self.sessions.remove(&endpoint)?;
        Some(retire(endpoint, &slot))
    }

    /// Tear down `id`, only if it is still the session for `endpoint`.
    pub fn remove_session(&self, endpoint: Endpoint, id: SessionId) -> Option<RemovedSession> {
        let (_, slot) = self.sessions.remove_if(&endpoint, |_, slot| slot.id == id)?;
        Some(retire(endpoint, &slot))
    }

    /// Remove every session idle for at least `max_age`. A call that finds
    /// another sweep running returns immediately with nothing removed.
    pub fn sweep_idle(&self, max_age: Duration) -> Vec<RemovedSession> {
        if self
            .sweeping
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Vec::new();
        }
        let _guard = SweepGuard(&self.sweeping);

        let now = Instant::now();
        let stale: Vec<(Endpoint, SessionId)> = self
            .slots()
            .into_iter()
            .filter(|(_, slot)| lock(&slot.session).idle_for(now) >= max_age)
            .map(|(endpoint, slot)| (endpoint, slot.id))
            .collect();

        let removed: Vec<RemovedSession> = stale
            .into_iter()
            .filter_map(|(endpoint, id)| self.remove_session(endpoint, id))
            .collect();
        if !removed.is_empty() {
            tracing::debug!(count = removed.len(), "idle sessions swept");
        }
        removed
    }

    /// Handshake messages owed to peers that have not answered yet.
    pub fn due_retransmits(&self, now: Instant, interval: Duration) -> Vec<(Endpoint, SessionId, Vec<u8>)> {
        self.slots()
            .into_iter()
            .chain(self.challenger_slots())
            .filter_map(|(endpoint, slot)| {
                let bytes = lock(&slot.session).retransmit(now, interval)?;
                Some((endpoint, slot.id, bytes))
            })
            .collect()
    }

    /// Remove handshakes that have run longer than `timeout`. Expired
    /// challengers are dropped quietly; the sessions they raced stay.
    pub fn expire_handshakes(&self, now: Instant, timeout: Duration) -> Vec<RemovedSession> {
        for (endpoint, slot) in self.challenger_slots() {
            if lock(&slot.session).handshake_expired(now, timeout) {
                self.drop_challenger(endpoint, slot.id);
            }
        }

        let expired: Vec<(Endpoint, SessionId)> = self
            .slots()
            .into_iter()
            .filter(|(_, slot)| lock(&slot.session).handshake_expired(now, timeout))
            .map(|(endpoint, slot)| (endpoint, slot.id))
            .collect();
        expired
            .into_iter()
            .filter_map(|(endpoint, id)| self.remove_session(endpoint, id))
            .collect()
    }

    /// Keepalive packets for established sessions that have been quiet.
    pub fn due_keepalives(&self, now: Instant, interval: Duration) -> Vec<(Endpoint, SessionId, Vec<u8>)> {
        self.slots()
            .into_iter()
            .filter_map(|(endpoint, slot)| {
                match lock(&slot.session).keepalive(now, interval)? {
                    Ok(packet) => Some((endpoint, slot.id, packet)),
                    Err(e) => {
                        tracing::warn!(peer = %endpoint, error = %e, "keepalive not sealed");
                        None
                    }
                }
            })
            .collect()
    }

    /// Seal application data for session `id`.
    pub fn encode(&self, endpoint: Endpoint, id: SessionId, plaintext: &[u8]) -> Result<Vec<u8>, TransportError> {
        let slot = self.slot_for(endpoint, id)?;
        let packet = lock(&slot.session).encode(plaintext, Instant::now())?;
        Ok(packet)
    }

    pub fn close_notice(&self, endpoint: Endpoint, id: SessionId) -> Result<Vec<u8>, TransportError> {
        let slot = self.slot_for(endpoint, id)?;
        let packet = lock(&slot.session).close_notice()?;
        Ok(packet)
    }

    /// Open a sealed packet from `endpoint` under its current session.
    pub fn decode(&self, endpoint: Endpoint, packet: &[u8]) -> Result<(SessionId, Decoded), TransportError> {
        let slot = self
            .sessions
            .get(&endpoint)
            .map(|s| s.value().clone())
            .ok_or(TransportError::UnknownSession)?;
        let decoded = lock(&slot.session).decode(packet, Instant::now())?;
        Ok((slot.id, decoded))
    }

    pub fn info(&self, endpoint: Endpoint) -> Option<SessionInfo> {
        let slot = self.sessions.get(&endpoint).map(|s| s.value().clone())?;
        let info = lock(&slot.session).info();
        Some(info)
    }

    pub fn snapshot(&self) -> Vec<SessionInfo> {
        self.slots()
            .into_iter()
            .map(|(_, slot)| lock(&slot.session).info())
            .collect()
    }

    /// Remove everything. Used at shutdown.
    pub fn clear(&self) -> Vec<RemovedSession> {
        for (endpoint, slot) in self.challenger_slots() {
            self.drop_challenger(endpoint, slot.id);
        }
        self.slots()
            .into_iter()
            .filter_map(|(endpoint, slot)| self.remove_session(endpoint, slot.id))
            .collect()
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    fn slots(&self) -> Vec<(Endpoint, SessionSlot)> {
        self.sessions
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }

    fn challenger_slots(&self) -> Vec<(Endpoint, SessionSlot)> {
        self.challengers
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }

    fn new_challenger(&self, endpoint: Endpoint) -> Result<SessionSlot, HandshakeError> {
        let slot = self.new_slot(endpoint, Role::Responder)?;
        self.challengers.insert(endpoint, slot.clone());
        tracing::debug!(peer = %endpoint, session = %slot.id, "handshake started beside established session");
        Ok(slot)
    }

    fn drop_challenger(&self, endpoint: Endpoint, id: SessionId) {
        if let Some((_, slot)) = self.challengers.remove_if(&endpoint, |_, slot| slot.id == id) {
            retire(endpoint, &slot);
        }
    }

    fn slot_for(&self, endpoint: Endpoint, id: SessionId) -> Result<SessionSlot, TransportError> {
        match self.sessions.get(&endpoint) {
            Some(slot) if slot.id == id => Ok(slot.value().clone()),
            _ => Err(TransportError::UnknownSession),
        }
    }

    fn new_slot(&self, endpoint: Endpoint, role: Role) -> Result<SessionSlot, HandshakeError> {
        let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let session = PeerSession::new(id, endpoint, role, &self.keypair)?;
        tracing::trace!(peer = %endpoint, session = %id, ?role, "session created");
        Ok(SessionSlot {
            id,
            session: Arc::new(Mutex::new(session)),
        })
    }

    fn slot_or_insert(&self, endpoint: Endpoint, role: Role) -> Result<SessionSlot, HandshakeError> {
        match self.sessions.entry(endpoint) {
            Entry::Occupied(existing) => Ok(existing.get().clone()),
            Entry::Vacant(vacant) => {
                let slot = self.new_slot(endpoint, role)?;
                vacant.insert(slot.clone());
                Ok(slot)
            }
        }
    }

    /// Swap `old_id` for a fresh responder. If someone else already replaced
    /// it, the current slot is returned and nothing is retired.
    fn replace(
        &self,
        endpoint: Endpoint,
        old_id: SessionId,
    ) -> Result<(Option<RemovedSession>, SessionSlot), HandshakeError> {
        let (old, fresh) = match self.sessions.entry(endpoint) {
            Entry::Occupied(mut existing) if existing.get().id == old_id => {
                let fresh = self.new_slot(endpoint, Role::Responder)?;
                let old = existing.insert(fresh.clone());
                (Some(old), fresh)
            }
            Entry::Occupied(existing) => (None, existing.get().clone()),
            Entry::Vacant(vacant) => {
                let fresh = self.new_slot(endpoint, Role::Responder)?;
                vacant.insert(fresh.clone());
                (None, fresh)
            }
        };
        Ok((old.map(|slot| retire(endpoint, &slot)), fresh))
    }
}

/// Wipe a slot that has left the map.
fn retire(endpoint: Endpoint, slot: &SessionSlot) -> RemovedSession {
    let mut session = lock(&slot.session);
    let was_established = session.is_established();
    session.clear();
    tracing::debug!(peer = %endpoint, session = %slot.id, was_established, "session removed");
    RemovedSession {
        endpoint,
        id: slot.id,
        was_established,
    }
}

/// A poisoned session lock only means another lane panicked mid-update;
/// the state machine is still consistent enough to read or clear.
fn lock(session: &Mutex<PeerSession>) -> MutexGuard<'_, PeerSession> {
    session.lock().unwrap_or_else(PoisonError::into_inner)
}

fn ignored(session: Option<SessionId>, superseded: Option<RemovedSession>) -> Advance {
    Advance {
        session,
        superseded,
        outcome: HandshakeOutcome::Ignored,
    }
}

fn failed(
    session: Option<SessionId>,
    superseded: Option<RemovedSession>,
    error: HandshakeError,
) -> Advance {
    Advance {
        session,
        superseded,
        outcome: HandshakeOutcome::Failed(error),
    }
}

struct SweepGuard<'a>(&'a AtomicBool);

impl Drop for SweepGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
