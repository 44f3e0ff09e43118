//! Coordinator event loop
//!
//! One task owns all mutable protocol state: connection bindings, live
//! challenges, the session store and the timeout supervisor. Participant
//! requests and phase deadlines arrive on a single command queue and are
//! applied strictly in arrival order, so submission handling and timeout
//! handling share one serialization point and cannot race. Nothing here
//! blocks while holding session state; suspension happens only between
//! commands.

use crate::auth;
use crate::error::{Error, Result};
use crate::registry::SessionStore;
use crate::rounds::{self, Advance};
use crate::timeout::{PhaseDeadline, TimeoutSupervisor};
use crate::types::{Identifier, Phase, PhaseTimeouts, Session, SessionId};
use dkg_wire::{ClientMessage, ServerMessage};
use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Connection identifier, assigned by the transport layer
pub type ConnId = u64;

/// Commands drained by the coordinator task
pub enum Command {
    /// A connection opened; pushes for it go to `outbound`
    Attach {
        conn: ConnId,
        outbound: mpsc::UnboundedSender<ServerMessage>,
    },
    /// A connection closed
    Detach { conn: ConnId },
    /// One participant message, answered through `reply`
    Request {
        conn: ConnId,
        message: ClientMessage,
        reply: oneshot::Sender<ServerMessage>,
    },
    /// A phase deadline elapsed
    Deadline(PhaseDeadline),
}

impl From<PhaseDeadline> for Command {
    fn from(deadline: PhaseDeadline) -> Self {
        Command::Deadline(deadline)
    }
}

/// Cloneable sender half used by connection handlers
#[derive(Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl CoordinatorHandle {
    pub fn attach(&self, conn: ConnId, outbound: mpsc::UnboundedSender<ServerMessage>) {
        let _ = self.tx.send(Command::Attach { conn, outbound });
    }

    pub fn detach(&self, conn: ConnId) {
        let _ = self.tx.send(Command::Detach { conn });
    }

    /// Send one request and await the synchronous reply
    pub async fn request(&self, conn: ConnId, message: ClientMessage) -> ServerMessage {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(Command::Request {
                conn,
                message,
                reply,
            })
            .is_err()
        {
            return ServerMessage::error("coordinator unavailable");
        }
        rx.await
            .unwrap_or_else(|_| ServerMessage::error("coordinator dropped the request"))
    }
}

/// Per-connection state held by the coordinator
struct ConnState {
    outbound: mpsc::UnboundedSender<ServerMessage>,
    /// Live challenge; replaced on re-request, consumed on login
    challenge: Option<crate::types::Challenge>,
    /// Set exactly once, by a successful login
    pubkey: Option<Vec<u8>>,
}

/// The coordinator task state
pub struct Coordinator {
    store: SessionStore,
    supervisor: TimeoutSupervisor<Command>,
    conns: HashMap<ConnId, ConnState>,
    rx: mpsc::UnboundedReceiver<Command>,
}

impl Coordinator {
    /// Build a coordinator over an injected store
    pub fn new(store: SessionStore, timeouts: PhaseTimeouts) -> (Self, CoordinatorHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let supervisor = TimeoutSupervisor::new(tx.clone(), timeouts);
        (
            Self {
                store,
                supervisor,
                conns: HashMap::new(),
                rx,
            },
            CoordinatorHandle { tx },
        )
    }

    /// Convenience: build and run on a spawned task
    pub fn spawn(store: SessionStore, timeouts: PhaseTimeouts) -> CoordinatorHandle {
        let (coordinator, handle) = Self::new(store, timeouts);
        tokio::spawn(coordinator.run());
        handle
    }

    /// Drain the command queue until every handle is dropped
    pub async fn run(mut self) {
        while let Some(command) = self.rx.recv().await {
            self.handle(command);
        }
        debug!("Coordinator queue closed, shutting down");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Attach { conn, outbound } => {
                debug!(conn, "Connection attached");
                self.conns.insert(
                    conn,
                    ConnState {
                        outbound,
                        challenge: None,
                        pubkey: None,
                    },
                );
            }
            Command::Detach { conn } => {
                // Dropping an anonymous connection touches no session; an
                // authenticated one is left to the phase deadline.
                debug!(conn, "Connection detached");
                self.conns.remove(&conn);
            }
            Command::Request {
                conn,
                message,
                reply,
            } => {
                let response = self
                    .dispatch(conn, message)
                    .unwrap_or_else(ServerMessage::error);
                let _ = reply.send(response);
            }
            Command::Deadline(deadline) => self.handle_deadline(deadline),
        }
    }

    fn dispatch(&mut self, conn: ConnId, message: ClientMessage) -> Result<ServerMessage> {
        match message {
            ClientMessage::RequestChallenge => self.request_challenge(conn),
            ClientMessage::Login {
                challenge,
                pubkey,
                signature,
            } => self.login(conn, &challenge, &pubkey, &signature),
            ClientMessage::AnnounceSession {
                min_signers,
                max_signers,
                group_id,
                participants,
                participants_pubs,
            } => self.announce(
                min_signers,
                max_signers,
                &group_id,
                &participants,
                participants_pubs,
            ),
            ClientMessage::Round1Submit {
                session,
                identifier,
                commitment,
            } => self.round1_submit(conn, session, identifier, &commitment),
            ClientMessage::Round2Submit {
                session,
                identifier,
                recipient,
                encrypted_share,
            } => self.round2_submit(conn, session, identifier, recipient, &encrypted_share),
            ClientMessage::FinalizeSubmit {
                session,
                identifier,
                verifying_key,
            } => self.finalize_submit(conn, session, identifier, &verifying_key),
            ClientMessage::AbortSession { session } => self.abort_session(conn, session),
        }
    }

    fn request_challenge(&mut self, conn: ConnId) -> Result<ServerMessage> {
        let state = self.conn_mut(conn)?;
        let challenge = auth::issue_challenge();
        let value = hex::encode(challenge.value);
        // A fresh request invalidates any prior unconsumed challenge
        state.challenge = Some(challenge);
        Ok(ServerMessage::Challenge { challenge: value })
    }

    fn login(
        &mut self,
        conn: ConnId,
        challenge: &str,
        pubkey: &str,
        signature: &str,
    ) -> Result<ServerMessage> {
        let live = {
            let state = self.conn_mut(conn)?;
            if state.pubkey.is_some() {
                return Err(Error::AlreadyAuthenticated);
            }
            // Consumed on first attempt, success or failure; replays fail
            state.challenge.take().ok_or(Error::UnknownChallenge)?
        };

        let presented = hex::decode(challenge)?;
        let pubkey_bytes = hex::decode(pubkey)?;
        let signature_bytes = hex::decode(signature)?;

        auth::verify_login(&live, &presented, &pubkey_bytes, &signature_bytes)?;

        let session_ids = self.store.sessions_with_key(&pubkey_bytes);
        if session_ids.is_empty() {
            return Err(Error::UnknownPublicKey);
        }

        // Bind the identity before touching any session, so the pushes
        // this login itself triggers reach this connection too.
        self.conn_mut(conn)?.pubkey = Some(pubkey_bytes.clone());

        let mut user_id: Option<Identifier> = None;
        for session_id in &session_ids {
            let advance = self.store.update(session_id, |session| {
                let identifier = session
                    .identifier_for_key(&pubkey_bytes)
                    .ok_or(Error::UnknownPublicKey)?;
                if user_id.is_none() {
                    user_id = Some(identifier);
                }
                if session.phase == Phase::Joining {
                    rounds::mark_authenticated(session, identifier)
                } else {
                    // Reconnection into a running session keeps its standing
                    session.authenticated.insert(identifier);
                    Ok(Advance::None)
                }
            })?;

            if matches!(advance, Advance::Round1Started) {
                self.supervisor.arm(session_id, Phase::Round1);
                let snapshot = self.store.get(session_id)?;
                info!(session_id = %session_id, "Roster fully authenticated, Round1 open");
                self.broadcast(
                    &snapshot,
                    &ServerMessage::Round1Started {
                        session: session_id.clone(),
                    },
                );
            }
        }

        let user_id = user_id.ok_or(Error::UnknownPublicKey)?;

        info!(conn, user_id, "Login verified");
        Ok(ServerMessage::LoginOk {
            user_id,
            access_token: Uuid::new_v4().to_string(),
        })
    }

    fn announce(
        &mut self,
        min_signers: u16,
        max_signers: u16,
        group_id: &str,
        participants: &[Identifier],
        participants_pubs: Vec<(Identifier, String)>,
    ) -> Result<ServerMessage> {
        if participants.len() != participants_pubs.len()
            || participants
                .iter()
                .any(|id| !participants_pubs.iter().any(|(pid, _)| pid == id))
        {
            return Err(Error::InvalidRoster(
                "participants and participants_pubs disagree".into(),
            ));
        }

        let roster = participants_pubs
            .into_iter()
            .map(|(identifier, pk)| Ok((identifier, hex::decode(&pk)?)))
            .collect::<Result<Vec<_>>>()?;

        let session = self
            .store
            .announce(min_signers, max_signers, group_id, roster)?;
        self.supervisor.arm(&session.session_id, Phase::Joining);

        info!(
            session_id = %session.session_id,
            group_id,
            min_signers,
            max_signers,
            "Session announced"
        );
        Ok(ServerMessage::SessionCreated {
            session: session.session_id,
        })
    }

    fn round1_submit(
        &mut self,
        conn: ConnId,
        session_id: SessionId,
        identifier: Identifier,
        commitment: &str,
    ) -> Result<ServerMessage> {
        let pubkey = self.authenticated_key(conn)?;
        let payload = hex::decode(commitment)?;

        let advance = self.store.update(&session_id, |session| {
            if session.identifier_for_key(&pubkey) != Some(identifier) {
                return Err(Error::NotAuthorized);
            }
            rounds::submit_round1(session, identifier, payload)
        })?;

        if let Advance::Round1Complete(commitments) = advance {
            self.supervisor.arm(&session_id, Phase::Round2);
            let snapshot = self.store.get(&session_id)?;
            info!(session_id = %session_id, "Round1 complete, commitments published");
            self.broadcast(
                &snapshot,
                &ServerMessage::Round1Complete {
                    session: session_id.clone(),
                    commitments: commitments
                        .into_iter()
                        .map(|(id, c)| (id, hex::encode(c)))
                        .collect(),
                },
            );
        }

        Ok(ServerMessage::Ack {
            session: session_id,
            phase: Phase::Round1.to_string(),
        })
    }

    fn round2_submit(
        &mut self,
        conn: ConnId,
        session_id: SessionId,
        identifier: Identifier,
        recipient: Identifier,
        encrypted_share: &str,
    ) -> Result<ServerMessage> {
        let pubkey = self.authenticated_key(conn)?;
        let payload = hex::decode(encrypted_share)?;

        let advance = self.store.update(&session_id, |session| {
            if session.identifier_for_key(&pubkey) != Some(identifier) {
                return Err(Error::NotAuthorized);
            }
            rounds::submit_round2(session, identifier, recipient, payload)
        })?;

        if let Advance::Round2Complete(deliveries) = advance {
            self.supervisor.arm(&session_id, Phase::Finalizing);
            let snapshot = self.store.get(&session_id)?;
            info!(session_id = %session_id, "Round2 complete, shares delivered");
            for (to, shares) in deliveries {
                self.send_to(
                    &snapshot,
                    to,
                    ServerMessage::Round2Complete {
                        session: session_id.clone(),
                        shares: shares
                            .into_iter()
                            .map(|(from, share)| (from, hex::encode(share)))
                            .collect(),
                    },
                );
            }
        }

        Ok(ServerMessage::Ack {
            session: session_id,
            phase: Phase::Round2.to_string(),
        })
    }

    fn finalize_submit(
        &mut self,
        conn: ConnId,
        session_id: SessionId,
        identifier: Identifier,
        verifying_key: &str,
    ) -> Result<ServerMessage> {
        let pubkey = self.authenticated_key(conn)?;
        let payload = hex::decode(verifying_key)?;

        let result = self.store.update(&session_id, |session| {
            if session.identifier_for_key(&pubkey) != Some(identifier) {
                return Err(Error::NotAuthorized);
            }
            rounds::submit_finalize(session, identifier, payload)
        });

        match result {
            Ok(Advance::Completed(key)) => {
                self.supervisor.cancel(&session_id);
                let snapshot = self.store.get(&session_id)?;
                let verifying_key = hex::encode(key);
                info!(session_id = %session_id, verifying_key = %verifying_key, "Session completed");
                self.broadcast(
                    &snapshot,
                    &ServerMessage::SessionCompleted {
                        session: session_id.clone(),
                        verifying_key: verifying_key.clone(),
                    },
                );
                Ok(ServerMessage::SessionCompleted {
                    session: session_id,
                    verifying_key,
                })
            }
            Ok(_) => Ok(ServerMessage::Ack {
                session: session_id,
                phase: Phase::Finalizing.to_string(),
            }),
            Err(Error::FinalizeDisagreement) => {
                // Session-fatal: every bound connection learns about it
                self.supervisor.cancel(&session_id);
                warn!(session_id = %session_id, "Finalize disagreement, session failed");
                if let Ok(snapshot) = self.store.get(&session_id) {
                    self.broadcast(
                        &snapshot,
                        &ServerMessage::SessionFailed {
                            session: session_id.clone(),
                            message: Error::FinalizeDisagreement.to_string(),
                            unresponsive: Vec::new(),
                        },
                    );
                }
                Err(Error::FinalizeDisagreement)
            }
            Err(e) => Err(e),
        }
    }

    fn abort_session(&mut self, conn: ConnId, session_id: SessionId) -> Result<ServerMessage> {
        let pubkey = self.authenticated_key(conn)?;

        let aborted = self.store.update(&session_id, |session| {
            if session.identifier_for_key(&pubkey).is_none() {
                return Err(Error::NotAuthorized);
            }
            Ok(rounds::abort(session))
        })?;

        if aborted {
            self.supervisor.cancel(&session_id);
            warn!(session_id = %session_id, "Session aborted by participant");
            if let Ok(snapshot) = self.store.get(&session_id) {
                self.broadcast(
                    &snapshot,
                    &ServerMessage::SessionFailed {
                        session: session_id.clone(),
                        message: "session aborted by participant".into(),
                        unresponsive: Vec::new(),
                    },
                );
            }
        }

        Ok(ServerMessage::Ack {
            session: session_id,
            phase: Phase::Failed.to_string(),
        })
    }

    fn handle_deadline(&mut self, deadline: PhaseDeadline) {
        let failed = self.store.update(&deadline.session_id, |session| {
            Ok(rounds::fail_on_deadline(session, deadline.phase))
        });

        match failed {
            Ok(Some(missing)) => {
                // Confirmed fire: the session failed, tear its timer down.
                // A stale event must not touch the timer, which by then
                // belongs to the next phase.
                self.supervisor.cancel(&deadline.session_id);
                let error = Error::Timeout {
                    phase: deadline.phase.to_string(),
                    missing: missing.clone(),
                };
                warn!(
                    session_id = %deadline.session_id,
                    phase = %deadline.phase,
                    missing = ?missing,
                    "Phase deadline elapsed, session failed"
                );
                if let Ok(snapshot) = self.store.get(&deadline.session_id) {
                    self.broadcast(
                        &snapshot,
                        &ServerMessage::SessionFailed {
                            session: deadline.session_id.clone(),
                            message: error.to_string(),
                            unresponsive: missing,
                        },
                    );
                }
            }
            // Completed or advanced via a race with the last submission
            Ok(None) => {
                debug!(session_id = %deadline.session_id, phase = %deadline.phase, "Stale deadline ignored")
            }
            Err(_) => {
                debug!(session_id = %deadline.session_id, "Deadline for unknown session ignored")
            }
        }
    }

    fn conn_mut(&mut self, conn: ConnId) -> Result<&mut ConnState> {
        self.conns
            .get_mut(&conn)
            .ok_or_else(|| Error::Internal("connection not attached".into()))
    }

    fn authenticated_key(&self, conn: ConnId) -> Result<Vec<u8>> {
        self.conns
            .get(&conn)
            .and_then(|state| state.pubkey.clone())
            .ok_or(Error::NotAuthorized)
    }

    /// Push to every connection bound to a roster identifier
    fn broadcast(&self, session: &Session, message: &ServerMessage) {
        for state in self.conns.values() {
            if let Some(key) = &state.pubkey {
                if session.identifier_for_key(key).is_some() {
                    let _ = state.outbound.send(message.clone());
                }
            }
        }
    }

    /// Push to the connection(s) bound to one identifier
    fn send_to(&self, session: &Session, identifier: Identifier, message: ServerMessage) {
        for state in self.conns.values() {
            if let Some(key) = &state.pubkey {
                if session.identifier_for_key(key) == Some(identifier) {
                    let _ = state.outbound.send(message.clone());
                }
            }
        }
    }
}
