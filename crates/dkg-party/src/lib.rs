//! Participant Client
//!
//! Drives one participant through the coordinated DKG: challenge/response
//! login, session announcement, and the three protocol rounds. The client
//! talks JSON frames over a WebSocket connection to the coordinator and
//! performs all secret-dependent computation locally; only commitments,
//! encrypted shares and the derived group key ever leave the process.

use dkg_core::crypto::{self, vss};
use dkg_core::{Error, Identifier, Result};
use dkg_wire::{decode_server, encode, ClientMessage, ServerMessage};
use futures_util::{SinkExt, StreamExt};
use k256::ecdsa::SigningKey;
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, instrument};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Key share produced by a completed DKG session
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct KeyShare {
    /// This participant's roster identifier
    pub identifier: Identifier,
    /// Threshold for later signing
    pub min_signers: u16,
    /// Roster size
    pub max_signers: u16,
    /// Aggregated secret share
    pub secret_share: [u8; 32],
    /// Group verifying key agreed in Finalizing
    #[zeroize(skip)]
    pub group_verifying_key: Vec<u8>,
    /// Session that produced this share
    #[zeroize(skip)]
    pub session_id: String,
}

/// WebSocket client for one participant connection
pub struct PartyClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    /// Pushes that arrived ahead of the reply we were awaiting
    pending: VecDeque<ServerMessage>,
}

impl PartyClient {
    /// Connect to the coordinator's WebSocket endpoint
    pub async fn connect(url: &str) -> Result<Self> {
        let (ws, _) = connect_async(url)
            .await
            .map_err(|e| Error::Internal(format!("connect failed: {}", e)))?;
        debug!(url, "Connected to coordinator");
        Ok(Self {
            ws,
            pending: VecDeque::new(),
        })
    }

    async fn send(&mut self, message: &ClientMessage) -> Result<()> {
        self.ws
            .send(Message::Text(encode(message)))
            .await
            .map_err(|e| Error::Internal(format!("send failed: {}", e)))
    }

    /// Read one frame off the socket, never from the pending queue
    async fn read_frame(&mut self) -> Result<ServerMessage> {
        while let Some(frame) = self.ws.next().await {
            match frame.map_err(|e| Error::Internal(e.to_string()))? {
                Message::Text(text) => {
                    return decode_server(&text).map_err(|e| Error::Serialization(e.to_string()))
                }
                Message::Close(_) => break,
                _ => continue,
            }
        }
        Err(Error::Internal("coordinator closed the connection".into()))
    }

    /// Non-matching traffic: errors and session failure are terminal,
    /// acks are dropped, phase pushes are queued for a later waiter.
    fn stash_or_fail(&mut self, session: Option<&str>, message: ServerMessage) -> Result<()> {
        match message {
            ServerMessage::Error { message } => Err(Error::Internal(message)),
            ServerMessage::SessionFailed {
                session: s,
                message,
                unresponsive,
            } if session.map_or(true, |wanted| wanted == s) => Err(Error::Internal(format!(
                "session failed: {} (unresponsive: {:?})",
                message, unresponsive
            ))),
            ServerMessage::Ack { .. } => Ok(()),
            other => {
                self.pending.push_back(other);
                Ok(())
            }
        }
    }

    /// Complete the proof-of-possession handshake for `key`
    #[instrument(skip(self, key))]
    pub async fn login(&mut self, key: &SigningKey) -> Result<(Identifier, String)> {
        self.send(&ClientMessage::RequestChallenge).await?;
        let challenge = loop {
            match self.read_frame().await? {
                ServerMessage::Challenge { challenge } => break challenge,
                other => self.stash_or_fail(None, other)?,
            }
        };

        let challenge_bytes = hex::decode(&challenge)?;
        let signature = crypto::sign_challenge(key, &challenge_bytes)?;

        self.send(&ClientMessage::Login {
            challenge,
            pubkey: hex::encode(key.verifying_key().to_sec1_bytes()),
            signature: hex::encode(signature.to_bytes()),
        })
        .await?;

        loop {
            match self.read_frame().await? {
                ServerMessage::LoginOk {
                    user_id,
                    access_token,
                } => {
                    info!(user_id, "Login accepted");
                    return Ok((user_id, access_token));
                }
                other => self.stash_or_fail(None, other)?,
            }
        }
    }

    /// Announce a new session and return its id
    pub async fn announce_session(
        &mut self,
        min_signers: u16,
        group_id: &str,
        roster: &[(Identifier, Vec<u8>)],
    ) -> Result<String> {
        self.send(&ClientMessage::AnnounceSession {
            min_signers,
            max_signers: roster.len() as u16,
            group_id: group_id.to_string(),
            participants: roster.iter().map(|(id, _)| *id).collect(),
            participants_pubs: roster
                .iter()
                .map(|(id, pk)| (*id, hex::encode(pk)))
                .collect(),
        })
        .await?;

        loop {
            match self.read_frame().await? {
                ServerMessage::SessionCreated { session } => {
                    info!(session = %session, "Session announced");
                    return Ok(session);
                }
                other => self.stash_or_fail(None, other)?,
            }
        }
    }

    /// Run the full DKG for an already-announced session.
    ///
    /// `roster` must list every participant's identifier and roster public
    /// key; shares are encrypted to those keys for Round2.
    #[instrument(skip(self, key, roster))]
    pub async fn run_dkg(
        &mut self,
        session: &str,
        identifier: Identifier,
        min_signers: u16,
        key: &SigningKey,
        roster: &[(Identifier, Vec<u8>)],
    ) -> Result<KeyShare> {
        let roster_keys: BTreeMap<Identifier, &Vec<u8>> =
            roster.iter().map(|(id, pk)| (*id, pk)).collect();

        // Wait for the whole roster to authenticate
        self.wait_round1_started(session).await?;

        // Round1: publish polynomial commitments
        let (poly, package) = vss::generate(min_signers, &mut OsRng)?;
        self.send(&ClientMessage::Round1Submit {
            session: session.to_string(),
            identifier,
            commitment: hex::encode(package.to_bytes()?),
        })
        .await?;

        let published = self.wait_round1_complete(session).await?;
        debug!(parties = published.len(), "Commitments collected");

        // Round2: encrypt one polynomial evaluation to each peer
        for (to, recipient_key) in roster_keys.iter().filter(|(to, _)| **to != identifier) {
            let envelope = crypto::encrypt_share(recipient_key, &poly.share_bytes_for(*to))?;
            self.send(&ClientMessage::Round2Submit {
                session: session.to_string(),
                identifier,
                recipient: *to,
                encrypted_share: hex::encode(envelope),
            })
            .await?;
        }

        let incoming = self.wait_round2_complete(session).await?;

        // Decrypt and verify every incoming share before aggregating; a
        // bad share is grounds to abort the whole session.
        let mut received = Vec::with_capacity(incoming.len());
        for (from, envelope) in incoming {
            let plaintext = crypto::decrypt_share(key, &envelope)?;
            let share = vss::scalar_from_bytes(&plaintext)?;
            let sender = published
                .get(&from)
                .ok_or_else(|| Error::Crypto(format!("no commitments from {}", from)))?;
            if let Err(e) = vss::verify_share(&share, sender, identifier) {
                self.send(&ClientMessage::AbortSession {
                    session: session.to_string(),
                })
                .await?;
                return Err(e);
            }
            received.push(share);
        }

        let packages: Vec<_> = published.values().cloned().collect();
        let group_verifying_key = vss::group_verifying_key(&packages)?;
        let secret = vss::aggregate_secret_share(poly.share_for(identifier), &received);

        // Finalizing: report the derived group key for agreement
        self.send(&ClientMessage::FinalizeSubmit {
            session: session.to_string(),
            identifier,
            verifying_key: hex::encode(&group_verifying_key),
        })
        .await?;

        let agreed = self.wait_completed(session).await?;
        if agreed != group_verifying_key {
            return Err(Error::Crypto("coordinator reported a different group key".into()));
        }

        info!(
            session = %session,
            group_verifying_key = %hex::encode(&group_verifying_key),
            "DKG completed"
        );

        Ok(KeyShare {
            identifier,
            min_signers,
            max_signers: roster.len() as u16,
            secret_share: secret.to_bytes().into(),
            group_verifying_key,
            session_id: session.to_string(),
        })
    }

    /// Pull the next push matching `wanted`, draining the pending queue
    /// before touching the socket.
    async fn wait_for(
        &mut self,
        session: &str,
        wanted: impl Fn(&ServerMessage) -> bool,
    ) -> Result<ServerMessage> {
        if let Some(pos) = self.pending.iter().position(&wanted) {
            if let Some(message) = self.pending.remove(pos) {
                return Ok(message);
            }
        }
        loop {
            let message = self.read_frame().await?;
            if wanted(&message) {
                return Ok(message);
            }
            self.stash_or_fail(Some(session), message)?;
        }
    }

    async fn wait_round1_started(&mut self, session: &str) -> Result<()> {
        self.wait_for(session, |m| {
            matches!(m, ServerMessage::Round1Started { session: s } if s == session)
        })
        .await?;
        Ok(())
    }

    async fn wait_round1_complete(
        &mut self,
        session: &str,
    ) -> Result<BTreeMap<Identifier, vss::CommitmentPackage>> {
        let message = self
            .wait_for(session, |m| {
                matches!(m, ServerMessage::Round1Complete { session: s, .. } if s == session)
            })
            .await?;
        match message {
            ServerMessage::Round1Complete { commitments, .. } => {
                let mut published = BTreeMap::new();
                for (id, encoded) in commitments {
                    let bytes = hex::decode(&encoded)?;
                    published.insert(id, vss::CommitmentPackage::from_bytes(&bytes)?);
                }
                Ok(published)
            }
            _ => unreachable!(),
        }
    }

    async fn wait_round2_complete(
        &mut self,
        session: &str,
    ) -> Result<Vec<(Identifier, Vec<u8>)>> {
        let message = self
            .wait_for(session, |m| {
                matches!(m, ServerMessage::Round2Complete { session: s, .. } if s == session)
            })
            .await?;
        match message {
            ServerMessage::Round2Complete { shares, .. } => shares
                .into_iter()
                .map(|(from, envelope)| Ok((from, hex::decode(&envelope)?)))
                .collect(),
            _ => unreachable!(),
        }
    }

    async fn wait_completed(&mut self, session: &str) -> Result<Vec<u8>> {
        let message = self
            .wait_for(session, |m| {
                matches!(m, ServerMessage::SessionCompleted { session: s, .. } if s == session)
            })
            .await?;
        match message {
            ServerMessage::SessionCompleted { verifying_key, .. } => {
                Ok(hex::decode(&verifying_key)?)
            }
            _ => unreachable!(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_share_roundtrip() {
        let share = KeyShare {
            identifier: 2,
            min_signers: 2,
            max_signers: 3,
            secret_share: [7u8; 32],
            group_verifying_key: vec![2u8; 33],
            session_id: "s1".into(),
        };

        let json = serde_json::to_string(&share).unwrap();
        let parsed: KeyShare = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.identifier, 2);
        assert_eq!(parsed.secret_share, [7u8; 32]);
        assert_eq!(parsed.group_verifying_key, share.group_verifying_key);
    }
}
