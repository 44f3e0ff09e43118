//! Core types for DKG session coordination

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

/// Roster identifier for one participant (1..=max_signers)
pub type Identifier = u16;

/// Opaque session token; sole addressing key after announcement
pub type SessionId = String;

/// Compressed SEC1 public key length
pub const PUBLIC_KEY_LEN: usize = 33;

/// Challenge value length (128 bits)
pub const CHALLENGE_LEN: usize = 16;

/// Phase of the DKG round state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Joining,
    Round1,
    Round2,
    Finalizing,
    Completed,
    Failed,
}

impl Phase {
    /// Terminal phases accept no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Completed | Phase::Failed)
    }

    /// Wire name, also used in error messages
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Joining => "joining",
            Phase::Round1 => "round1",
            Phase::Round2 => "round2",
            Phase::Finalizing => "finalizing",
            Phase::Completed => "completed",
            Phase::Failed => "failed",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One roster entry, immutable for the session's lifetime
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    /// Identifier assigned at announcement
    pub identifier: Identifier,
    /// Compressed curve point - stored as Vec for serde compatibility
    pub public_key: Vec<u8>,
}

/// Single-use login challenge bound to one connection
#[derive(Debug, Clone)]
pub struct Challenge {
    /// 128-bit random token
    pub value: [u8; CHALLENGE_LEN],
    /// Issuance timestamp
    pub issued_at: DateTime<Utc>,
}

/// Full state of one DKG session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Opaque unique token
    pub session_id: SessionId,
    /// Caller-chosen group label
    pub group_id: String,
    /// Threshold for later signing
    pub min_signers: u16,
    /// Roster size
    pub max_signers: u16,
    /// Insertion-ordered roster, fixed at announcement
    pub roster: Vec<Participant>,
    /// Current phase
    pub phase: Phase,
    /// Identifiers that completed the login handshake
    pub authenticated: BTreeSet<Identifier>,
    /// Round1 commitments, cleared on phase exit
    pub round1: BTreeMap<Identifier, Vec<u8>>,
    /// Round2 pairwise shares keyed by (from, to), cleared on phase exit
    pub round2: BTreeMap<(Identifier, Identifier), Vec<u8>>,
    /// Finalize confirmations: reported group verifying keys
    pub finalize: BTreeMap<Identifier, Vec<u8>>,
    /// Populated only on transition into Completed
    pub group_verifying_key: Option<Vec<u8>>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

impl Session {
    /// Look up a roster entry by identifier
    pub fn participant(&self, identifier: Identifier) -> Option<&Participant> {
        self.roster.iter().find(|p| p.identifier == identifier)
    }

    /// Look up the identifier owning a public key
    pub fn identifier_for_key(&self, public_key: &[u8]) -> Option<Identifier> {
        self.roster
            .iter()
            .find(|p| p.public_key == public_key)
            .map(|p| p.identifier)
    }

    /// Roster identifiers that have not yet satisfied the current phase
    pub fn missing_for_phase(&self, phase: Phase) -> Vec<Identifier> {
        let submitted: BTreeSet<Identifier> = match phase {
            Phase::Joining => self.authenticated.clone(),
            Phase::Round1 => self.round1.keys().copied().collect(),
            Phase::Round2 => self
                .roster
                .iter()
                .map(|p| p.identifier)
                .filter(|id| self.round2_complete_for(*id))
                .collect(),
            Phase::Finalizing => self.finalize.keys().copied().collect(),
            Phase::Completed | Phase::Failed => return Vec::new(),
        };

        self.roster
            .iter()
            .map(|p| p.identifier)
            .filter(|id| !submitted.contains(id))
            .collect()
    }

    /// Whether `from` has sent a share to every other identifier
    pub fn round2_complete_for(&self, from: Identifier) -> bool {
        self.roster
            .iter()
            .map(|p| p.identifier)
            .filter(|to| *to != from)
            .all(|to| self.round2.contains_key(&(from, to)))
    }
}

/// Per-phase deadline policy
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PhaseTimeouts {
    pub joining: Duration,
    pub round1: Duration,
    pub round2: Duration,
    pub finalizing: Duration,
}

impl PhaseTimeouts {
    /// Deadline for a live (non-terminal) phase
    pub fn for_phase(&self, phase: Phase) -> Option<Duration> {
        match phase {
            Phase::Joining => Some(self.joining),
            Phase::Round1 => Some(self.round1),
            Phase::Round2 => Some(self.round2),
            Phase::Finalizing => Some(self.finalizing),
            Phase::Completed | Phase::Failed => None,
        }
    }
}

impl Default for PhaseTimeouts {
    // Round2 stays >= Round1: share encryption is the expensive step
    fn default() -> Self {
        Self {
            joining: Duration::from_secs(300),
            round1: Duration::from_secs(180),
            round2: Duration::from_secs(300),
            finalizing: Duration::from_secs(120),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_session() -> Session {
        Session {
            session_id: "s1".into(),
            group_id: "g1".into(),
            min_signers: 2,
            max_signers: 3,
            roster: (1..=3)
                .map(|identifier| Participant {
                    identifier,
                    public_key: vec![identifier as u8; PUBLIC_KEY_LEN],
                })
                .collect(),
            phase: Phase::Joining,
            authenticated: BTreeSet::new(),
            round1: BTreeMap::new(),
            round2: BTreeMap::new(),
            finalize: BTreeMap::new(),
            group_verifying_key: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_missing_for_joining() {
        let mut session = sample_session();
        session.authenticated.insert(2);
        assert_eq!(session.missing_for_phase(Phase::Joining), vec![1, 3]);
    }

    #[test]
    fn test_round2_pairwise_tracking() {
        let mut session = sample_session();
        session.round2.insert((1, 2), vec![0]);
        assert!(!session.round2_complete_for(1));
        session.round2.insert((1, 3), vec![0]);
        assert!(session.round2_complete_for(1));
    }

    #[test]
    fn test_identifier_lookup() {
        let session = sample_session();
        assert_eq!(session.identifier_for_key(&[2u8; PUBLIC_KEY_LEN]), Some(2));
        assert_eq!(session.identifier_for_key(&[9u8; PUBLIC_KEY_LEN]), None);
    }

    #[test]
    fn test_default_timeout_ordering() {
        let timeouts = PhaseTimeouts::default();
        assert!(timeouts.round2 >= timeouts.round1);
        assert_eq!(timeouts.for_phase(Phase::Completed), None);
    }
}
