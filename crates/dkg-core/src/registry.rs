//! Session registry
//!
//! In-memory table of sessions keyed by session id. One store is built per
//! coordinator instance rather than held in a global, so every test can
//! inject an isolated registry. The coordinator event loop is the only
//! writer; entry locks keep each mutation confined to its own session.

use crate::error::{Error, Result};
use crate::types::{
    Identifier, Participant, Phase, Session, SessionId, PUBLIC_KEY_LEN,
};
use chrono::Utc;
use dashmap::DashMap;
use k256::ecdsa::VerifyingKey;
use std::collections::BTreeSet;
use std::sync::Arc;
use uuid::Uuid;

/// Registry of active and archived sessions
#[derive(Clone, Default)]
pub struct SessionStore {
    sessions: Arc<DashMap<SessionId, Session>>,
}

impl SessionStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate a roster and allocate a session in the Joining phase.
    ///
    /// The roster is fixed from here on; re-announcing a group creates a
    /// new session rather than patching an existing one.
    pub fn announce(
        &self,
        min_signers: u16,
        max_signers: u16,
        group_id: &str,
        roster: Vec<(Identifier, Vec<u8>)>,
    ) -> Result<Session> {
        if min_signers < 2 {
            return Err(Error::InvalidRoster("min_signers must be at least 2".into()));
        }
        if min_signers > max_signers {
            return Err(Error::InvalidRoster(
                "min_signers cannot exceed max_signers".into(),
            ));
        }
        if roster.len() != max_signers as usize {
            return Err(Error::InvalidRoster(format!(
                "roster has {} entries, expected {}",
                roster.len(),
                max_signers
            )));
        }

        let mut seen = BTreeSet::new();
        for (identifier, public_key) in &roster {
            if *identifier == 0 || *identifier > max_signers {
                return Err(Error::InvalidRoster(format!(
                    "identifier {} out of range 1..={}",
                    identifier, max_signers
                )));
            }
            if !seen.insert(*identifier) {
                return Err(Error::InvalidRoster(format!(
                    "duplicate identifier {}",
                    identifier
                )));
            }
            if public_key.len() != PUBLIC_KEY_LEN
                || VerifyingKey::from_sec1_bytes(public_key).is_err()
            {
                return Err(Error::InvalidRoster(format!(
                    "identifier {} has a malformed public key",
                    identifier
                )));
            }
        }

        let session = Session {
            session_id: Uuid::new_v4().to_string(),
            group_id: group_id.to_string(),
            min_signers,
            max_signers,
            roster: roster
                .into_iter()
                .map(|(identifier, public_key)| Participant {
                    identifier,
                    public_key,
                })
                .collect(),
            phase: Phase::Joining,
            authenticated: Default::default(),
            round1: Default::default(),
            round2: Default::default(),
            finalize: Default::default(),
            group_verifying_key: None,
            created_at: Utc::now(),
        };

        self.sessions
            .insert(session.session_id.clone(), session.clone());
        Ok(session)
    }

    /// Read-only snapshot of a session
    pub fn get(&self, session_id: &str) -> Result<Session> {
        self.sessions
            .get(session_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))
    }

    /// Mutate one session under its entry lock
    pub fn update<R>(
        &self,
        session_id: &str,
        f: impl FnOnce(&mut Session) -> Result<R>,
    ) -> Result<R> {
        let mut entry = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;
        f(entry.value_mut())
    }

    /// Ids of non-terminal sessions whose roster contains `public_key`
    pub fn sessions_with_key(&self, public_key: &[u8]) -> Vec<SessionId> {
        self.sessions
            .iter()
            .filter(|entry| {
                !entry.phase.is_terminal() && entry.identifier_for_key(public_key).is_some()
            })
            .map(|entry| entry.session_id.clone())
            .collect()
    }

    /// Number of sessions, terminal ones included
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// True when no sessions exist
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k256::ecdsa::SigningKey;
    use rand_core::OsRng;

    fn pubkey() -> Vec<u8> {
        SigningKey::random(&mut OsRng)
            .verifying_key()
            .to_sec1_bytes()
            .to_vec()
    }

    fn roster(n: u16) -> Vec<(Identifier, Vec<u8>)> {
        (1..=n).map(|id| (id, pubkey())).collect()
    }

    #[test]
    fn test_announce_and_get() {
        let store = SessionStore::new();
        let session = store.announce(2, 3, "vault", roster(3)).unwrap();

        assert_eq!(session.phase, Phase::Joining);
        assert_eq!(session.roster.len(), 3);

        let fetched = store.get(&session.session_id).unwrap();
        assert_eq!(fetched.group_id, "vault");
    }

    #[test]
    fn test_get_unknown_session() {
        let store = SessionStore::new();
        assert!(matches!(
            store.get("missing").unwrap_err(),
            Error::SessionNotFound(_)
        ));
    }

    #[test]
    fn test_threshold_validation() {
        let store = SessionStore::new();
        assert!(matches!(
            store.announce(1, 3, "g", roster(3)).unwrap_err(),
            Error::InvalidRoster(_)
        ));
        assert!(matches!(
            store.announce(4, 3, "g", roster(3)).unwrap_err(),
            Error::InvalidRoster(_)
        ));
    }

    #[test]
    fn test_roster_size_must_match_max_signers() {
        let store = SessionStore::new();
        assert!(matches!(
            store.announce(2, 3, "g", roster(2)).unwrap_err(),
            Error::InvalidRoster(_)
        ));
    }

    #[test]
    fn test_rejects_duplicate_and_out_of_range_identifiers() {
        let store = SessionStore::new();

        let mut dup = roster(3);
        dup[2].0 = 1;
        assert!(matches!(
            store.announce(2, 3, "g", dup).unwrap_err(),
            Error::InvalidRoster(_)
        ));

        let mut oob = roster(3);
        oob[2].0 = 9;
        assert!(matches!(
            store.announce(2, 3, "g", oob).unwrap_err(),
            Error::InvalidRoster(_)
        ));
    }

    #[test]
    fn test_rejects_malformed_public_key() {
        let store = SessionStore::new();
        let mut bad = roster(3);
        bad[1].1 = vec![0u8; PUBLIC_KEY_LEN];
        assert!(matches!(
            store.announce(2, 3, "g", bad).unwrap_err(),
            Error::InvalidRoster(_)
        ));
    }

    #[test]
    fn test_sessions_with_key_skips_terminal() {
        let store = SessionStore::new();
        let r = roster(2);
        let key = r[0].1.clone();
        let session = store.announce(2, 2, "g", r).unwrap();

        assert_eq!(store.sessions_with_key(&key), vec![session.session_id.clone()]);

        store
            .update(&session.session_id, |s| {
                s.phase = Phase::Failed;
                Ok(())
            })
            .unwrap();
        assert!(store.sessions_with_key(&key).is_empty());
    }
}
