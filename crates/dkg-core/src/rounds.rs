//! Round state machine
//!
//! Pure transitions over a mutable [`Session`]: Joining -> Round1 ->
//! Round2 -> Finalizing -> Completed/Failed. Submissions are collected as
//! sets (order across participants is irrelevant) and a phase advances
//! atomically once its exit condition holds. Failed submissions leave the
//! session untouched; the only failure that mutates state is finalize
//! disagreement, which is session-fatal by design of the protocol.
//!
//! Policy decisions fixed here: a duplicate artifact for a phase is
//! rejected (the first submission stands), and the artifact map for a
//! completing phase is drained into the advance result so no stale payload
//! survives the transition.

use crate::error::{Error, Result};
use crate::types::{Identifier, Phase, Session};
use std::collections::BTreeMap;
use tracing::debug;

/// Outcome of a successfully applied submission
#[derive(Debug)]
pub enum Advance {
    /// Submission recorded; exit condition not yet met
    None,
    /// Joining complete: every roster identifier authenticated
    Round1Started,
    /// Round1 complete: the full commitment set, roster order
    Round1Complete(Vec<(Identifier, Vec<u8>)>),
    /// Round2 complete: incoming encrypted shares per recipient
    Round2Complete(BTreeMap<Identifier, Vec<(Identifier, Vec<u8>)>>),
    /// Finalizing agreement reached on this verifying key
    Completed(Vec<u8>),
}

fn ensure_phase(session: &Session, expected: Phase) -> Result<()> {
    if session.phase != expected {
        return Err(Error::PhaseMismatch {
            current: session.phase.to_string(),
            submitted: expected.to_string(),
        });
    }
    Ok(())
}

fn ensure_authorized(session: &Session, identifier: Identifier) -> Result<()> {
    if session.participant(identifier).is_none() || !session.authenticated.contains(&identifier) {
        return Err(Error::NotAuthorized);
    }
    Ok(())
}

/// Record a completed login for `identifier`; advances to Round1 once the
/// whole roster has authenticated.
pub fn mark_authenticated(session: &mut Session, identifier: Identifier) -> Result<Advance> {
    ensure_phase(session, Phase::Joining)?;
    if session.participant(identifier).is_none() {
        return Err(Error::NotAuthorized);
    }

    session.authenticated.insert(identifier);
    if session.authenticated.len() == session.roster.len() {
        session.phase = Phase::Round1;
        debug!(session_id = %session.session_id, "All participants authenticated");
        return Ok(Advance::Round1Started);
    }
    Ok(Advance::None)
}

/// Accept one Round1 commitment per identifier
pub fn submit_round1(
    session: &mut Session,
    identifier: Identifier,
    commitment: Vec<u8>,
) -> Result<Advance> {
    ensure_phase(session, Phase::Round1)?;
    ensure_authorized(session, identifier)?;

    if session.round1.contains_key(&identifier) {
        return Err(Error::DuplicatePhaseSubmission {
            identifier,
            phase: session.phase.to_string(),
        });
    }
    session.round1.insert(identifier, commitment);

    if session.round1.len() < session.roster.len() {
        return Ok(Advance::None);
    }

    // Exit condition met: drain artifacts in roster order and advance
    let mut collected = std::mem::take(&mut session.round1);
    let commitments = session
        .roster
        .iter()
        .filter_map(|p| collected.remove(&p.identifier).map(|c| (p.identifier, c)))
        .collect();
    session.phase = Phase::Round2;
    Ok(Advance::Round1Complete(commitments))
}

/// Accept one Round2 encrypted share per (sender, recipient) pair
pub fn submit_round2(
    session: &mut Session,
    from: Identifier,
    to: Identifier,
    encrypted_share: Vec<u8>,
) -> Result<Advance> {
    ensure_phase(session, Phase::Round2)?;
    ensure_authorized(session, from)?;
    if from == to || session.participant(to).is_none() {
        return Err(Error::NotAuthorized);
    }

    if session.round2.contains_key(&(from, to)) {
        return Err(Error::DuplicatePhaseSubmission {
            identifier: from,
            phase: session.phase.to_string(),
        });
    }
    session.round2.insert((from, to), encrypted_share);

    let n = session.roster.len();
    if session.round2.len() < n * (n - 1) {
        return Ok(Advance::None);
    }

    let collected = std::mem::take(&mut session.round2);
    let mut deliveries: BTreeMap<Identifier, Vec<(Identifier, Vec<u8>)>> = session
        .roster
        .iter()
        .map(|p| (p.identifier, Vec::new()))
        .collect();
    for ((sender, recipient), share) in collected {
        if let Some(inbox) = deliveries.get_mut(&recipient) {
            inbox.push((sender, share));
        }
    }
    session.phase = Phase::Finalizing;
    Ok(Advance::Round2Complete(deliveries))
}

/// Accept one finalize confirmation per identifier. Once all confirmations
/// are in they must agree on a single group verifying key; any split fails
/// the whole session.
pub fn submit_finalize(
    session: &mut Session,
    identifier: Identifier,
    verifying_key: Vec<u8>,
) -> Result<Advance> {
    ensure_phase(session, Phase::Finalizing)?;
    ensure_authorized(session, identifier)?;

    if session.finalize.contains_key(&identifier) {
        return Err(Error::DuplicatePhaseSubmission {
            identifier,
            phase: session.phase.to_string(),
        });
    }
    session.finalize.insert(identifier, verifying_key);

    if session.finalize.len() < session.roster.len() {
        return Ok(Advance::None);
    }

    let collected = std::mem::take(&mut session.finalize);
    let mut keys = collected.values();
    let agreed = keys.next().cloned().unwrap_or_default();
    if keys.any(|key| *key != agreed) {
        session.phase = Phase::Failed;
        return Err(Error::FinalizeDisagreement);
    }

    session.group_verifying_key = Some(agreed.clone());
    session.phase = Phase::Completed;
    Ok(Advance::Completed(agreed))
}

/// Leader-initiated short circuit to Failed; no-op on terminal sessions
pub fn abort(session: &mut Session) -> bool {
    if session.phase.is_terminal() {
        return false;
    }
    session.phase = Phase::Failed;
    true
}

/// Apply an elapsed deadline. Returns the identifiers still missing for
/// `phase` when the session is failed; `None` when the deadline is stale
/// (the session already moved on or terminated), which is a silent no-op.
pub fn fail_on_deadline(session: &mut Session, phase: Phase) -> Option<Vec<Identifier>> {
    if session.phase != phase || session.phase.is_terminal() {
        return None;
    }
    let missing = session.missing_for_phase(phase);
    session.phase = Phase::Failed;
    Some(missing)
}
