//! # DKG Core
//!
//! Protocol state for a threshold key-generation coordinator: participants
//! authenticate by proof-of-possession over a relay connection, a round
//! state machine drives each session through commitment, share-exchange
//! and finalization, and a timeout supervisor bounds every phase so a
//! stalled participant fails the session deterministically.
//!
//! ## Overview
//!
//! - [`auth`] — single-use challenge issuance and login verification
//! - [`registry`] — session store: roster validation, lookup, mutation
//! - [`rounds`] — the Joining/Round1/Round2/Finalizing state machine
//! - [`timeout`] — one cancellable deadline per live session phase
//! - [`coordinator`] — the event loop serializing all of the above
//! - [`crypto`] — primitive boundary: digests, ECIES, VSS round math

pub mod auth;
pub mod coordinator;
pub mod crypto;
pub mod error;
pub mod registry;
pub mod rounds;
pub mod timeout;
pub mod types;

pub use error::{Error, Result};
pub use registry::SessionStore;
pub use types::{
    Challenge, Identifier, Participant, Phase, PhaseTimeouts, Session, SessionId,
};

/// Protocol version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
