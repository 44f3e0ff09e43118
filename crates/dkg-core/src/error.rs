//! Error types for the DKG coordination protocol

use thiserror::Error;

/// Result type alias for coordinator operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while driving a DKG session
#[derive(Debug, Error)]
pub enum Error {
    /// Login presented a challenge that is not live for the connection
    #[error("Unknown or already consumed challenge")]
    UnknownChallenge,

    /// Signature did not verify, or was not in canonical low-S form
    #[error("Invalid signature")]
    InvalidSignature,

    /// Public key is not present in any known roster
    #[error("Unknown public key")]
    UnknownPublicKey,

    /// Connection is already bound to an identity
    #[error("Connection already authenticated")]
    AlreadyAuthenticated,

    /// Submission from an unauthenticated or foreign identifier
    #[error("Not authorized for this session")]
    NotAuthorized,

    /// Session lookup failed
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Roster failed announcement validation
    #[error("Invalid roster: {0}")]
    InvalidRoster(String),

    /// Identifier already submitted an artifact for this phase
    #[error("Duplicate submission from identifier {identifier} in phase {phase}")]
    DuplicatePhaseSubmission { identifier: u16, phase: String },

    /// Submission for a phase the session is not currently in
    #[error("Phase mismatch: session is in {current}, submission targets {submitted}")]
    PhaseMismatch { current: String, submitted: String },

    /// Participants reported different group verifying keys
    #[error("Finalize disagreement: participants derived different group keys")]
    FinalizeDisagreement,

    /// A phase deadline elapsed before its exit condition was met
    #[error("Phase {phase} timed out waiting for identifiers {missing:?}")]
    Timeout { phase: String, missing: Vec<u16> },

    /// Cryptographic operation failed
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<hex::FromHexError> for Error {
    fn from(e: hex::FromHexError) -> Self {
        Error::Serialization(format!("invalid hex: {}", e))
    }
}
