//! Wire Protocol
//!
//! Tagged message types exchanged between a participant and the DKG
//! coordinator over one persistent duplex connection. All byte fields are
//! hex encoded; payload internals are opaque to the coordinator.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Wire codec error types
#[derive(Debug, Error)]
pub enum WireError {
    #[error("Malformed message: {0}")]
    Malformed(String),
}

pub type Result<T> = std::result::Result<T, WireError>;

/// Roster identifier carried on the wire (1..=max_signers)
pub type Identifier = u16;

/// Messages sent by a participant
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Ask for a fresh login challenge; replaces any unconsumed one
    RequestChallenge,
    /// Prove possession of the private key for `pubkey`
    Login {
        challenge: String,
        pubkey: String,
        signature: String,
    },
    /// Announce a new session with a fixed roster
    AnnounceSession {
        min_signers: u16,
        max_signers: u16,
        group_id: String,
        participants: Vec<Identifier>,
        participants_pubs: Vec<(Identifier, String)>,
    },
    /// Submit a Round1 commitment package
    Round1Submit {
        session: String,
        identifier: Identifier,
        commitment: String,
    },
    /// Submit one encrypted Round2 share addressed to `recipient`
    Round2Submit {
        session: String,
        identifier: Identifier,
        recipient: Identifier,
        encrypted_share: String,
    },
    /// Submit the derived group verifying key for agreement
    FinalizeSubmit {
        session: String,
        identifier: Identifier,
        verifying_key: String,
    },
    /// Short-circuit the session to Failed
    AbortSession { session: String },
}

/// Messages sent by the coordinator, both replies and pushes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Fresh single-use challenge, hex of 16 random bytes
    Challenge { challenge: String },
    /// Login succeeded; `user_id` is the roster identifier
    LoginOk { user_id: Identifier, access_token: String },
    /// Session allocated in the Joining phase
    SessionCreated { session: String },
    /// Submission recorded for the named phase
    Ack { session: String, phase: String },
    /// Pushed when every roster member has authenticated
    Round1Started { session: String },
    /// Pushed on Round1 exit: the full commitment set
    Round1Complete {
        session: String,
        commitments: Vec<(Identifier, String)>,
    },
    /// Pushed per recipient on Round2 exit: incoming encrypted shares
    Round2Complete {
        session: String,
        shares: Vec<(Identifier, String)>,
    },
    /// Pushed on Finalizing agreement
    SessionCompleted { session: String, verifying_key: String },
    /// Pushed on timeout, finalize disagreement, or explicit abort
    SessionFailed {
        session: String,
        message: String,
        unresponsive: Vec<Identifier>,
    },
    /// Synchronous failure reply; leaves session state unchanged
    Error { message: String },
}

impl ServerMessage {
    /// Build an error reply from anything displayable
    pub fn error(err: impl std::fmt::Display) -> Self {
        ServerMessage::Error {
            message: err.to_string(),
        }
    }
}

/// Decode one client frame
pub fn decode_client(text: &str) -> Result<ClientMessage> {
    serde_json::from_str(text).map_err(|e| WireError::Malformed(e.to_string()))
}

/// Decode one server frame
pub fn decode_server(text: &str) -> Result<ServerMessage> {
    serde_json::from_str(text).map_err(|e| WireError::Malformed(e.to_string()))
}

/// Encode a frame; infallible for these types in practice
pub fn encode<T: Serialize>(msg: &T) -> String {
    serde_json::to_string(msg).unwrap_or_else(|e| {
        format!(r#"{{"type":"error","message":"encode failure: {}"}}"#, e)
    })
}
