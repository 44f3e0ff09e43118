//! Challenge/response authentication handshake
//!
//! A connection proves possession of the private key behind a roster public
//! key by signing the SHA-256 digest of a single-use 128-bit challenge.
//! The challenge is consumed on the first login attempt, success or not,
//! so a replayed value always fails with [`Error::UnknownChallenge`].

use crate::crypto;
use crate::error::{Error, Result};
use crate::types::{Challenge, CHALLENGE_LEN};
use chrono::Utc;
use k256::ecdsa::signature::hazmat::PrehashVerifier;
use k256::ecdsa::{Signature, VerifyingKey};
use rand_core::{OsRng, RngCore};

/// Issue a fresh single-use challenge
pub fn issue_challenge() -> Challenge {
    let mut value = [0u8; CHALLENGE_LEN];
    OsRng.fill_bytes(&mut value);
    Challenge {
        value,
        issued_at: Utc::now(),
    }
}

/// Verify a login attempt against the connection's live challenge.
///
/// Signatures are accepted in canonical low-S form only; a high-S signature
/// is rejected rather than normalized. The caller is responsible for having
/// consumed the challenge before invoking this.
pub fn verify_login(
    live: &Challenge,
    presented: &[u8],
    pubkey: &[u8],
    signature: &[u8],
) -> Result<()> {
    if presented != live.value {
        return Err(Error::UnknownChallenge);
    }

    let key = VerifyingKey::from_sec1_bytes(pubkey).map_err(|_| Error::UnknownPublicKey)?;
    let sig = Signature::from_slice(signature).map_err(|_| Error::InvalidSignature)?;

    // normalize_s() returns Some only when the input was high-S
    if sig.normalize_s().is_some() {
        return Err(Error::InvalidSignature);
    }

    let digest = crypto::challenge_digest(&live.value);
    key.verify_prehash(&digest, &sig)
        .map_err(|_| Error::InvalidSignature)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k256::ecdsa::SigningKey;

    fn keypair() -> (SigningKey, Vec<u8>) {
        let sk = SigningKey::random(&mut OsRng);
        let pk = sk.verifying_key().to_sec1_bytes().to_vec();
        (sk, pk)
    }

    #[test]
    fn test_valid_login() {
        let (sk, pk) = keypair();
        let challenge = issue_challenge();
        let sig = crypto::sign_challenge(&sk, &challenge.value).unwrap();

        verify_login(&challenge, &challenge.value, &pk, &sig.to_bytes()).unwrap();
    }

    #[test]
    fn test_wrong_challenge_value() {
        let (sk, pk) = keypair();
        let challenge = issue_challenge();
        let sig = crypto::sign_challenge(&sk, &challenge.value).unwrap();

        let other = issue_challenge();
        let err = verify_login(&challenge, &other.value, &pk, &sig.to_bytes()).unwrap_err();
        assert!(matches!(err, Error::UnknownChallenge));
    }

    #[test]
    fn test_signature_from_other_key() {
        let (sk, _) = keypair();
        let (_, pk2) = keypair();
        let challenge = issue_challenge();
        let sig = crypto::sign_challenge(&sk, &challenge.value).unwrap();

        let err = verify_login(&challenge, &challenge.value, &pk2, &sig.to_bytes()).unwrap_err();
        assert!(matches!(err, Error::InvalidSignature));
    }

    #[test]
    fn test_high_s_rejected() {
        let (sk, pk) = keypair();
        let challenge = issue_challenge();
        let sig = crypto::sign_challenge(&sk, &challenge.value).unwrap();

        // Flip s to the high half of the group order
        let (r, s) = sig.split_scalars();
        let high = Signature::from_scalars(r.to_bytes(), (-*s).to_bytes()).unwrap();
        assert!(high.normalize_s().is_some());

        let err = verify_login(&challenge, &challenge.value, &pk, &high.to_bytes()).unwrap_err();
        assert!(matches!(err, Error::InvalidSignature));
    }

    #[test]
    fn test_garbage_pubkey() {
        let (sk, _) = keypair();
        let challenge = issue_challenge();
        let sig = crypto::sign_challenge(&sk, &challenge.value).unwrap();

        let err =
            verify_login(&challenge, &challenge.value, &[0u8; 33], &sig.to_bytes()).unwrap_err();
        assert!(matches!(err, Error::UnknownPublicKey));
    }
}
