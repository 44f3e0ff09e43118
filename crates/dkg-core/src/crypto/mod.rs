//! Cryptographic primitive boundary
//!
//! Pure fallible functions over byte buffers: the challenge digest and
//! signature helpers used by the login handshake, and the ECIES scheme
//! (secp256k1 ECDH + HMAC-SHA256 KDF + ChaCha20-Poly1305) participants use
//! to encrypt Round2 shares to each other's roster keys. The coordinator
//! never inspects share plaintext; decryption happens party-side only.

use crate::error::{Error, Result};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hmac::{Hmac, Mac};
use k256::ecdh::EphemeralSecret;
use k256::ecdsa::signature::hazmat::PrehashSigner;
use k256::ecdsa::{Signature, SigningKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::PublicKey;
use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256};

pub mod vss;

/// Domain-separation context for the share-encryption KDF
const ECIES_CONTEXT: &[u8] = b"dkg-share-ecies-v1";

/// ChaCha20-Poly1305 nonce length
const NONCE_LEN: usize = 12;

/// Compressed ephemeral point length in an ECIES envelope
const EPHEMERAL_LEN: usize = 33;

/// Fixed digest over the raw challenge bytes; identical on both ends
pub fn challenge_digest(challenge: &[u8]) -> [u8; 32] {
    Sha256::digest(challenge).into()
}

/// Sign a challenge, normalizing to canonical low-S form before sending
pub fn sign_challenge(key: &SigningKey, challenge: &[u8]) -> Result<Signature> {
    let digest = challenge_digest(challenge);
    let sig: Signature = key
        .sign_prehash(&digest)
        .map_err(|e| Error::Crypto(e.to_string()))?;
    Ok(sig.normalize_s().unwrap_or(sig))
}

/// Derive the symmetric key for one ECIES envelope
fn derive_key(shared_secret: &[u8]) -> Result<[u8; 32]> {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(ECIES_CONTEXT)
        .map_err(|e| Error::Crypto(e.to_string()))?;
    mac.update(shared_secret);
    Ok(mac.finalize().into_bytes().into())
}

/// Encrypt a share to a recipient's compressed SEC1 public key.
///
/// Envelope layout: `ephemeral_point(33) || nonce(12) || ciphertext`.
pub fn encrypt_share(recipient_pubkey: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let recipient = PublicKey::from_sec1_bytes(recipient_pubkey)
        .map_err(|_| Error::Crypto("invalid recipient public key".into()))?;

    let ephemeral = EphemeralSecret::random(&mut OsRng);
    let ephemeral_point = ephemeral.public_key().to_encoded_point(true);
    let shared = ephemeral.diffie_hellman(&recipient);
    let key = derive_key(shared.raw_secret_bytes())?;

    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| Error::Crypto("share encryption failed".into()))?;

    let mut envelope = Vec::with_capacity(EPHEMERAL_LEN + NONCE_LEN + ciphertext.len());
    envelope.extend_from_slice(ephemeral_point.as_bytes());
    envelope.extend_from_slice(&nonce);
    envelope.extend_from_slice(&ciphertext);
    Ok(envelope)
}

/// Decrypt an ECIES envelope with the recipient's signing key
pub fn decrypt_share(recipient_key: &SigningKey, envelope: &[u8]) -> Result<Vec<u8>> {
    if envelope.len() < EPHEMERAL_LEN + NONCE_LEN {
        return Err(Error::Crypto("truncated share envelope".into()));
    }
    let (point_bytes, rest) = envelope.split_at(EPHEMERAL_LEN);
    let (nonce, ciphertext) = rest.split_at(NONCE_LEN);

    let ephemeral = PublicKey::from_sec1_bytes(point_bytes)
        .map_err(|_| Error::Crypto("invalid ephemeral point".into()))?;

    let shared = k256::ecdh::diffie_hellman(
        recipient_key.as_nonzero_scalar(),
        ephemeral.as_affine(),
    );
    let key = derive_key(shared.raw_secret_bytes())?;

    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| Error::Crypto("share decryption failed".into()))
}
