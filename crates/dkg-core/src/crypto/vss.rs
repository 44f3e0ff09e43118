//! Feldman-style verifiable secret sharing for the DKG rounds
//!
//! Each participant samples a secret polynomial of degree `min_signers - 1`,
//! publishes commitments to its coefficients (Round1), sends evaluations to
//! every other identifier (Round2), and derives the group verifying key as
//! the sum of all constant-term commitments (Finalizing). The polynomial is
//! evaluated at the participant's roster identifier, so identifiers must be
//! nonzero.

use crate::error::{Error, Result};
use crate::types::Identifier;
use k256::elliptic_curve::bigint::U256;
use k256::elliptic_curve::ops::Reduce;
use k256::elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint};
use k256::elliptic_curve::Field;
use k256::{AffinePoint, ProjectivePoint, Scalar};
use rand_core::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};

/// Secret polynomial held by one participant for the session's duration
pub struct SecretPolynomial {
    coefficients: Vec<Scalar>,
}

/// Public commitments to one participant's polynomial, hex compressed points
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitmentPackage {
    pub commitments: Vec<String>,
}

impl CommitmentPackage {
    /// Serialize for submission as an opaque round artifact
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Parse a received round artifact
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::Serialization(e.to_string()))
    }
}

/// Sample a secret polynomial and commit to its coefficients
pub fn generate(
    min_signers: u16,
    rng: &mut (impl CryptoRng + RngCore),
) -> Result<(SecretPolynomial, CommitmentPackage)> {
    if min_signers < 2 {
        return Err(Error::Crypto("threshold must be at least 2".into()));
    }

    let mut coefficients = Vec::with_capacity(min_signers as usize);
    let mut commitments = Vec::with_capacity(min_signers as usize);

    for _ in 0..min_signers {
        let coefficient = Scalar::random(&mut *rng);
        let commitment = (ProjectivePoint::GENERATOR * coefficient).to_affine();

        coefficients.push(coefficient);
        commitments.push(hex::encode(commitment.to_encoded_point(true).as_bytes()));
    }

    Ok((
        SecretPolynomial { coefficients },
        CommitmentPackage { commitments },
    ))
}

impl SecretPolynomial {
    /// Evaluate at a roster identifier (nonzero by construction)
    pub fn share_for(&self, identifier: Identifier) -> Scalar {
        evaluate(&self.coefficients, identifier)
    }

    /// Evaluation serialized for the wire
    pub fn share_bytes_for(&self, identifier: Identifier) -> [u8; 32] {
        self.share_for(identifier).to_bytes().into()
    }
}

fn evaluate(coefficients: &[Scalar], identifier: Identifier) -> Scalar {
    let x = Scalar::from(identifier as u64);
    let mut result = Scalar::ZERO;
    let mut x_power = Scalar::ONE;

    for coefficient in coefficients {
        result += *coefficient * x_power;
        x_power *= x;
    }

    result
}

/// Parse a 32-byte scalar, reducing modulo the group order
pub fn scalar_from_bytes(bytes: &[u8]) -> Result<Scalar> {
    let array: [u8; 32] = bytes
        .try_into()
        .map_err(|_| Error::Serialization("invalid share length".into()))?;
    Ok(<Scalar as Reduce<U256>>::reduce_bytes(&array.into()))
}

fn point_from_hex(encoded: &str) -> Result<ProjectivePoint> {
    let bytes = hex::decode(encoded)?;
    let point = k256::EncodedPoint::from_bytes(&bytes)
        .map_err(|e| Error::Crypto(e.to_string()))?;
    let affine: AffinePoint = Option::<AffinePoint>::from(AffinePoint::from_encoded_point(&point))
        .ok_or_else(|| Error::Crypto("invalid commitment point".into()))?;
    Ok(ProjectivePoint::from(affine))
}

/// Check a received share against the sender's published commitments
pub fn verify_share(
    share: &Scalar,
    sender_commitments: &CommitmentPackage,
    recipient: Identifier,
) -> Result<()> {
    let expected = ProjectivePoint::GENERATOR * share;

    let x = Scalar::from(recipient as u64);
    let mut actual = ProjectivePoint::IDENTITY;
    let mut x_power = Scalar::ONE;

    for encoded in &sender_commitments.commitments {
        let commitment = point_from_hex(encoded)?;
        actual += commitment * x_power;
        x_power *= x;
    }

    if expected != actual {
        return Err(Error::Crypto(
            "share does not match sender commitments".into(),
        ));
    }

    Ok(())
}

/// Derive the group verifying key from every participant's commitments
pub fn group_verifying_key(packages: &[CommitmentPackage]) -> Result<Vec<u8>> {
    let mut key = ProjectivePoint::IDENTITY;

    for package in packages {
        let constant = package
            .commitments
            .first()
            .ok_or_else(|| Error::Crypto("empty commitment package".into()))?;
        key += point_from_hex(constant)?;
    }

    if key == ProjectivePoint::IDENTITY {
        return Err(Error::Crypto("degenerate group key".into()));
    }

    Ok(key.to_affine().to_encoded_point(true).as_bytes().to_vec())
}

/// Combine the participant's own evaluation with every received share
pub fn aggregate_secret_share(own: Scalar, received: &[Scalar]) -> Scalar {
    received.iter().fold(own, |acc, share| acc + share)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_chacha::rand_core::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    #[test]
    fn test_three_party_dkg_math() {
        let mut rng = ChaCha20Rng::seed_from_u64(7);
        let identifiers: Vec<Identifier> = vec![1, 2, 3];

        let contributions: Vec<_> = identifiers
            .iter()
            .map(|_| generate(2, &mut rng).unwrap())
            .collect();

        // Every pairwise share must verify against the sender's commitments
        for (poly, commitments) in &contributions {
            for id in &identifiers {
                let share = poly.share_for(*id);
                verify_share(&share, commitments, *id).unwrap();
            }
        }

        let packages: Vec<_> = contributions.iter().map(|(_, c)| c.clone()).collect();
        let group_key = group_verifying_key(&packages).unwrap();
        assert_eq!(group_key.len(), 33);

        // The group key is G times the sum of all constant terms
        let joint_secret = contributions
            .iter()
            .fold(Scalar::ZERO, |acc, (poly, _)| acc + poly.coefficients[0]);
        let expected = (ProjectivePoint::GENERATOR * joint_secret)
            .to_affine()
            .to_encoded_point(true);
        assert_eq!(group_key, expected.as_bytes());
    }

    #[test]
    fn test_tampered_share_fails_verification() {
        let mut rng = ChaCha20Rng::seed_from_u64(11);
        let (poly, commitments) = generate(2, &mut rng).unwrap();

        let mut share = poly.share_for(2);
        share += Scalar::ONE;
        assert!(verify_share(&share, &commitments, 2).is_err());
    }

    #[test]
    fn test_share_bytes_roundtrip() {
        let mut rng = ChaCha20Rng::seed_from_u64(13);
        let (poly, _) = generate(3, &mut rng).unwrap();

        let bytes = poly.share_bytes_for(1);
        let parsed = scalar_from_bytes(&bytes).unwrap();
        assert_eq!(parsed, poly.share_for(1));
    }

    #[test]
    fn test_threshold_lower_bound() {
        let mut rng = ChaCha20Rng::seed_from_u64(17);
        assert!(generate(1, &mut rng).is_err());
    }
}
