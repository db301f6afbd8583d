//! Collective Schnorr signing (CoSi).
//!
//! Each signer `i` holds a key `x_i` with `X_i = x_i·G` and, per round, a fresh
//! nonce `v_i` with commitment `V_i = v_i·G`. With `V = ΣV_i` over the
//! participating subset the challenge is
//!
//! ```text
//! c = H(V || block_hash)
//! ```
//!
//! and each signer answers `r_i = v_i + c·x_i`. The collective signature
//! `(V, r = Σr_i, bitmap)` verifies iff `r·G == V + c·ΣX_i` over the members
//! marked in the bitmap.

use std::sync::Arc;

use curve25519_dalek::ristretto::RistrettoPoint;
use curve25519_dalek::scalar::Scalar;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};

use crate::bitmap::Bitmap;
use crate::crypto::{decode_point, decode_scalar, random_scalar, PublicKey};
use crate::errors::{ConsensusError, ConsensusResult};
use crate::types::BlockHash;

/// Smallest number of members strictly greater than two thirds of the
/// committee.
pub fn quorum_size(committee_size: usize) -> usize {
    committee_size * 2 / 3 + 1
}

/// Fresh per-round nonce and its commitment point
pub fn commit<R: RngCore + CryptoRng>(rng: &mut R) -> (Scalar, RistrettoPoint) {
    let secret = random_scalar(rng);
    (secret, RistrettoPoint::mul_base(&secret))
}

/// Fiat-Shamir challenge binding the aggregated commitment to the block
pub fn compute_challenge(aggregated_commitment: &RistrettoPoint, block_hash: &BlockHash) -> Scalar {
    let mut hasher = Sha512::new();
    hasher.update(aggregated_commitment.compress().as_bytes());
    hasher.update(block_hash);
    let digest = hasher.finalize();

    let mut wide = [0u8; 64];
    wide.copy_from_slice(&digest);
    Scalar::from_bytes_mod_order_wide(&wide)
}

/// `secret + challenge · private_key (mod ℓ)`
pub fn respond(secret: &Scalar, challenge: &Scalar, private_key: &Scalar) -> Scalar {
    secret + challenge * private_key
}

/// Publicly verifiable aggregate signature over a block hash
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CosiSignature {
    pub block_hash: BlockHash,
    pub aggregated_commitment: [u8; 32],
    pub aggregated_response: [u8; 32],
    /// Which committee members the aggregate covers
    pub bitmap: Vec<u8>,
}

impl CosiSignature {
    pub fn new(
        block_hash: BlockHash,
        aggregated_commitment: &RistrettoPoint,
        aggregated_response: &Scalar,
        bitmap: &Bitmap,
    ) -> Self {
        Self {
            block_hash,
            aggregated_commitment: aggregated_commitment.compress().to_bytes(),
            aggregated_response: aggregated_response.to_bytes(),
            bitmap: bitmap.to_bytes(),
        }
    }

    /// Number of committee members marked in the bitmap
    pub fn participants(&self) -> usize {
        self.bitmap.iter().map(|b| b.count_ones() as usize).sum()
    }

    /// Check the group equation against the committee's ordered public keys.
    pub fn verify(&self, public_keys: &[PublicKey]) -> ConsensusResult<()> {
        let bitmap = Bitmap::from_bytes(Arc::from(public_keys), &self.bitmap)?;
        let commitment = decode_point(&self.aggregated_commitment)?;
        let response = decode_scalar(&self.aggregated_response)?;

        let challenge = compute_challenge(&commitment, &self.block_hash);
        let expected = commitment + challenge * bitmap.aggregate_public_key();

        if RistrettoPoint::mul_base(&response) != expected {
            return Err(ConsensusError::SignatureVerification(format!(
                "group equation does not hold for block {}",
                hex::encode(self.block_hash)
            )));
        }
        Ok(())
    }

    /// [`verify`](Self::verify), additionally requiring a BFT quorum of signers
    pub fn verify_quorum(&self, public_keys: &[PublicKey]) -> ConsensusResult<()> {
        let required = quorum_size(public_keys.len());
        let actual = self.participants();
        if actual < required {
            return Err(ConsensusError::InsufficientParticipation { actual, required });
        }
        self.verify(public_keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;

    struct Signer {
        position: usize,
        key: KeyPair,
        secret: Scalar,
        commitment: RistrettoPoint,
    }

    fn committee(n: u16) -> (Vec<KeyPair>, Arc<[PublicKey]>) {
        let keys: Vec<KeyPair> = (0..n).map(KeyPair::from_node_id).collect();
        let public_keys = keys.iter().map(|k| *k.public_key()).collect::<Vec<_>>().into();
        (keys, public_keys)
    }

    fn sign(
        keys: &[KeyPair],
        public_keys: Arc<[PublicKey]>,
        signers: &[usize],
        block_hash: BlockHash,
    ) -> CosiSignature {
        let mut rng = rand::thread_rng();
        let signers: Vec<Signer> = signers
            .iter()
            .map(|&position| {
                let (secret, commitment) = commit(&mut rng);
                Signer {
                    position,
                    key: keys[position].clone(),
                    secret,
                    commitment,
                }
            })
            .collect();

        let mut bitmap = Bitmap::new(public_keys);
        let mut aggregated_commitment = RistrettoPoint::default();
        for signer in &signers {
            bitmap.set_participating(signer.position).unwrap();
            aggregated_commitment += signer.commitment;
        }

        let challenge = compute_challenge(&aggregated_commitment, &block_hash);
        let aggregated_response: Scalar = signers
            .iter()
            .map(|s| respond(&s.secret, &challenge, s.key.secret()))
            .sum();

        CosiSignature::new(block_hash, &aggregated_commitment, &aggregated_response, &bitmap)
    }

    #[test]
    fn test_quorum_size() {
        assert_eq!(quorum_size(1), 1);
        assert_eq!(quorum_size(3), 3);
        assert_eq!(quorum_size(4), 3);
        assert_eq!(quorum_size(6), 5);
        assert_eq!(quorum_size(7), 5);
        assert_eq!(quorum_size(100), 67);
    }

    #[test]
    fn test_challenge_is_deterministic() {
        let (_, commitment) = commit(&mut rand::thread_rng());
        let a = compute_challenge(&commitment, &[7u8; 32]);
        let b = compute_challenge(&commitment, &[7u8; 32]);
        let c = compute_challenge(&commitment, &[8u8; 32]);

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_three_of_four_verifies() {
        let (keys, public_keys) = committee(4);
        let signature = sign(&keys, public_keys.clone(), &[0, 1, 3], [1u8; 32]);

        assert_eq!(signature.participants(), 3);
        assert!(signature.verify(&public_keys).is_ok());
        assert!(signature.verify_quorum(&public_keys).is_ok());
    }

    #[test]
    fn test_below_quorum_rejected_by_verify_quorum() {
        let (keys, public_keys) = committee(4);
        let signature = sign(&keys, public_keys.clone(), &[0, 2], [1u8; 32]);

        assert!(signature.verify(&public_keys).is_ok());
        assert!(matches!(
            signature.verify_quorum(&public_keys),
            Err(ConsensusError::InsufficientParticipation { actual: 2, required: 3 })
        ));
    }

    #[test]
    fn test_altered_response_fails() {
        let (keys, public_keys) = committee(4);
        let mut signature = sign(&keys, public_keys.clone(), &[0, 1, 2], [9u8; 32]);

        let response = decode_scalar(&signature.aggregated_response).unwrap();
        signature.aggregated_response = (response + Scalar::ONE).to_bytes();
        assert!(signature.verify(&public_keys).is_err());
    }

    #[test]
    fn test_wrong_bitmap_or_hash_fails() {
        let (keys, public_keys) = committee(4);
        let signature = sign(&keys, public_keys.clone(), &[0, 1, 2], [9u8; 32]);

        let mut other_bitmap = signature.clone();
        other_bitmap.bitmap = vec![0b0000_1011];
        assert!(other_bitmap.verify(&public_keys).is_err());

        let mut other_hash = signature;
        other_hash.block_hash = [10u8; 32];
        assert!(other_hash.verify(&public_keys).is_err());
    }
}
