//! Key material and single-signer Schnorr signatures over Ristretto.
//!
//! Every protocol message is signed by its sender so that validators and the
//! leader can attribute commitments and responses to committee members. The
//! collective signature itself lives in [`crate::cosi`].

use std::fmt;

use curve25519_dalek::ristretto::{CompressedRistretto, RistrettoPoint};
use curve25519_dalek::scalar::Scalar;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};

use crate::errors::{ConsensusError, ConsensusResult};
use crate::types::NodeId;

const MESSAGE_DOMAIN: &[u8] = b"cosi-consensus/message";
const DEV_KEY_DOMAIN: &[u8] = b"cosi-consensus/dev-key";

/// Committee member public key (compressed Ristretto point)
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey {
    point: RistrettoPoint,
    bytes: [u8; 32],
}

impl PublicKey {
    pub fn from_point(point: RistrettoPoint) -> Self {
        Self {
            point,
            bytes: point.compress().to_bytes(),
        }
    }

    pub fn from_bytes(bytes: &[u8; 32]) -> ConsensusResult<Self> {
        let point = decode_point(bytes)?;
        Ok(Self {
            point,
            bytes: *bytes,
        })
    }

    pub fn from_hex(encoded: &str) -> ConsensusResult<Self> {
        let raw = hex::decode(encoded.trim_start_matches("0x"))
            .map_err(|e| ConsensusError::InvalidPoint(e.to_string()))?;
        let bytes: [u8; 32] = raw
            .as_slice()
            .try_into()
            .map_err(|_| {
                ConsensusError::InvalidPoint(format!("expected 32 bytes, got {}", raw.len()))
            })?;
        Self::from_bytes(&bytes)
    }

    pub fn point(&self) -> &RistrettoPoint {
        &self.point
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.bytes
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.bytes)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.to_hex())
    }
}

/// Long-term signing key of this node
#[derive(Clone)]
pub struct KeyPair {
    secret: Scalar,
    public: PublicKey,
}

impl KeyPair {
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self::from_scalar(random_scalar(rng))
    }

    pub fn random() -> Self {
        Self::generate(&mut rand::thread_rng())
    }

    /// Create from canonical scalar bytes
    pub fn from_secret_bytes(bytes: &[u8; 32]) -> ConsensusResult<Self> {
        Ok(Self::from_scalar(decode_scalar(bytes)?))
    }

    /// Deterministic key for local committees and tests. Anyone who knows the
    /// node id can derive the secret, so these keys must never back a real
    /// deployment.
    pub fn from_node_id(node_id: NodeId) -> Self {
        Self::from_scalar(hash_to_scalar(DEV_KEY_DOMAIN, &[&node_id.to_le_bytes()]))
    }

    fn from_scalar(secret: Scalar) -> Self {
        Self {
            secret,
            public: PublicKey::from_point(RistrettoPoint::mul_base(&secret)),
        }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub(crate) fn secret(&self) -> &Scalar {
        &self.secret
    }

    /// Sign an encoded protocol message
    pub fn sign(&self, message: &[u8]) -> MessageSignature {
        let nonce = random_scalar(&mut rand::thread_rng());
        let r = RistrettoPoint::mul_base(&nonce).compress().to_bytes();
        let e = message_challenge(&r, &self.public, message);
        let s = nonce + e * self.secret;

        MessageSignature { r, s: s.to_bytes() }
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair").field("public", &self.public).finish_non_exhaustive()
    }
}

/// Single-signer Schnorr signature (R || s)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageSignature {
    pub r: [u8; 32],
    pub s: [u8; 32],
}

impl MessageSignature {
    pub fn verify(&self, public_key: &PublicKey, message: &[u8]) -> bool {
        let r_point = match CompressedRistretto(self.r).decompress() {
            Some(point) => point,
            None => return false,
        };
        let s = match Option::<Scalar>::from(Scalar::from_canonical_bytes(self.s)) {
            Some(s) => s,
            None => return false,
        };

        let e = message_challenge(&self.r, public_key, message);
        RistrettoPoint::mul_base(&s) == r_point + e * public_key.point()
    }
}

fn message_challenge(r: &[u8; 32], public_key: &PublicKey, message: &[u8]) -> Scalar {
    hash_to_scalar(MESSAGE_DOMAIN, &[r, &public_key.to_bytes(), message])
}

/// Uniform scalar from 64 random bytes
pub fn random_scalar<R: RngCore + CryptoRng>(rng: &mut R) -> Scalar {
    let mut wide = [0u8; 64];
    rng.fill_bytes(&mut wide);
    Scalar::from_bytes_mod_order_wide(&wide)
}

/// SHA-512 over `parts`, reduced modulo the group order
pub(crate) fn hash_to_scalar(domain: &[u8], parts: &[&[u8]]) -> Scalar {
    let mut hasher = Sha512::new();
    hasher.update(domain);
    for part in parts {
        hasher.update(part);
    }
    let digest = hasher.finalize();

    let mut wide = [0u8; 64];
    wide.copy_from_slice(&digest);
    Scalar::from_bytes_mod_order_wide(&wide)
}

pub fn decode_point(bytes: &[u8; 32]) -> ConsensusResult<RistrettoPoint> {
    CompressedRistretto(*bytes)
        .decompress()
        .ok_or_else(|| ConsensusError::InvalidPoint(hex::encode(bytes)))
}

pub fn decode_scalar(bytes: &[u8; 32]) -> ConsensusResult<Scalar> {
    Option::<Scalar>::from(Scalar::from_canonical_bytes(*bytes))
        .ok_or_else(|| ConsensusError::InvalidScalar(hex::encode(bytes)))
}
