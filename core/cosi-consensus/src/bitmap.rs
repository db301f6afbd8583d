//! Participation bitmap for collective signatures.
//!
//! One bit per committee member, in the order of
//! [`Directory::public_keys`](crate::directory::Directory::public_keys). The
//! aggregate public key of the marked members is maintained incrementally so
//! the leader never re-sums the whole committee.

use std::sync::Arc;

use curve25519_dalek::ristretto::RistrettoPoint;
use curve25519_dalek::traits::Identity;

use crate::crypto::PublicKey;
use crate::errors::{ConsensusError, ConsensusResult};

#[derive(Debug, Clone)]
pub struct Bitmap {
    public_keys: Arc<[PublicKey]>,
    bits: Vec<u8>,
    aggregate: RistrettoPoint,
    count: usize,
}

impl Bitmap {
    pub fn new(public_keys: Arc<[PublicKey]>) -> Self {
        let bits = vec![0u8; byte_len(public_keys.len())];
        Self {
            public_keys,
            bits,
            aggregate: RistrettoPoint::identity(),
            count: 0,
        }
    }

    /// Rebuild a bitmap received from the network
    pub fn from_bytes(public_keys: Arc<[PublicKey]>, bytes: &[u8]) -> ConsensusResult<Self> {
        let expected = byte_len(public_keys.len());
        if bytes.len() != expected {
            return Err(ConsensusError::InvalidBitmap(format!(
                "expected {} bytes, got {}",
                expected,
                bytes.len()
            )));
        }

        let mut bitmap = Self::new(public_keys);
        for (index, byte) in bytes.iter().enumerate() {
            for bit in 0..8 {
                if byte & (1 << bit) == 0 {
                    continue;
                }
                let position = index * 8 + bit;
                if position >= bitmap.len() {
                    return Err(ConsensusError::InvalidBitmap(format!(
                        "bit {} set beyond committee size {}",
                        position,
                        bitmap.len()
                    )));
                }
                bitmap.set_participating(position)?;
            }
        }
        Ok(bitmap)
    }

    /// Mark a member as present. Returns false if it already was.
    pub fn set_participating(&mut self, position: usize) -> ConsensusResult<bool> {
        let key = self.public_keys.get(position).ok_or_else(|| {
            ConsensusError::InvalidBitmap(format!("position {} out of range", position))
        })?;

        if self.is_participating(position) {
            return Ok(false);
        }

        self.bits[position / 8] |= 1 << (position % 8);
        self.aggregate += key.point();
        self.count += 1;
        Ok(true)
    }

    pub fn is_participating(&self, position: usize) -> bool {
        position < self.len() && self.bits[position / 8] & (1 << (position % 8)) != 0
    }

    /// Positions of all marked members
    pub fn participants(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len()).filter(move |&position| self.is_participating(position))
    }

    pub fn count_enabled(&self) -> usize {
        self.count
    }

    /// Committee size
    pub fn len(&self) -> usize {
        self.public_keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.public_keys.is_empty()
    }

    /// Sum of the public keys of every marked member
    pub fn aggregate_public_key(&self) -> RistrettoPoint {
        self.aggregate
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.bits.clone()
    }

    pub fn clear(&mut self) {
        self.bits.iter_mut().for_each(|b| *b = 0);
        self.aggregate = RistrettoPoint::identity();
        self.count = 0;
    }
}

fn byte_len(members: usize) -> usize {
    (members + 7) / 8
}
