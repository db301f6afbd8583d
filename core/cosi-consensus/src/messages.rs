//! Protocol messages and their wire encoding.
//!
//! Every message is wrapped in a [`SignedMessage`]: the body is encoded with
//! bincode and signed by the sender's long-term key, and receivers check the
//! signature against the directory before looking at the payload.

use bincode::Options;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::cosi::CosiSignature;
use crate::crypto::{KeyPair, MessageSignature, PublicKey};
use crate::errors::ConsensusResult;
use crate::round::ChallengeData;
use crate::types::{BlockHash, ConsensusId, NodeId, ShardId};

/// Upper bound on a decoded message, block header included
pub const MAX_MESSAGE_BYTES: u64 = 4 * 1024 * 1024;

fn codec() -> impl Options {
    bincode::DefaultOptions::new().with_limit(MAX_MESSAGE_BYTES)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    Announce,
    Commit,
    Challenge,
    Response,
    CollectiveSig,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Announce => "announce",
            Phase::Commit => "commit",
            Phase::Challenge => "challenge",
            Phase::Response => "response",
            Phase::CollectiveSig => "collective_sig",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    /// Leader → validators: the block to sign
    Announce {
        block_hash: BlockHash,
        block_header: Vec<u8>,
    },
    /// Validator → leader: `V_i`
    Commit { commitment: [u8; 32] },
    /// Leader → validators: aggregated commitment, commit set and challenge
    Challenge {
        aggregated_commitment: [u8; 32],
        bitmap: Vec<u8>,
        challenge: [u8; 32],
    },
    /// Validator → leader: `r_i`
    Response { response: [u8; 32] },
    /// Leader → validators: the finished round
    CollectiveSig {
        block_header: Vec<u8>,
        signature: CosiSignature,
    },
}

impl Payload {
    pub fn phase(&self) -> Phase {
        match self {
            Payload::Announce { .. } => Phase::Announce,
            Payload::Commit { .. } => Phase::Commit,
            Payload::Challenge { .. } => Phase::Challenge,
            Payload::Response { .. } => Phase::Response,
            Payload::CollectiveSig { .. } => Phase::CollectiveSig,
        }
    }
}

impl From<ChallengeData> for Payload {
    fn from(data: ChallengeData) -> Self {
        Payload::Challenge {
            aggregated_commitment: data.aggregated_commitment,
            bitmap: data.bitmap,
            challenge: data.challenge,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusMessage {
    pub consensus_id: ConsensusId,
    pub shard_id: ShardId,
    pub sender: NodeId,
    pub payload: Payload,
}

impl ConsensusMessage {
    pub fn phase(&self) -> Phase {
        self.payload.phase()
    }

    pub fn sign(self, key: &KeyPair) -> ConsensusResult<SignedMessage> {
        let body = codec().serialize(&self)?;
        let signature = key.sign(&body);
        Ok(SignedMessage {
            message: self,
            signature,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedMessage {
    pub message: ConsensusMessage,
    pub signature: MessageSignature,
}

impl SignedMessage {
    pub fn encode(&self) -> ConsensusResult<Bytes> {
        Ok(Bytes::from(codec().serialize(self)?))
    }

    pub fn decode(bytes: &[u8]) -> ConsensusResult<Self> {
        Ok(codec().deserialize(bytes)?)
    }

    /// Check the sender's signature over the encoded body
    pub fn verify(&self, public_key: &PublicKey) -> ConsensusResult<bool> {
        let body = codec().serialize(&self.message)?;
        Ok(self.signature.verify(public_key, &body))
    }
}
