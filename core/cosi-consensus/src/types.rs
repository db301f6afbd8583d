//! Core types for the consensus mechanism

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::cosi::CosiSignature;
use crate::crypto::PublicKey;
use crate::errors::ConsensusResult;

/// Compact committee member id, derived from the network address
pub type NodeId = u16;

/// Round (view) number
pub type ConsensusId = u32;

/// Shard this committee belongs to
pub type ShardId = u32;

/// 32-byte block digest
pub type BlockHash = [u8; 32];

/// Stage of a consensus round. Variants are ordered: a round only ever moves
/// to a later variant until it is reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ConsensusState {
    /// Waiting for a block to run consensus on
    Ready,
    /// Leader has announced the block and folded in its own commitment
    AnnounceDone,
    /// Commit quorum reached (leader) or own commitment sent (validator)
    CommitDone,
    /// Challenge fixed for the round
    ChallengeDone,
    /// Response quorum reached (leader) or own response sent (validator)
    ResponseDone,
    /// Collective signature assembled and verified
    Finished,
}

impl Default for ConsensusState {
    fn default() -> Self {
        ConsensusState::Ready
    }
}

impl fmt::Display for ConsensusState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConsensusState::Ready => "READY",
            ConsensusState::AnnounceDone => "ANNOUNCE_DONE",
            ConsensusState::CommitDone => "COMMIT_DONE",
            ConsensusState::ChallengeDone => "CHALLENGE_DONE",
            ConsensusState::ResponseDone => "RESPONSE_DONE",
            ConsensusState::Finished => "FINISHED",
        };
        f.write_str(name)
    }
}

/// Committee member as seen on the network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub ip: String,
    pub port: u16,
    pub public_key: PublicKey,
}

impl Peer {
    pub fn new(ip: impl Into<String>, port: u16, public_key: PublicKey) -> Self {
        Self {
            ip: ip.into(),
            port,
            public_key,
        }
    }

    /// `ip:port`, the input to node id derivation
    pub fn address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

/// Latest known status of a block that is not the current round's block.
///
/// Kept so a node that is lagging behind can fast-forward once it finishes
/// the round it is stuck in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockConsensusStatus {
    /// Encoded header of the block the round runs on
    pub block_header: Vec<u8>,
    /// Most advanced stage observed for that round
    pub state: ConsensusState,
    /// Collective signature, once the round is known to be finished
    pub signature: Option<CosiSignature>,
}

/// Narrow interface to the block type agreed on. The consensus core only
/// needs the digest and a byte encoding to ship in announcements.
pub trait ConsensusBlock: Clone + Send + Sync + 'static {
    /// Digest the collective signature is produced over
    fn hash(&self) -> BlockHash;

    fn encode_header(&self) -> Vec<u8>;

    fn decode_header(bytes: &[u8]) -> ConsensusResult<Self>;
}
