//! Error types for consensus module

use thiserror::Error;

use crate::types::{ConsensusId, ConsensusState, NodeId};

/// Committee configuration errors. These are raised while building a node and
/// are never produced by a running round.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Two distinct addresses hash to the same node id
    #[error("Duplicate node id {node_id}: {first} and {second}")]
    DuplicateNodeId {
        node_id: NodeId,
        first: String,
        second: String,
    },

    /// The same address is listed twice
    #[error("Duplicate committee member: {0}")]
    DuplicateMember(String),

    /// This node is neither the leader nor one of the validators
    #[error("Node {0} is not a committee member")]
    NotInCommittee(String),

    /// Shard id string is not a number
    #[error("Unparsable shard id: {0}")]
    InvalidShardId(String),

    /// Public key is not a valid compressed Ristretto point
    #[error("Invalid public key for {address}: {reason}")]
    InvalidPublicKey { address: String, reason: String },

    /// Supplied key pair differs from the committee entry for this node
    #[error("Key pair does not match committee entry for {0}")]
    KeyMismatch(String),

    /// Config file could not be read
    #[error("Cannot read committee config: {0}")]
    Io(#[from] std::io::Error),

    /// Config file could not be parsed
    #[error("Invalid committee config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Consensus error types
#[derive(Error, Debug)]
pub enum ConsensusError {
    /// Leader-only operation called on a validator
    #[error("Only the leader can start consensus")]
    NotLeader,

    /// Operation not allowed in the current stage
    #[error("Invalid phase: expected {expected}, found {actual}")]
    InvalidPhase {
        expected: ConsensusState,
        actual: ConsensusState,
    },

    /// Attempt to move the round backwards
    #[error("Invalid transition: {from} -> {to}")]
    InvalidTransition {
        from: ConsensusState,
        to: ConsensusState,
    },

    /// Round id does not match the round being driven
    #[error("Round mismatch: expected {expected}, got {actual}")]
    RoundMismatch {
        expected: ConsensusId,
        actual: ConsensusId,
    },

    /// Sender is not in the committee
    #[error("Unknown node: {0}")]
    UnknownNode(NodeId),

    /// Response requested without a commitment secret for this round
    #[error("Commitment secret is not set")]
    MissingSecret,

    /// Response requested before the challenge is fixed
    #[error("Challenge is not set")]
    MissingChallenge,

    /// Bytes do not decode to a group element
    #[error("Invalid point: {0}")]
    InvalidPoint(String),

    /// Bytes are not a canonical scalar
    #[error("Invalid scalar: {0}")]
    InvalidScalar(String),

    /// Participation bitmap is malformed
    #[error("Invalid bitmap: {0}")]
    InvalidBitmap(String),

    /// Per-message Schnorr signature did not verify
    #[error("Invalid message signature from node: {0}")]
    InvalidMessageSignature(NodeId),

    /// Challenge does not match Hash(aggregated commitment || block hash)
    #[error("Challenge mismatch for round {0}")]
    ChallengeMismatch(ConsensusId),

    /// Single response does not match the sender's commitment
    #[error("Invalid response from node: {0}")]
    InvalidResponse(NodeId),

    /// Aggregate signature failed the group equation
    #[error("Signature verification failed: {0}")]
    SignatureVerification(String),

    /// Bitmap does not cover a quorum
    #[error("Insufficient participation: {actual} < {required}")]
    InsufficientParticipation { actual: usize, required: usize },

    /// Block bytes do not hash to the announced hash
    #[error("Block hash mismatch for round {0}")]
    BlockHashMismatch(ConsensusId),

    /// Block verifier refused the candidate block
    #[error("Block rejected for round {0}")]
    BlockRejected(ConsensusId),

    /// Block header could not be decoded
    #[error("Invalid block: {0}")]
    InvalidBlock(String),

    /// Wire encoding failure
    #[error("Codec error: {0}")]
    Codec(#[from] bincode::Error),

    /// Readiness sender went away before signalling
    #[error("Ready signal dropped")]
    ReadySignalDropped,
}

/// Result type for consensus operations
pub type ConsensusResult<T> = Result<T, ConsensusError>;
