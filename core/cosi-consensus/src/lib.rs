//! CoSi Consensus Module
//!
//! Two-round collective Schnorr signing (CoSi) run inside a PBFT-style
//! round by a fixed shard committee. The leader announces a block,
//! collects commitments up to a 2/3+1 quorum, fixes the challenge and
//! aggregates responses into one compact signature verifiable against
//! the participation bitmap.

pub mod bitmap;
pub mod catch_up;
pub mod config;
pub mod consensus;
pub mod cosi;
pub mod crypto;
pub mod directory;
pub mod errors;
pub mod messages;
pub mod metrics;
pub mod round;
pub mod types;

// Re-export main types for public API
pub use bitmap::Bitmap;
pub use config::{CommitteeConfig, PeerConfig};
pub use consensus::{BlockVerifier, Consensus, OnConsensusDone, ReadySignal, Transport};
pub use cosi::{quorum_size, CosiSignature};
pub use crypto::{KeyPair, MessageSignature, PublicKey};
pub use directory::{node_id_for_address, Directory};
pub use errors::{ConfigError, ConsensusError, ConsensusResult};
pub use messages::{ConsensusMessage, Payload, Phase, SignedMessage};
pub use types::{
    BlockConsensusStatus, BlockHash, ConsensusBlock, ConsensusId, ConsensusState, NodeId, Peer,
    ShardId,
};
