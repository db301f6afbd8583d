//! Per-round state for one consensus instance.
//!
//! `RoundState` owns everything that is scoped to a single round: the block
//! being signed, collected commitments and responses, their aggregates, the
//! challenge and this node's nonce. All mutation goes through methods that
//! check the current [`ConsensusState`] first, so phase ordering and the
//! one-contribution-per-node rule hold regardless of message arrival order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use curve25519_dalek::ristretto::RistrettoPoint;
use curve25519_dalek::scalar::Scalar;
use curve25519_dalek::traits::Identity;

use crate::bitmap::Bitmap;
use crate::cosi::{self, CosiSignature};
use crate::crypto::{decode_point, KeyPair};
use crate::directory::Directory;
use crate::errors::{ConsensusError, ConsensusResult};
use crate::types::{BlockHash, ConsensusId, ConsensusState, NodeId};

/// Challenge as broadcast by the leader
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeData {
    pub aggregated_commitment: [u8; 32],
    pub bitmap: Vec<u8>,
    pub challenge: [u8; 32],
}

/// Result of folding in one commitment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Node already committed this round, nothing changed
    Duplicate,
    Accepted { count: usize },
    /// Quorum reached, the challenge is now fixed
    QuorumReached(ChallengeData),
}

/// Result of folding in one response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseOutcome {
    Duplicate,
    /// Sender is not part of the commit set the challenge was computed over
    NotCommitted,
    Accepted { count: usize },
    /// Every committer answered and the aggregate verified
    Finished(CosiSignature),
}

pub struct RoundState {
    directory: Arc<Directory>,
    state: ConsensusState,
    consensus_id: ConsensusId,
    block_hash: BlockHash,
    block_header: Vec<u8>,
    commitments: HashMap<NodeId, RistrettoPoint>,
    aggregated_commitment: RistrettoPoint,
    commit_bitmap: Bitmap,
    challenge: Option<Scalar>,
    responses: HashMap<NodeId, Scalar>,
    aggregated_response: Scalar,
    response_bitmap: Bitmap,
    secret: Option<Scalar>,
    pending_challenge: Option<ChallengeData>,
    started_at: Option<Instant>,
}

impl RoundState {
    pub fn new(directory: Arc<Directory>) -> Self {
        let public_keys = directory.public_keys();
        Self {
            state: ConsensusState::Ready,
            consensus_id: 0,
            block_hash: [0u8; 32],
            block_header: Vec::new(),
            commitments: HashMap::new(),
            aggregated_commitment: RistrettoPoint::identity(),
            commit_bitmap: Bitmap::new(public_keys.clone()),
            challenge: None,
            responses: HashMap::new(),
            aggregated_response: Scalar::ZERO,
            response_bitmap: Bitmap::new(public_keys),
            secret: None,
            pending_challenge: None,
            started_at: None,
            directory,
        }
    }

    pub fn state(&self) -> ConsensusState {
        self.state
    }

    pub fn consensus_id(&self) -> ConsensusId {
        self.consensus_id
    }

    pub fn block_hash(&self) -> &BlockHash {
        &self.block_hash
    }

    pub fn block_header(&self) -> &[u8] {
        &self.block_header
    }

    pub fn commitment_count(&self) -> usize {
        self.commitments.len()
    }

    pub fn response_count(&self) -> usize {
        self.responses.len()
    }

    pub fn aggregated_commitment(&self) -> RistrettoPoint {
        self.aggregated_commitment
    }

    pub fn aggregated_response(&self) -> Scalar {
        self.aggregated_response
    }

    pub fn challenge(&self) -> Option<[u8; 32]> {
        self.challenge.map(|c| c.to_bytes())
    }

    pub fn has_secret(&self) -> bool {
        self.secret.is_some()
    }

    pub fn commit_bitmap(&self) -> &Bitmap {
        &self.commit_bitmap
    }

    pub fn response_bitmap(&self) -> &Bitmap {
        &self.response_bitmap
    }

    /// Time since this node started working on the round
    pub fn elapsed(&self) -> Option<Duration> {
        self.started_at.map(|t| t.elapsed())
    }

    fn expect_state(&self, expected: ConsensusState) -> ConsensusResult<()> {
        if self.state != expected {
            return Err(ConsensusError::InvalidPhase {
                expected,
                actual: self.state,
            });
        }
        Ok(())
    }

    fn transition(&mut self, to: ConsensusState) -> ConsensusResult<()> {
        if to <= self.state {
            return Err(ConsensusError::InvalidTransition { from: self.state, to });
        }
        self.state = to;
        Ok(())
    }

    fn position(&self, node_id: NodeId) -> ConsensusResult<usize> {
        self.directory
            .position(node_id)
            .ok_or(ConsensusError::UnknownNode(node_id))
    }

    fn begin(
        &mut self,
        block_hash: BlockHash,
        block_header: Vec<u8>,
    ) -> ConsensusResult<RistrettoPoint> {
        self.expect_state(ConsensusState::Ready)?;

        // A fresh nonce every round; reusing one would leak the private key.
        let (secret, commitment) = cosi::commit(&mut rand::thread_rng());
        self.secret = Some(secret);
        self.block_hash = block_hash;
        self.block_header = block_header;
        self.started_at = Some(Instant::now());
        Ok(commitment)
    }

    /// Leader: fix the block for this round and fold in the own commitment
    pub fn start_as_leader(
        &mut self,
        block_hash: BlockHash,
        block_header: Vec<u8>,
    ) -> ConsensusResult<CommitOutcome> {
        let commitment = self.begin(block_hash, block_header)?;
        self.transition(ConsensusState::AnnounceDone)?;
        self.add_commitment(self.directory.self_id(), commitment)
    }

    /// Validator: fix the announced block and produce the own commitment
    pub fn start_as_validator(
        &mut self,
        block_hash: BlockHash,
        block_header: Vec<u8>,
    ) -> ConsensusResult<[u8; 32]> {
        let commitment = self.begin(block_hash, block_header)?;
        self.transition(ConsensusState::CommitDone)?;
        Ok(commitment.compress().to_bytes())
    }

    /// Leader: fold one commitment into the aggregate. On quorum the
    /// challenge is derived and the round moves to `ChallengeDone`.
    pub fn add_commitment(
        &mut self,
        node_id: NodeId,
        commitment: RistrettoPoint,
    ) -> ConsensusResult<CommitOutcome> {
        self.expect_state(ConsensusState::AnnounceDone)?;
        let position = self.position(node_id)?;

        if self.commitments.contains_key(&node_id) {
            return Ok(CommitOutcome::Duplicate);
        }
        self.commitments.insert(node_id, commitment);
        self.commit_bitmap.set_participating(position)?;
        self.aggregated_commitment += commitment;

        let count = self.commitments.len();
        if count < self.directory.quorum() {
            return Ok(CommitOutcome::Accepted { count });
        }

        self.transition(ConsensusState::CommitDone)?;
        let challenge = cosi::compute_challenge(&self.aggregated_commitment, &self.block_hash);
        self.challenge = Some(challenge);
        self.transition(ConsensusState::ChallengeDone)?;

        Ok(CommitOutcome::QuorumReached(ChallengeData {
            aggregated_commitment: self.aggregated_commitment.compress().to_bytes(),
            bitmap: self.commit_bitmap.to_bytes(),
            challenge: challenge.to_bytes(),
        }))
    }

    /// Validator: check and fix the leader's challenge. Returns whether this
    /// node is part of the commit set and therefore has to respond.
    pub fn accept_challenge(&mut self, data: &ChallengeData) -> ConsensusResult<bool> {
        self.expect_state(ConsensusState::CommitDone)?;

        let aggregated_commitment = decode_point(&data.aggregated_commitment)?;
        let challenge = cosi::compute_challenge(&aggregated_commitment, &self.block_hash);
        if challenge.to_bytes() != data.challenge {
            return Err(ConsensusError::ChallengeMismatch(self.consensus_id));
        }

        let bitmap = Bitmap::from_bytes(self.directory.public_keys(), &data.bitmap)?;
        let required = self.directory.quorum();
        if bitmap.count_enabled() < required {
            return Err(ConsensusError::InsufficientParticipation {
                actual: bitmap.count_enabled(),
                required,
            });
        }

        let included = bitmap.is_participating(self.position(self.directory.self_id())?);
        self.aggregated_commitment = aggregated_commitment;
        self.commit_bitmap = bitmap;
        self.challenge = Some(challenge);
        self.transition(ConsensusState::ChallengeDone)?;
        Ok(included)
    }

    /// Hold a challenge that arrived before this node committed
    pub fn buffer_challenge(&mut self, data: ChallengeData) {
        self.pending_challenge = Some(data);
    }

    pub fn take_pending_challenge(&mut self) -> Option<ChallengeData> {
        self.pending_challenge.take()
    }

    /// `secret + challenge · private_key` for this node
    pub fn respond(&self, key: &KeyPair) -> ConsensusResult<Scalar> {
        let secret = self.secret.as_ref().ok_or(ConsensusError::MissingSecret)?;
        let challenge = self.challenge.as_ref().ok_or(ConsensusError::MissingChallenge)?;
        Ok(cosi::respond(secret, challenge, key.secret()))
    }

    /// Validator: own response has been handed to the transport
    pub fn mark_response_sent(&mut self) -> ConsensusResult<()> {
        self.expect_state(ConsensusState::ChallengeDone)?;
        self.transition(ConsensusState::ResponseDone)
    }

    /// Leader: fold one response into the aggregate. Once every member of
    /// the commit set has answered, the signature is assembled and verified.
    pub fn add_response(
        &mut self,
        node_id: NodeId,
        response: Scalar,
    ) -> ConsensusResult<ResponseOutcome> {
        self.expect_state(ConsensusState::ChallengeDone)?;
        let position = self.position(node_id)?;

        if !self.commit_bitmap.is_participating(position) {
            return Ok(ResponseOutcome::NotCommitted);
        }
        if self.responses.contains_key(&node_id) {
            return Ok(ResponseOutcome::Duplicate);
        }
        self.check_response(node_id, &response)?;
        self.responses.insert(node_id, response);
        self.response_bitmap.set_participating(position)?;
        self.aggregated_response += response;

        // The challenge binds the whole commit set (exactly a quorum), so
        // every committer has to answer before the aggregate can verify.
        let count = self.responses.len();
        if count < self.commit_bitmap.count_enabled().max(self.directory.quorum()) {
            return Ok(ResponseOutcome::Accepted { count });
        }

        self.transition(ConsensusState::ResponseDone)?;
        let signature = CosiSignature::new(
            self.block_hash,
            &self.aggregated_commitment,
            &self.aggregated_response,
            &self.response_bitmap,
        );
        signature.verify(&self.directory.public_keys())?;
        self.transition(ConsensusState::Finished)?;
        Ok(ResponseOutcome::Finished(signature))
    }

    /// `r_i·G == V_i + c·X_i` for a single committer
    fn check_response(&self, node_id: NodeId, response: &Scalar) -> ConsensusResult<()> {
        let challenge = self.challenge.ok_or(ConsensusError::MissingChallenge)?;
        let commitment = self
            .commitments
            .get(&node_id)
            .ok_or(ConsensusError::UnknownNode(node_id))?;
        let public_key = self
            .directory
            .public_key(node_id)
            .ok_or(ConsensusError::UnknownNode(node_id))?;

        if RistrettoPoint::mul_base(response) != commitment + challenge * public_key.point() {
            return Err(ConsensusError::InvalidResponse(node_id));
        }
        Ok(())
    }

    /// Validator: accept the leader's final signature for this round
    pub fn finish_with(
        &mut self,
        block_hash: BlockHash,
        block_header: Vec<u8>,
        signature: &CosiSignature,
    ) -> ConsensusResult<()> {
        if self.state == ConsensusState::Finished {
            return Err(ConsensusError::InvalidTransition {
                from: self.state,
                to: ConsensusState::Finished,
            });
        }
        if signature.block_hash != block_hash {
            return Err(ConsensusError::BlockHashMismatch(self.consensus_id));
        }
        if self.state > ConsensusState::Ready && self.block_hash != block_hash {
            return Err(ConsensusError::BlockHashMismatch(self.consensus_id));
        }
        signature.verify_quorum(&self.directory.public_keys())?;

        if self.state == ConsensusState::Ready {
            self.block_hash = block_hash;
            self.block_header = block_header;
        }
        self.transition(ConsensusState::Finished)
    }

    /// Take on a stage observed for a round this node did not take part in
    pub fn adopt(
        &mut self,
        block_hash: BlockHash,
        block_header: Vec<u8>,
        state: ConsensusState,
    ) -> ConsensusResult<()> {
        self.expect_state(ConsensusState::Ready)?;
        self.block_hash = block_hash;
        self.block_header = block_header;
        self.transition(state)
    }

    /// Drop every round-scoped contribution and park the round in
    /// `Finished`. Directory and keys are untouched. Allowed in any state.
    pub fn reset_state(&mut self) {
        self.state = ConsensusState::Finished;
        self.commitments.clear();
        self.responses.clear();
        self.secret = None;
        self.challenge = None;
        self.aggregated_commitment = RistrettoPoint::identity();
        self.aggregated_response = Scalar::ZERO;
        self.commit_bitmap.clear();
        self.response_bitmap.clear();
        self.pending_challenge = None;
        self.started_at = None;
    }

    /// Move on to a later round, which starts in `Ready`
    pub fn advance_to(&mut self, consensus_id: ConsensusId) -> ConsensusResult<()> {
        if consensus_id <= self.consensus_id {
            return Err(ConsensusError::RoundMismatch {
                expected: self.consensus_id.saturating_add(1),
                actual: consensus_id,
            });
        }
        if self.state != ConsensusState::Finished && self.state != ConsensusState::Ready {
            return Err(ConsensusError::InvalidPhase {
                expected: ConsensusState::Finished,
                actual: self.state,
            });
        }
        if self.state == ConsensusState::Ready {
            // Nothing was contributed yet, but never carry a nonce over.
            self.reset_state();
        }

        self.consensus_id = consensus_id;
        self.state = ConsensusState::Ready;
        self.block_hash = [0u8; 32];
        self.block_header.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::node_id_for_address;
    use crate::types::Peer;

    struct Member {
        node_id: NodeId,
        key: KeyPair,
    }

    /// Committee of `n` members on 127.0.0.1, leader on port 7000
    fn committee(n: u16) -> (Vec<Peer>, Peer, Vec<Member>) {
        let members: Vec<Member> = (0..n)
            .map(|i| {
                let node_id = node_id_for_address(&format!("127.0.0.1:{}", 7000 + i));
                Member {
                    node_id,
                    key: KeyPair::from_node_id(node_id),
                }
            })
            .collect();
        let peers: Vec<Peer> = members
            .iter()
            .enumerate()
            .map(|(i, m)| Peer::new("127.0.0.1", 7000 + i as u16, *m.key.public_key()))
            .collect();
        (peers[1..].to_vec(), peers[0].clone(), members)
    }

    fn leader_round(n: u16) -> (RoundState, Vec<Member>) {
        let (validators, leader, members) = committee(n);
        let directory = Directory::build("127.0.0.1", 7000, validators, leader).unwrap();
        (RoundState::new(Arc::new(directory)), members)
    }

    #[test]
    fn test_commit_quorum_is_strictly_two_thirds() {
        let (mut round, members) = leader_round(4);
        let outcome = round.start_as_leader([1u8; 32], vec![1]).unwrap();
        assert_eq!(outcome, CommitOutcome::Accepted { count: 1 });

        let (_, c1) = cosi::commit(&mut rand::thread_rng());
        let outcome = round.add_commitment(members[1].node_id, c1).unwrap();
        assert_eq!(outcome, CommitOutcome::Accepted { count: 2 });
        assert_eq!(round.state(), ConsensusState::AnnounceDone);
        assert!(round.challenge().is_none());

        let (_, c2) = cosi::commit(&mut rand::thread_rng());
        match round.add_commitment(members[2].node_id, c2).unwrap() {
            CommitOutcome::QuorumReached(data) => {
                assert_eq!(Some(data.challenge), round.challenge());
                assert_eq!(round.commit_bitmap().count_enabled(), 3);
            }
            other => panic!("expected quorum, got {:?}", other),
        }
        assert_eq!(round.state(), ConsensusState::ChallengeDone);

        // late commitment after the challenge is fixed
        let (_, c3) = cosi::commit(&mut rand::thread_rng());
        assert!(round.add_commitment(members[3].node_id, c3).is_err());
    }

    #[test]
    fn test_duplicate_commitment_ignored() {
        let (mut round, members) = leader_round(7);
        round.start_as_leader([1u8; 32], vec![]).unwrap();

        let (_, c1) = cosi::commit(&mut rand::thread_rng());
        round.add_commitment(members[1].node_id, c1).unwrap();
        let aggregate = round.aggregated_commitment();

        let (_, other) = cosi::commit(&mut rand::thread_rng());
        assert_eq!(
            round.add_commitment(members[1].node_id, other).unwrap(),
            CommitOutcome::Duplicate
        );
        assert_eq!(round.aggregated_commitment(), aggregate);
        assert_eq!(round.commit_bitmap().count_enabled(), 2);
    }

    #[test]
    fn test_unknown_sender_rejected() {
        let (mut round, _) = leader_round(4);
        round.start_as_leader([1u8; 32], vec![]).unwrap();
        let (_, c) = cosi::commit(&mut rand::thread_rng());
        let unknown = node_id_for_address("10.9.9.9:1");
        assert!(matches!(round.add_commitment(unknown, c), Err(ConsensusError::UnknownNode(_))));
    }

    #[test]
    fn test_full_round_produces_verifiable_signature() {
        let (mut round, members) = leader_round(4);
        let block_hash = [5u8; 32];
        round.start_as_leader(block_hash, vec![]).unwrap();

        let mut rng = rand::thread_rng();
        let (s1, c1) = cosi::commit(&mut rng);
        let (s2, c2) = cosi::commit(&mut rng);
        round.add_commitment(members[1].node_id, c1).unwrap();
        let data = match round.add_commitment(members[2].node_id, c2).unwrap() {
            CommitOutcome::QuorumReached(data) => data,
            other => panic!("expected quorum, got {:?}", other),
        };
        let challenge = decode_scalar_for_test(&data.challenge);

        let own = round.respond(&members[0].key).unwrap();
        assert_eq!(
            round.add_response(members[0].node_id, own).unwrap(),
            ResponseOutcome::Accepted { count: 1 }
        );

        // a node outside the commit set cannot contribute
        let (s3, _) = cosi::commit(&mut rng);
        let stray = cosi::respond(&s3, &challenge, members[3].key.secret());
        assert_eq!(
            round.add_response(members[3].node_id, stray).unwrap(),
            ResponseOutcome::NotCommitted
        );

        let r1 = cosi::respond(&s1, &challenge, members[1].key.secret());
        round.add_response(members[1].node_id, r1).unwrap();
        assert_eq!(round.add_response(members[1].node_id, r1).unwrap(), ResponseOutcome::Duplicate);

        let r2 = cosi::respond(&s2, &challenge, members[2].key.secret());
        let signature = match round.add_response(members[2].node_id, r2).unwrap() {
            ResponseOutcome::Finished(signature) => signature,
            other => panic!("expected finished, got {:?}", other),
        };

        assert_eq!(round.state(), ConsensusState::Finished);
        assert_eq!(signature.participants(), 3);
        assert!(signature.verify_quorum(&round.directory.public_keys()).is_ok());
    }

    #[test]
    fn test_bad_response_discards_round() {
        let (mut round, members) = leader_round(4);
        round.start_as_leader([5u8; 32], vec![]).unwrap();

        let mut rng = rand::thread_rng();
        let (s1, c1) = cosi::commit(&mut rng);
        let (_, c2) = cosi::commit(&mut rng);
        round.add_commitment(members[1].node_id, c1).unwrap();
        let data = match round.add_commitment(members[2].node_id, c2).unwrap() {
            CommitOutcome::QuorumReached(data) => data,
            other => panic!("expected quorum, got {:?}", other),
        };
        let challenge = decode_scalar_for_test(&data.challenge);

        let own = round.respond(&members[0].key).unwrap();
        round.add_response(members[0].node_id, own).unwrap();
        round
            .add_response(
                members[1].node_id,
                cosi::respond(&s1, &challenge, members[1].key.secret()),
            )
            .unwrap();

        let aggregate = round.aggregated_response();
        let forged = Scalar::from(12345u64);
        assert!(matches!(
            round.add_response(members[2].node_id, forged),
            Err(ConsensusError::InvalidResponse(id)) if id == members[2].node_id
        ));
        assert_eq!(round.state(), ConsensusState::ChallengeDone);
        assert_eq!(round.response_count(), 2);
        assert_eq!(round.aggregated_response(), aggregate);
    }

    #[test]
    fn test_reset_clears_round_data_only() {
        let (mut round, members) = leader_round(4);
        round.start_as_leader([1u8; 32], vec![1, 2]).unwrap();
        let (_, c1) = cosi::commit(&mut rand::thread_rng());
        round.add_commitment(members[1].node_id, c1).unwrap();

        round.reset_state();

        assert_eq!(round.state(), ConsensusState::Finished);
        assert_eq!(round.commitment_count(), 0);
        assert_eq!(round.response_count(), 0);
        assert!(!round.has_secret());
        assert!(round.challenge().is_none());
        assert_eq!(round.commit_bitmap().count_enabled(), 0);
        assert_eq!(round.directory.len(), 4);

        // no nonce, no response
        assert!(matches!(round.respond(&members[0].key), Err(ConsensusError::MissingSecret)));

        round.advance_to(1).unwrap();
        assert_eq!(round.state(), ConsensusState::Ready);
        assert_eq!(round.consensus_id(), 1);
        assert!(round.advance_to(1).is_err());
    }

    #[test]
    fn test_no_contribution_before_round_starts() {
        let (mut round, members) = leader_round(4);
        let (_, c1) = cosi::commit(&mut rand::thread_rng());
        assert!(matches!(
            round.add_commitment(members[1].node_id, c1),
            Err(ConsensusError::InvalidPhase { .. })
        ));
        assert!(round.add_response(members[1].node_id, Scalar::ONE).is_err());
    }

    #[test]
    fn test_validator_challenge_checks() {
        let (validators, leader, members) = committee(4);
        let directory = Arc::new(Directory::build("127.0.0.1", 7001, validators, leader).unwrap());
        let mut round = RoundState::new(directory.clone());
        let block_hash = [3u8; 32];
        let own_commitment = round.start_as_validator(block_hash, vec![]).unwrap();

        let mut bitmap = Bitmap::new(directory.public_keys());
        let mut aggregate = decode_point(&own_commitment).unwrap();
        bitmap.set_participating(directory.position(members[1].node_id).unwrap()).unwrap();
        for member in [&members[0], &members[2]] {
            let (_, c) = cosi::commit(&mut rand::thread_rng());
            aggregate += c;
            bitmap.set_participating(directory.position(member.node_id).unwrap()).unwrap();
        }

        let bogus = ChallengeData {
            aggregated_commitment: aggregate.compress().to_bytes(),
            bitmap: bitmap.to_bytes(),
            challenge: [0u8; 32],
        };
        assert!(matches!(
            round.accept_challenge(&bogus),
            Err(ConsensusError::ChallengeMismatch(0))
        ));

        let data = ChallengeData {
            challenge: cosi::compute_challenge(&aggregate, &block_hash).to_bytes(),
            ..bogus
        };
        assert!(round.accept_challenge(&data).unwrap());
        assert!(round.respond(&members[1].key).is_ok());
        round.mark_response_sent().unwrap();
        assert_eq!(round.state(), ConsensusState::ResponseDone);
    }

    fn decode_scalar_for_test(bytes: &[u8; 32]) -> Scalar {
        crate::crypto::decode_scalar(bytes).unwrap()
    }
}
