//! CoSi consensus driver.
//!
//! One [`Consensus`] instance runs the rounds of one shard committee, either
//! as the leader or as a validator:
//!
//! ```text
//! leader:    start_consensus ─► ANNOUNCE_DONE ─(commit quorum)─► COMMIT_DONE
//!            ─► CHALLENGE_DONE ─(every committer responded)─► RESPONSE_DONE
//!            ─► FINISHED
//! validator: announce ─► COMMIT_DONE ─(challenge)─► CHALLENGE_DONE ─► RESPONSE_DONE
//!            ─(collective signature)─► FINISHED
//! ```
//!
//! Handlers lock the round, mutate it and collect the resulting sends and
//! callbacks as [`Action`]s. Actions run only after the lock is released, so
//! a slow transport or a re-entrant callback never blocks other handlers.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::catch_up::CatchUpBuffer;
use crate::config::CommitteeConfig;
use crate::cosi::CosiSignature;
use crate::crypto::{decode_point, decode_scalar, KeyPair};
use crate::directory::Directory;
use crate::errors::{ConfigError, ConsensusError, ConsensusResult};
use crate::messages::{ConsensusMessage, Payload, Phase, SignedMessage};
use crate::metrics::{self, MessageResult};
use crate::round::{ChallengeData, CommitOutcome, ResponseOutcome, RoundState};
use crate::types::{
    BlockConsensusStatus, BlockHash, ConsensusBlock, ConsensusId, ConsensusState, NodeId, Peer,
    ShardId,
};

/// Outbound side of the peer-to-peer layer
pub trait Transport: Send + Sync {
    fn send(&self, peer: &Peer, message: Bytes);

    fn broadcast(&self, peers: &[Peer], message: Bytes);
}

/// Validation predicate for announced blocks
pub type BlockVerifier<B> = Arc<dyn Fn(&B) -> bool + Send + Sync>;

/// Called exactly once for every block this node sees finish
pub type OnConsensusDone<B> = Arc<dyn Fn(B, CosiSignature) + Send + Sync>;

/// One-shot notification that the leader may propose the block for the
/// given round. Produced once at construction and consumed once.
#[derive(Debug)]
pub struct ReadySignal {
    receiver: oneshot::Receiver<ConsensusId>,
}

impl ReadySignal {
    pub async fn wait(self) -> ConsensusResult<ConsensusId> {
        self.receiver.await.map_err(|_| ConsensusError::ReadySignalDropped)
    }

    /// Non-blocking variant of [`wait`](Self::wait)
    pub fn try_take(mut self) -> ConsensusResult<ConsensusId> {
        self.receiver
            .try_recv()
            .map_err(|_| ConsensusError::ReadySignalDropped)
    }
}

/// Side effect decided under the round lock
enum Action<B> {
    SendToLeader {
        consensus_id: ConsensusId,
        payload: Payload,
    },
    BroadcastToValidators {
        consensus_id: ConsensusId,
        payload: Payload,
    },
    Deliver(B, CosiSignature),
}

struct Inner<B> {
    round: RoundState,
    blocks_received: CatchUpBuffer,
    block: Option<B>,
}

pub struct Consensus<B: ConsensusBlock> {
    directory: Arc<Directory>,
    key_pair: KeyPair,
    shard_id: ShardId,
    inner: Mutex<Inner<B>>,
    ready_signal: Mutex<Option<ReadySignal>>,
    transport: Arc<dyn Transport>,
    block_verifier: BlockVerifier<B>,
    on_consensus_done: OnConsensusDone<B>,
}

impl<B: ConsensusBlock> Consensus<B> {
    /// Create the consensus driver for this node.
    ///
    /// `shard_id` is parsed here so a bad value stops startup. If this node
    /// is the leader, the readiness signal is available right away through
    /// [`take_ready_signal`](Self::take_ready_signal).
    pub fn new(
        directory: Directory,
        key_pair: KeyPair,
        shard_id: &str,
        transport: Arc<dyn Transport>,
        block_verifier: BlockVerifier<B>,
        on_consensus_done: OnConsensusDone<B>,
    ) -> Result<Self, ConfigError> {
        let shard_id: ShardId = shard_id
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidShardId(shard_id.to_string()))?;

        let self_id = directory.self_id();
        if directory.public_key(self_id) != Some(key_pair.public_key()) {
            let address = directory
                .peer(self_id)
                .map(Peer::address)
                .unwrap_or_else(|| self_id.to_string());
            return Err(ConfigError::KeyMismatch(address));
        }

        let directory = Arc::new(directory);
        let ready_signal = if directory.is_leader() {
            let (sender, receiver) = oneshot::channel();
            // The receiver is alive, so this cannot fail.
            let _ = sender.send(0);
            Some(ReadySignal { receiver })
        } else {
            None
        };

        let consensus = Self {
            inner: Mutex::new(Inner {
                round: RoundState::new(directory.clone()),
                blocks_received: CatchUpBuffer::new(),
                block: None,
            }),
            directory,
            key_pair,
            shard_id,
            ready_signal: Mutex::new(ready_signal),
            transport,
            block_verifier,
            on_consensus_done,
        };
        info!("[COSI] created {}", consensus);
        Ok(consensus)
    }

    pub fn from_config(
        config: &CommitteeConfig,
        key_pair: KeyPair,
        transport: Arc<dyn Transport>,
        block_verifier: BlockVerifier<B>,
        on_consensus_done: OnConsensusDone<B>,
    ) -> Result<Self, ConfigError> {
        Self::new(
            config.build_directory()?,
            key_pair,
            &config.shard_id,
            transport,
            block_verifier,
            on_consensus_done,
        )
    }

    pub fn is_leader(&self) -> bool {
        self.directory.is_leader()
    }

    pub fn node_id(&self) -> NodeId {
        self.directory.self_id()
    }

    pub fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    pub fn consensus_id(&self) -> ConsensusId {
        self.inner.lock().round.consensus_id()
    }

    pub fn state(&self) -> ConsensusState {
        self.inner.lock().round.state()
    }

    /// Rounds buffered for catch-up
    pub fn pending_rounds(&self) -> usize {
        self.inner.lock().blocks_received.len()
    }

    /// Leader readiness signal; `None` for validators and after the first take
    pub fn take_ready_signal(&self) -> Option<ReadySignal> {
        self.ready_signal.lock().take()
    }

    /// Drop all contributions of the current round. Accepted in any state.
    pub fn reset_state(&self) {
        let mut inner = self.inner.lock();
        inner.round.reset_state();
        inner.block = None;
    }

    /// Give up on the current round and move to the next one. A validator
    /// then resumes the furthest round it buffered meanwhile. Returns the
    /// round the node ends up in.
    pub fn abort_round(&self) -> ConsensusResult<ConsensusId> {
        let (consensus_id, actions) = {
            let mut inner = self.inner.lock();
            let current = inner.round.consensus_id();
            warn!("[COSI] node {} aborting round {}", self.node_id(), current);
            inner.round.reset_state();
            inner.block = None;
            inner.round.advance_to(current.saturating_add(1))?;
            metrics::record_round("aborted", None);

            let mut actions = Vec::new();
            if self.is_leader() {
                inner.blocks_received.prune_through(current);
            } else {
                self.catch_up(&mut inner, current, &mut actions);
            }
            (inner.round.consensus_id(), actions)
        };
        self.dispatch(actions)?;
        Ok(consensus_id)
    }

    /// Leader: run consensus on `block` for the current round
    pub fn start_consensus(&self, block: B) -> ConsensusResult<()> {
        if !self.is_leader() {
            return Err(ConsensusError::NotLeader);
        }
        let block_hash = block.hash();
        let block_header = block.encode_header();

        let actions = {
            let mut inner = self.inner.lock();
            let consensus_id = inner.round.consensus_id();
            let outcome = inner.round.start_as_leader(block_hash, block_header.clone())?;
            inner.block = Some(block);
            info!(
                "[COSI] leader {} announcing block {} for round {}",
                self.node_id(),
                hex::encode(block_hash),
                consensus_id
            );

            let mut actions = vec![Action::BroadcastToValidators {
                consensus_id,
                payload: Payload::Announce {
                    block_hash,
                    block_header,
                },
            }];
            if let CommitOutcome::QuorumReached(data) = outcome {
                self.leader_challenge(&mut inner, data, &mut actions)?;
            }
            actions
        };
        self.dispatch(actions)
    }

    /// Entry point for bytes delivered by the transport
    pub fn handle_message(&self, bytes: &[u8]) -> ConsensusResult<()> {
        let signed = SignedMessage::decode(bytes)?;
        let phase = signed.message.phase();
        let sender = signed.message.sender;

        if signed.message.shard_id != self.shard_id {
            debug!(
                "[COSI] node {} ignoring {} for shard {}",
                self.node_id(),
                phase.as_str(),
                signed.message.shard_id
            );
            metrics::record_message(phase, MessageResult::Ignored);
            return Ok(());
        }

        let public_key = match self.directory.public_key(sender) {
            Some(key) => key,
            None => {
                metrics::record_message(phase, MessageResult::Rejected);
                return Err(ConsensusError::UnknownNode(sender));
            }
        };
        if !signed.verify(public_key)? {
            warn!(
                "[COSI] node {} got {} with bad signature from {}",
                self.node_id(),
                phase.as_str(),
                sender,
            );
            metrics::record_message(phase, MessageResult::Rejected);
            return Err(ConsensusError::InvalidMessageSignature(sender));
        }

        self.process(signed.message)
    }

    /// Dispatch an authenticated message by payload and role
    fn process(&self, message: ConsensusMessage) -> ConsensusResult<()> {
        let phase = message.phase();
        let sender = message.sender;
        let consensus_id = message.consensus_id;
        let from_leader = sender == self.directory.leader_id();

        match (message.payload, self.is_leader()) {
            (Payload::Announce { block_hash, block_header }, false) if from_leader => {
                self.process_announce(consensus_id, block_hash, block_header)
            }
            (Payload::Commit { commitment }, true) => {
                self.process_commit(consensus_id, sender, commitment)
            }
            (
                Payload::Challenge {
                    aggregated_commitment,
                    bitmap,
                    challenge,
                },
                false,
            ) if from_leader => self.process_challenge(
                consensus_id,
                ChallengeData {
                    aggregated_commitment,
                    bitmap,
                    challenge,
                },
            ),
            (Payload::Response { response }, true) => {
                self.process_response(consensus_id, sender, response)
            }
            (Payload::CollectiveSig { block_header, signature }, false) if from_leader => {
                self.process_collective_sig(consensus_id, block_header, signature)
            }
            _ => {
                debug!(
                    "[COSI] node {} ignoring {} from {}",
                    self.node_id(),
                    phase.as_str(),
                    sender,
                );
                metrics::record_message(phase, MessageResult::Ignored);
                Ok(())
            }
        }
    }

    fn process_announce(
        &self,
        consensus_id: ConsensusId,
        block_hash: BlockHash,
        block_header: Vec<u8>,
    ) -> ConsensusResult<()> {
        let phase = Phase::Announce;
        if consensus_id < self.consensus_id() {
            return self.drop_stale(phase, consensus_id);
        }

        // Block validation is pure and runs outside the round lock.
        let block = match self.check_block(consensus_id, &block_hash, &block_header) {
            Ok(block) => block,
            Err(e) => {
                warn!(
                    "[COSI] node {} rejecting block for round {}: {}",
                    self.node_id(),
                    consensus_id,
                    e,
                );
                metrics::record_message(phase, MessageResult::Rejected);
                return Err(e);
            }
        };

        let actions = {
            let mut inner = self.inner.lock();
            let current = inner.round.consensus_id();
            if consensus_id < current {
                return self.drop_stale(phase, consensus_id);
            }
            if consensus_id > current {
                if inner.round.state() != ConsensusState::Ready {
                    inner.blocks_received.record_if_newer(
                        current,
                        consensus_id,
                        Some(block_header),
                        ConsensusState::AnnounceDone,
                        None,
                    );
                    debug!(
                        "[COSI] node {} buffered announce for round {} (at {})",
                        self.node_id(),
                        consensus_id,
                        current,
                    );
                    metrics::record_message(phase, MessageResult::Buffered);
                    return Ok(());
                }
                // Nothing contributed to the current round yet; join the
                // committee where it is.
                info!(
                    "[COSI] node {} skipping from round {} to {}",
                    self.node_id(),
                    current,
                    consensus_id,
                );
                inner.round.advance_to(consensus_id)?;
            }
            if inner.round.state() != ConsensusState::Ready {
                metrics::record_message(phase, MessageResult::Duplicate);
                return Ok(());
            }

            let mut actions = Vec::new();
            self.validator_commit(&mut inner, block, block_header, &mut actions)?;
            actions
        };
        metrics::record_message(phase, MessageResult::Accepted);
        self.dispatch(actions)
    }

    fn process_commit(
        &self,
        consensus_id: ConsensusId,
        sender: NodeId,
        commitment: [u8; 32],
    ) -> ConsensusResult<()> {
        let phase = Phase::Commit;
        let point = decode_point(&commitment).map_err(|e| {
            metrics::record_message(phase, MessageResult::Rejected);
            e
        })?;

        let actions = {
            let mut inner = self.inner.lock();
            let current = inner.round.consensus_id();
            if consensus_id != current {
                return self.drop_stale(phase, consensus_id);
            }
            match inner.round.state() {
                ConsensusState::AnnounceDone => {}
                ConsensusState::Ready => {
                    debug!(
                        "[COSI] leader {} has no block for round {} yet",
                        self.node_id(),
                        current,
                    );
                    metrics::record_message(phase, MessageResult::Ignored);
                    return Ok(());
                }
                _ => {
                    debug!("[COSI] leader {} dropping late commit from {}", self.node_id(), sender);
                    metrics::record_message(phase, MessageResult::Stale);
                    return Ok(());
                }
            }

            let mut actions = Vec::new();
            match inner.round.add_commitment(sender, point)? {
                CommitOutcome::Duplicate => {
                    metrics::record_message(phase, MessageResult::Duplicate);
                    return Ok(());
                }
                CommitOutcome::Accepted { count } => {
                    debug!(
                        "[COSI] leader {} round {}: {}/{} commitments",
                        self.node_id(),
                        current,
                        count,
                        self.directory.quorum()
                    );
                }
                CommitOutcome::QuorumReached(data) => {
                    self.leader_challenge(&mut inner, data, &mut actions)?;
                }
            }
            actions
        };
        metrics::record_message(phase, MessageResult::Accepted);
        self.dispatch(actions)
    }

    fn process_challenge(
        &self,
        consensus_id: ConsensusId,
        data: ChallengeData,
    ) -> ConsensusResult<()> {
        let phase = Phase::Challenge;
        let actions = {
            let mut inner = self.inner.lock();
            let current = inner.round.consensus_id();
            if consensus_id < current {
                return self.drop_stale(phase, consensus_id);
            }
            if consensus_id > current {
                inner.blocks_received.record_if_newer(
                    current,
                    consensus_id,
                    None,
                    ConsensusState::ChallengeDone,
                    None,
                );
                metrics::record_message(phase, MessageResult::Buffered);
                return Ok(());
            }

            let mut actions = Vec::new();
            match inner.round.state() {
                ConsensusState::Ready => {
                    debug!(
                        "[COSI] node {} holding early challenge for round {}",
                        self.node_id(),
                        current,
                    );
                    inner.round.buffer_challenge(data);
                    metrics::record_message(phase, MessageResult::Buffered);
                    return Ok(());
                }
                ConsensusState::CommitDone => {
                    if let Err(e) = self.validator_respond(&mut inner, &data, &mut actions) {
                        warn!(
                            "[COSI] node {} rejecting challenge for round {}: {}",
                            self.node_id(),
                            current,
                            e,
                        );
                        metrics::record_message(phase, MessageResult::Rejected);
                        return Err(e);
                    }
                }
                _ => {
                    metrics::record_message(phase, MessageResult::Duplicate);
                    return Ok(());
                }
            }
            actions
        };
        metrics::record_message(phase, MessageResult::Accepted);
        self.dispatch(actions)
    }

    fn process_response(
        &self,
        consensus_id: ConsensusId,
        sender: NodeId,
        response: [u8; 32],
    ) -> ConsensusResult<()> {
        let phase = Phase::Response;
        let response = decode_scalar(&response).map_err(|e| {
            metrics::record_message(phase, MessageResult::Rejected);
            e
        })?;

        let actions = {
            let mut inner = self.inner.lock();
            let current = inner.round.consensus_id();
            if consensus_id != current {
                return self.drop_stale(phase, consensus_id);
            }
            let state = inner.round.state();
            if state != ConsensusState::ChallengeDone {
                let result = if state < ConsensusState::ChallengeDone {
                    MessageResult::Ignored
                } else {
                    MessageResult::Stale
                };
                metrics::record_message(phase, result);
                return Ok(());
            }

            let mut actions = Vec::new();
            match inner.round.add_response(sender, response) {
                Ok(ResponseOutcome::NotCommitted) => {
                    debug!(
                        "[COSI] leader {} ignoring response from non-committer {}",
                        self.node_id(),
                        sender,
                    );
                    metrics::record_message(phase, MessageResult::Ignored);
                    return Ok(());
                }
                Ok(ResponseOutcome::Duplicate) => {
                    metrics::record_message(phase, MessageResult::Duplicate);
                    return Ok(());
                }
                Ok(ResponseOutcome::Accepted { count }) => {
                    debug!(
                        "[COSI] leader {} round {}: {} responses",
                        self.node_id(),
                        current,
                        count,
                    );
                }
                Ok(ResponseOutcome::Finished(signature)) => {
                    self.finish_round(&mut inner, signature, &mut actions)?;
                }
                Err(e) => {
                    warn!("[COSI] leader {} discarding round {}: {}", self.node_id(), current, e);
                    inner.round.reset_state();
                    inner.block = None;
                    metrics::record_round("discarded", None);
                    metrics::record_message(phase, MessageResult::Rejected);
                    return Err(e);
                }
            }
            actions
        };
        metrics::record_message(phase, MessageResult::Accepted);
        self.dispatch(actions)
    }

    fn process_collective_sig(
        &self,
        consensus_id: ConsensusId,
        block_header: Vec<u8>,
        signature: CosiSignature,
    ) -> ConsensusResult<()> {
        let phase = Phase::CollectiveSig;
        let actions = {
            let mut inner = self.inner.lock();
            let current = inner.round.consensus_id();
            if consensus_id < current {
                return self.drop_stale(phase, consensus_id);
            }
            if consensus_id > current {
                if inner.round.state() != ConsensusState::Ready {
                    inner.blocks_received.record_if_newer(
                        current,
                        consensus_id,
                        Some(block_header),
                        ConsensusState::Finished,
                        Some(signature),
                    );
                    metrics::record_message(phase, MessageResult::Buffered);
                    return Ok(());
                }
                inner.round.advance_to(consensus_id)?;
            }

            let mut actions = Vec::new();
            let finished = self.validator_finish(&mut inner, block_header, signature, &mut actions);
            if let Err(e) = finished {
                warn!(
                    "[COSI] node {} rejecting collective signature for round {}: {}",
                    self.node_id(),
                    consensus_id,
                    e,
                );
                metrics::record_message(phase, MessageResult::Rejected);
                return Err(e);
            }
            actions
        };
        metrics::record_message(phase, MessageResult::Accepted);
        self.dispatch(actions)
    }

    /// Leader: the challenge is fixed; queue it and fold in the own response
    fn leader_challenge(
        &self,
        inner: &mut Inner<B>,
        data: ChallengeData,
        actions: &mut Vec<Action<B>>,
    ) -> ConsensusResult<()> {
        let consensus_id = inner.round.consensus_id();
        info!(
            "[COSI] leader {} round {}: commit quorum reached, challenge {}",
            self.node_id(),
            consensus_id,
            hex::encode(data.challenge)
        );
        actions.push(Action::BroadcastToValidators {
            consensus_id,
            payload: data.into(),
        });

        let own = inner.round.respond(&self.key_pair)?;
        let outcome = inner.round.add_response(self.node_id(), own)?;
        if let ResponseOutcome::Finished(signature) = outcome {
            self.finish_round(inner, signature, actions)?;
        }
        Ok(())
    }

    /// Validator: take on the announced block and commit to it
    fn validator_commit(
        &self,
        inner: &mut Inner<B>,
        block: B,
        block_header: Vec<u8>,
        actions: &mut Vec<Action<B>>,
    ) -> ConsensusResult<()> {
        let consensus_id = inner.round.consensus_id();
        let commitment = inner.round.start_as_validator(block.hash(), block_header)?;
        inner.block = Some(block);
        actions.push(Action::SendToLeader {
            consensus_id,
            payload: Payload::Commit { commitment },
        });

        if let Some(pending) = inner.round.take_pending_challenge() {
            if let Err(e) = self.validator_respond(inner, &pending, actions) {
                warn!(
                    "[COSI] node {} dropping early challenge for round {}: {}",
                    self.node_id(),
                    consensus_id,
                    e,
                );
            }
        }
        Ok(())
    }

    /// Validator: check the challenge and answer if this node is in the
    /// commit set
    fn validator_respond(
        &self,
        inner: &mut Inner<B>,
        data: &ChallengeData,
        actions: &mut Vec<Action<B>>,
    ) -> ConsensusResult<()> {
        let consensus_id = inner.round.consensus_id();
        if !inner.round.accept_challenge(data)? {
            debug!("[COSI] node {} not in commit set of round {}", self.node_id(), consensus_id);
            return Ok(());
        }

        let response = inner.round.respond(&self.key_pair)?;
        inner.round.mark_response_sent()?;
        actions.push(Action::SendToLeader {
            consensus_id,
            payload: Payload::Response {
                response: response.to_bytes(),
            },
        });
        Ok(())
    }

    /// Validator: accept the leader's collective signature for the current round
    fn validator_finish(
        &self,
        inner: &mut Inner<B>,
        block_header: Vec<u8>,
        signature: CosiSignature,
        actions: &mut Vec<Action<B>>,
    ) -> ConsensusResult<()> {
        let block = B::decode_header(&block_header)?;
        inner.round.finish_with(block.hash(), block_header, &signature)?;
        inner.block = Some(block);
        self.finish_round(inner, signature, actions)
    }

    /// Round is verified: hand the block out, reset and move to the next round
    fn finish_round(
        &self,
        inner: &mut Inner<B>,
        signature: CosiSignature,
        actions: &mut Vec<Action<B>>,
    ) -> ConsensusResult<()> {
        let consensus_id = inner.round.consensus_id();
        let block = match inner.block.take() {
            Some(block) => block,
            None => B::decode_header(inner.round.block_header())?,
        };
        info!(
            "[COSI] node {} finished round {} with {}/{} signers",
            self.node_id(),
            consensus_id,
            signature.participants(),
            self.directory.len()
        );
        metrics::record_round("finished", inner.round.elapsed().map(|d| d.as_secs_f64()));

        if self.is_leader() {
            actions.push(Action::BroadcastToValidators {
                consensus_id,
                payload: Payload::CollectiveSig {
                    block_header: inner.round.block_header().to_vec(),
                    signature: signature.clone(),
                },
            });
        }
        actions.push(Action::Deliver(block, signature));

        inner.round.reset_state();
        inner.round.advance_to(consensus_id.saturating_add(1))?;

        if !self.is_leader() {
            self.catch_up(inner, consensus_id, actions);
        }
        Ok(())
    }

    /// Jump to the furthest round buffered while `finished` was in progress
    fn catch_up(&self, inner: &mut Inner<B>, finished: ConsensusId, actions: &mut Vec<Action<B>>) {
        let (round, status) = match inner.blocks_received.drain_if_ahead(finished) {
            Some(entry) => entry,
            None => return,
        };
        info!(
            "[COSI] node {} catching up from round {} to {} ({})",
            self.node_id(),
            finished,
            round,
            status.state
        );

        if let Err(e) = self.resume_round(inner, round, status, actions) {
            warn!("[COSI] node {} could not catch up to round {}: {}", self.node_id(), round, e);
        }
    }

    fn resume_round(
        &self,
        inner: &mut Inner<B>,
        round: ConsensusId,
        status: BlockConsensusStatus,
        actions: &mut Vec<Action<B>>,
    ) -> ConsensusResult<()> {
        if round > inner.round.consensus_id() {
            inner.round.advance_to(round)?;
        }
        match (status.state, status.signature) {
            (ConsensusState::Finished, Some(signature)) => {
                self.validator_finish(inner, status.block_header, signature, actions)
            }
            (ConsensusState::AnnounceDone, _) => {
                let block = B::decode_header(&status.block_header)?;
                if !(self.block_verifier)(&block) {
                    return Err(ConsensusError::BlockRejected(round));
                }
                self.validator_commit(inner, block, status.block_header, actions)
            }
            (state, _) => {
                // Too late to contribute; wait for the collective signature.
                let block = B::decode_header(&status.block_header)?;
                inner.round.adopt(block.hash(), status.block_header, state)?;
                inner.block = Some(block);
                Ok(())
            }
        }
    }

    fn check_block(
        &self,
        consensus_id: ConsensusId,
        block_hash: &BlockHash,
        block_header: &[u8],
    ) -> ConsensusResult<B> {
        let block = B::decode_header(block_header)?;
        if &block.hash() != block_hash {
            return Err(ConsensusError::BlockHashMismatch(consensus_id));
        }
        if !(self.block_verifier)(&block) {
            return Err(ConsensusError::BlockRejected(consensus_id));
        }
        Ok(block)
    }

    fn drop_stale(&self, phase: Phase, consensus_id: ConsensusId) -> ConsensusResult<()> {
        debug!(
            "[COSI] node {} dropping stale {} for round {}",
            self.node_id(),
            phase.as_str(),
            consensus_id,
        );
        metrics::record_message(phase, MessageResult::Stale);
        Ok(())
    }

    fn seal(&self, consensus_id: ConsensusId, payload: Payload) -> ConsensusResult<Bytes> {
        ConsensusMessage {
            consensus_id,
            shard_id: self.shard_id,
            sender: self.node_id(),
            payload,
        }
        .sign(&self.key_pair)?
        .encode()
    }

    /// Perform queued actions. Must be called without the round lock held.
    fn dispatch(&self, actions: Vec<Action<B>>) -> ConsensusResult<()> {
        for action in actions {
            match action {
                Action::SendToLeader { consensus_id, payload } => {
                    let bytes = self.seal(consensus_id, payload)?;
                    self.transport.send(self.directory.leader(), bytes);
                }
                Action::BroadcastToValidators { consensus_id, payload } => {
                    let bytes = self.seal(consensus_id, payload)?;
                    self.transport.broadcast(&self.directory.validator_peers(), bytes);
                }
                Action::Deliver(block, signature) => (self.on_consensus_done)(block, signature),
            }
        }
        Ok(())
    }
}

impl<B: ConsensusBlock> fmt::Display for Consensus<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let duty = if self.is_leader() { "LDR" } else { "VLD" };
        let inner = self.inner.lock();
        write!(
            f,
            "[duty:{}, shard:{}, node:{}, round:{}, state:{}]",
            duty,
            self.shard_id,
            self.node_id(),
            inner.round.consensus_id(),
            inner.round.state()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::node_id_for_address;
    use sha2::{Digest, Sha256};

    #[derive(Debug, Clone, PartialEq)]
    struct Header(Vec<u8>);

    impl ConsensusBlock for Header {
        fn hash(&self) -> BlockHash {
            Sha256::digest(&self.0).into()
        }

        fn encode_header(&self) -> Vec<u8> {
            self.0.clone()
        }

        fn decode_header(bytes: &[u8]) -> ConsensusResult<Self> {
            Ok(Header(bytes.to_vec()))
        }
    }

    #[derive(Default)]
    struct Outbox {
        sent: Mutex<Vec<(String, Bytes)>>,
    }

    impl Transport for Outbox {
        fn send(&self, peer: &Peer, message: Bytes) {
            self.sent.lock().push((peer.address(), message));
        }

        fn broadcast(&self, peers: &[Peer], message: Bytes) {
            for peer in peers {
                self.send(peer, message.clone());
            }
        }
    }

    fn key(port: u16) -> KeyPair {
        KeyPair::from_node_id(node_id_for_address(&format!("127.0.0.1:{}", port)))
    }

    fn directory(self_port: u16) -> Directory {
        let peer = |port: u16| Peer::new("127.0.0.1", port, *key(port).public_key());
        Directory::build("127.0.0.1", self_port, vec![peer(9001), peer(9002)], peer(9000)).unwrap()
    }

    fn build(
        self_port: u16,
        key_pair: KeyPair,
        shard_id: &str,
        outbox: Arc<Outbox>,
    ) -> Result<Consensus<Header>, ConfigError> {
        Consensus::new(
            directory(self_port),
            key_pair,
            shard_id,
            outbox,
            Arc::new(|_: &Header| true),
            Arc::new(|_: Header, _: CosiSignature| {}),
        )
    }

    #[test]
    fn test_display_hides_keys() {
        let leader = build(9000, key(9000), "2", Arc::default()).unwrap();
        let shown = leader.to_string();
        assert_eq!(
            shown,
            format!("[duty:LDR, shard:2, node:{}, round:0, state:READY]", leader.node_id())
        );
        assert!(!shown.contains(&key(9000).public_key().to_hex()));

        let validator = build(9001, key(9001), "2", Arc::default()).unwrap();
        assert!(validator.to_string().starts_with("[duty:VLD, shard:2,"));
    }

    #[test]
    fn test_constructor_errors() {
        assert!(matches!(
            build(9000, key(9000), "two", Arc::default()),
            Err(ConfigError::InvalidShardId(_))
        ));
        assert!(matches!(
            build(9001, key(9002), "0", Arc::default()),
            Err(ConfigError::KeyMismatch(address)) if address == "127.0.0.1:9001"
        ));
    }

    #[test]
    fn test_leader_announces_to_validators() {
        let outbox = Arc::new(Outbox::default());
        let leader = build(9000, key(9000), "0", outbox.clone()).unwrap();
        leader.start_consensus(Header(b"genesis".to_vec())).unwrap();
        assert_eq!(leader.state(), ConsensusState::AnnounceDone);

        let sent = outbox.sent.lock();
        let mut targets: Vec<&str> = sent.iter().map(|(to, _)| to.as_str()).collect();
        targets.sort_unstable();
        assert_eq!(targets, vec!["127.0.0.1:9001", "127.0.0.1:9002"]);

        let message = SignedMessage::decode(&sent[0].1).unwrap();
        assert!(message.verify(key(9000).public_key()).unwrap());
        assert_eq!(message.message.phase(), Phase::Announce);
        drop(sent);

        // One block per round.
        assert!(matches!(
            leader.start_consensus(Header(b"again".to_vec())),
            Err(ConsensusError::InvalidPhase { .. })
        ));
    }

    #[test]
    fn test_reset_and_abort() {
        let leader = build(9000, key(9000), "0", Arc::default()).unwrap();
        leader.start_consensus(Header(b"stuck".to_vec())).unwrap();

        leader.reset_state();
        assert_eq!(leader.state(), ConsensusState::Finished);
        assert_eq!(leader.consensus_id(), 0);

        assert_eq!(leader.abort_round().unwrap(), 1);
        assert_eq!(leader.state(), ConsensusState::Ready);
        leader.start_consensus(Header(b"next".to_vec())).unwrap();
    }
}
