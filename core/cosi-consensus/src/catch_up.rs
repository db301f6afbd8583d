//! Catch-up buffer for nodes lagging behind the committee.
//!
//! When the committee has moved on to round N while this node is still busy
//! with an earlier round, messages for N are not processed but recorded here.
//! Once the current round finishes the node consults the buffer and jumps
//! straight to the most advanced round it has heard about.

use std::collections::BTreeMap;

use crate::cosi::CosiSignature;
use crate::types::{BlockConsensusStatus, ConsensusId, ConsensusState};

#[derive(Debug, Default)]
pub struct CatchUpBuffer {
    blocks_received: BTreeMap<ConsensusId, BlockConsensusStatus>,
}

impl CatchUpBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the status of a round ahead of `current`.
    ///
    /// An entry is only replaced by a strictly more advanced state. Without a
    /// header the record can only advance an existing entry. Returns whether
    /// anything was stored.
    pub fn record_if_newer(
        &mut self,
        current: ConsensusId,
        round: ConsensusId,
        block_header: Option<Vec<u8>>,
        state: ConsensusState,
        signature: Option<CosiSignature>,
    ) -> bool {
        if round <= current {
            return false;
        }

        match self.blocks_received.get_mut(&round) {
            Some(existing) => {
                if state <= existing.state {
                    return false;
                }
                if let Some(header) = block_header {
                    existing.block_header = header;
                }
                existing.state = state;
                if signature.is_some() {
                    existing.signature = signature;
                }
                true
            }
            None => match block_header {
                Some(block_header) => {
                    self.blocks_received.insert(
                        round,
                        BlockConsensusStatus {
                            block_header,
                            state,
                            signature,
                        },
                    );
                    true
                }
                None => false,
            },
        }
    }

    /// Take the furthest round beyond `current`, dropping everything up to it.
    pub fn drain_if_ahead(
        &mut self,
        current: ConsensusId,
    ) -> Option<(ConsensusId, BlockConsensusStatus)> {
        self.prune_through(current);

        let furthest = *self.blocks_received.keys().next_back()?;
        let status = self.blocks_received.remove(&furthest)?;
        self.prune_through(furthest);
        Some((furthest, status))
    }

    /// Forget every round at or below `round`
    pub fn prune_through(&mut self, round: ConsensusId) {
        self.blocks_received = self.blocks_received.split_off(&round.saturating_add(1));
        if round == ConsensusId::MAX {
            self.blocks_received.clear();
        }
    }

    pub fn get(&self, round: ConsensusId) -> Option<&BlockConsensusStatus> {
        self.blocks_received.get(&round)
    }

    pub fn len(&self) -> usize {
        self.blocks_received.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks_received.is_empty()
    }
}
