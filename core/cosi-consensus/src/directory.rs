//! Participant directory: node id → peer for the whole committee.
//!
//! Node ids are derived from the network address, so the leader and every
//! validator compute the same id for a peer without exchanging anything. The
//! ordering of [`Directory::public_keys`] (validators by ascending id, leader
//! last) defines bitmap positions.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use crate::cosi::quorum_size;
use crate::crypto::PublicKey;
use crate::errors::ConfigError;
use crate::types::{NodeId, Peer};

/// Derive the compact node id of an `ip:port` address
pub fn node_id_for_address(address: &str) -> NodeId {
    let hash = blake3::hash(address.as_bytes());
    let bytes = hash.as_bytes();
    u16::from_le_bytes([bytes[0], bytes[1]])
}

#[derive(Debug, Clone)]
pub struct Directory {
    self_id: NodeId,
    leader_id: NodeId,
    leader: Peer,
    validators: BTreeMap<NodeId, Peer>,
    public_keys: Arc<[PublicKey]>,
    positions: HashMap<NodeId, usize>,
}

impl Directory {
    /// Build the directory for the node listening on `self_ip:self_port`.
    ///
    /// Fails on duplicate addresses, on two addresses hashing to the same id,
    /// and when this node is not part of the committee.
    pub fn build(
        self_ip: &str,
        self_port: u16,
        validators: Vec<Peer>,
        leader: Peer,
    ) -> Result<Self, ConfigError> {
        let leader_address = leader.address();
        let leader_id = node_id_for_address(&leader_address);

        let mut addresses = HashSet::new();
        addresses.insert(leader_address.clone());

        let mut by_id: BTreeMap<NodeId, Peer> = BTreeMap::new();
        for peer in validators {
            let address = peer.address();
            if !addresses.insert(address.clone()) {
                return Err(ConfigError::DuplicateMember(address));
            }

            let node_id = node_id_for_address(&address);
            let clash = if node_id == leader_id {
                Some(leader_address.clone())
            } else {
                by_id.get(&node_id).map(Peer::address)
            };
            if let Some(first) = clash {
                return Err(ConfigError::DuplicateNodeId {
                    node_id,
                    first,
                    second: address,
                });
            }

            by_id.insert(node_id, peer);
        }

        let self_address = format!("{}:{}", self_ip, self_port);
        if !addresses.contains(&self_address) {
            return Err(ConfigError::NotInCommittee(self_address));
        }
        let self_id = node_id_for_address(&self_address);

        let mut positions: HashMap<NodeId, usize> = by_id
            .keys()
            .enumerate()
            .map(|(position, &node_id)| (node_id, position))
            .collect();
        positions.insert(leader_id, by_id.len());

        let public_keys: Arc<[PublicKey]> = by_id
            .values()
            .map(|peer| peer.public_key)
            .chain(std::iter::once(leader.public_key))
            .collect::<Vec<_>>()
            .into();

        Ok(Self {
            self_id,
            leader_id,
            leader,
            validators: by_id,
            public_keys,
            positions,
        })
    }

    pub fn self_id(&self) -> NodeId {
        self.self_id
    }

    pub fn leader_id(&self) -> NodeId {
        self.leader_id
    }

    pub fn is_leader(&self) -> bool {
        self.self_id == self.leader_id
    }

    pub fn leader(&self) -> &Peer {
        &self.leader
    }

    /// All validators (leader excluded), ordered by node id
    pub fn validator_peers(&self) -> Vec<Peer> {
        self.validators.values().cloned().collect()
    }

    pub fn peer(&self, node_id: NodeId) -> Option<&Peer> {
        if node_id == self.leader_id {
            Some(&self.leader)
        } else {
            self.validators.get(&node_id)
        }
    }

    pub fn public_key(&self, node_id: NodeId) -> Option<&PublicKey> {
        self.peer(node_id).map(|peer| &peer.public_key)
    }

    /// Bitmap position of a member
    pub fn position(&self, node_id: NodeId) -> Option<usize> {
        self.positions.get(&node_id).copied()
    }

    /// Committee public keys: validators by ascending node id, leader last
    pub fn public_keys(&self) -> Arc<[PublicKey]> {
        self.public_keys.clone()
    }

    /// Committee size, leader included
    pub fn len(&self) -> usize {
        self.public_keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.public_keys.is_empty()
    }

    pub fn quorum(&self) -> usize {
        quorum_size(self.len())
    }
}
