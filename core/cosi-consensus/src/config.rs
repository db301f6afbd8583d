//! Committee configuration

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::crypto::PublicKey;
use crate::directory::Directory;
use crate::errors::ConfigError;
use crate::types::{Peer, ShardId};

/// One committee member as written in the config file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    pub ip: String,
    pub port: u16,
    /// Hex-encoded compressed Ristretto point
    pub public_key: String,
}

impl PeerConfig {
    pub fn to_peer(&self) -> Result<Peer, ConfigError> {
        let public_key = PublicKey::from_hex(&self.public_key).map_err(|e| {
            ConfigError::InvalidPublicKey {
                address: format!("{}:{}", self.ip, self.port),
                reason: e.to_string(),
            }
        })?;
        Ok(Peer::new(self.ip.clone(), self.port, public_key))
    }
}

/// Where this node listens and who it runs consensus with
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitteeConfig {
    /// This node's address
    pub ip: String,
    pub port: u16,

    /// Shard id as given on the command line or in the file
    #[serde(default = "default_shard_id")]
    pub shard_id: String,

    pub leader: PeerConfig,

    /// Validators, leader excluded
    #[serde(default)]
    pub validators: Vec<PeerConfig>,
}

fn default_shard_id() -> String {
    std::env::var("COSI_SHARD_ID").unwrap_or_else(|_| "0".to_string())
}

impl CommitteeConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn shard_id(&self) -> Result<ShardId, ConfigError> {
        self.shard_id
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidShardId(self.shard_id.clone()))
    }

    pub fn build_directory(&self) -> Result<Directory, ConfigError> {
        let leader = self.leader.to_peer()?;
        let validators = self
            .validators
            .iter()
            .map(PeerConfig::to_peer)
            .collect::<Result<Vec<_>, _>>()?;
        Directory::build(&self.ip, self.port, validators, leader)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;

    fn sample_json(shard_id: &str) -> String {
        let key = |seed: u16| KeyPair::from_node_id(seed).public_key().to_hex();
        format!(
            r#"{{
                "ip": "127.0.0.1",
                "port": 9001,
                "shard_id": "{}",
                "leader": {{ "ip": "127.0.0.1", "port": 9000, "public_key": "{}" }},
                "validators": [
                    {{ "ip": "127.0.0.1", "port": 9001, "public_key": "{}" }},
                    {{ "ip": "127.0.0.1", "port": 9002, "public_key": "{}" }}
                ]
            }}"#,
            shard_id,
            key(0),
            key(1),
            key(2)
        )
    }

    #[test]
    fn test_parse_and_build() {
        let config = CommitteeConfig::from_json(&sample_json("3")).unwrap();
        assert_eq!(config.shard_id().unwrap(), 3);

        let directory = config.build_directory().unwrap();
        assert_eq!(directory.len(), 3);
        assert!(!directory.is_leader());
    }

    #[test]
    fn test_unparsable_shard_id() {
        let config = CommitteeConfig::from_json(&sample_json("shard-one")).unwrap();
        assert!(matches!(config.shard_id(), Err(ConfigError::InvalidShardId(_))));
    }

    #[test]
    fn test_bad_public_key() {
        let bad_key = KeyPair::from_node_id(2).public_key().to_hex();
        let json = sample_json("0").replacen(&bad_key, "zz", 1);
        let config = CommitteeConfig::from_json(&json).unwrap();
        assert!(matches!(config.build_directory(), Err(ConfigError::InvalidPublicKey { .. })));
    }

    #[test]
    fn test_malformed_json() {
        assert!(matches!(CommitteeConfig::from_json("{ \"ip\": 1 }"), Err(ConfigError::Parse(_))));
    }
}
