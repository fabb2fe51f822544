//! Node configuration: `mineRate`, genesis parameters, reward constants,
//! pub/sub and beacon URLs, and on-disk layout.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenesisConfig {
    pub last_hash: String,
    pub hash: String,
    pub difficulty: u64,
    pub nonce: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Target inter-block interval, milliseconds.
    pub mine_rate: u64,
    pub genesis: GenesisConfig,
    pub reward_tx_input_address: String,
    pub mining_reward: u64,
    pub initial_balance: u64,
    /// Gossipsub listen multiaddr, e.g. `/ip4/0.0.0.0/tcp/7000`.
    pub pubsub_addr: String,
    /// Seed peer used for startup sync of the chain and pool.
    pub beacon_url: Option<String>,
    pub data_dir: PathBuf,
    pub keys_dir: PathBuf,
    pub mining_enabled: bool,
}

impl NodeConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let builder = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(config::Environment::with_prefix("KNDCHAIN").separator("__"));
        let cfg = builder.build()?;
        Ok(cfg.try_deserialize()?)
    }

    pub fn example() -> Self {
        Self {
            mine_rate: 10_000,
            genesis: GenesisConfig {
                last_hash: "0x000".into(),
                hash: "0x000".into(),
                difficulty: 3,
                nonce: 0,
            },
            reward_tx_input_address: "MINER_REWARD".into(),
            mining_reward: 5,
            initial_balance: 1000,
            pubsub_addr: "/ip4/0.0.0.0/tcp/7000".into(),
            beacon_url: None,
            data_dir: PathBuf::from("data"),
            keys_dir: PathBuf::from("keys"),
            mining_enabled: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn example_config_round_trips_through_toml() {
        let cfg = NodeConfig::example();
        let rendered = toml::to_string_pretty(&cfg).unwrap();
        let parsed: NodeConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed.mine_rate, cfg.mine_rate);
        assert_eq!(parsed.genesis.difficulty, cfg.genesis.difficulty);
    }
}
