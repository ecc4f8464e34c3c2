use std::path::PathBuf;

use super::chain::BlockchainError;
use super::proof_of_work::{is_supported_target, MAX_TARGET_BITS};

/// Default location of the chain database
pub const DEFAULT_DATA_DIR: &str = "data/blockchain";

/// Default number of leading zero bits required in a block hash
pub const DEFAULT_DIFFICULTY: u32 = 16;

/// Value paid by the genesis coinbase transaction
pub const GENESIS_REWARD: u64 = 10;

/// Settings for a single chain instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainConfig {
    /// Directory holding the sled database
    pub data_dir: PathBuf,

    /// Target bits every block mined by this instance must satisfy
    pub difficulty: u32,

    /// Value of the coinbase output in the genesis block
    pub genesis_reward: u64,
}

impl Default for ChainConfig {
    fn default() -> Self {
        ChainConfig {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            difficulty: DEFAULT_DIFFICULTY,
            genesis_reward: GENESIS_REWARD,
        }
    }
}

impl ChainConfig {
    /// Creates a configuration rooted at `data_dir` with default parameters
    pub fn with_data_dir<P: Into<PathBuf>>(data_dir: P) -> Self {
        ChainConfig {
            data_dir: data_dir.into(),
            ..ChainConfig::default()
        }
    }

    /// Overrides the mining difficulty
    pub fn difficulty(mut self, difficulty: u32) -> Self {
        self.difficulty = difficulty;
        self
    }

    /// Checks that the parameters describe a minable chain
    pub fn validate(&self) -> Result<(), BlockchainError> {
        if !is_supported_target(self.difficulty) {
            return Err(BlockchainError::InvalidConfig(format!(
                "difficulty must be between 1 and {}, got {}",
                MAX_TARGET_BITS, self.difficulty
            )));
        }

        if self.genesis_reward == 0 {
            return Err(BlockchainError::InvalidConfig(
                "genesis reward must be positive".to_string(),
            ));
        }

        Ok(())
    }
}
