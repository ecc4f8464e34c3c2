use std::path::Path;

use sled::{Db, Tree};
use thiserror::Error;

use super::block::Block;

/// Metadata key holding the hash of the current tip
const TIP_KEY: &[u8] = b"latest_block_hash";

/// Metadata key holding the chain difficulty
const DIFFICULTY_KEY: &[u8] = b"difficulty";

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("Item not found: {0}")]
    NotFound(String),
}

/// Key-value storage for blocks and the tip pointer
///
/// Blocks live in the `blocks` tree keyed by their hash. The `metadata` tree
/// holds the tip hash and the chain difficulty under well-known keys.
pub struct BlockchainStorage {
    /// The database instance
    db: Db,

    /// Tree for blocks
    blocks: Tree,

    /// Tree for metadata
    metadata: Tree,
}

impl std::fmt::Debug for BlockchainStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockchainStorage")
            .field("blocks", &self.blocks.len())
            .finish()
    }
}

impl BlockchainStorage {
    /// Opens (or creates) the blockchain storage
    ///
    /// # Arguments
    ///
    /// * `path` - The path to the database directory
    ///
    /// # Returns
    ///
    /// A new BlockchainStorage instance
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path)?;

        let blocks = db.open_tree("blocks")?;
        let metadata = db.open_tree("metadata")?;

        Ok(Self {
            db,
            blocks,
            metadata,
        })
    }

    /// Writes a block under its hash and flushes it to disk
    ///
    /// # Arguments
    ///
    /// * `block` - The block to save
    ///
    /// # Returns
    ///
    /// Ok(()) once the block is durable
    pub fn put_block(&self, block: &Block) -> Result<(), StorageError> {
        let value = bincode::serialize(block)
            .map_err(|e| StorageError::SerializationError(e.to_string()))?;

        self.blocks.insert(block.hash.as_slice(), value)?;
        self.blocks.flush()?;

        Ok(())
    }

    /// Gets a block by its hash
    ///
    /// # Arguments
    ///
    /// * `hash` - The hash of the block
    ///
    /// # Returns
    ///
    /// The block if found
    pub fn get_block(&self, hash: &[u8]) -> Result<Block, StorageError> {
        if let Some(value) = self.blocks.get(hash)? {
            let block: Block = bincode::deserialize(&value)
                .map_err(|e| StorageError::DeserializationError(e.to_string()))?;

            Ok(block)
        } else {
            Err(StorageError::NotFound(format!(
                "Block with hash {} not found",
                hex::encode(hash)
            )))
        }
    }

    /// Points the tip at `hash` and flushes it to disk
    ///
    /// Must only be called once the block itself is durable.
    ///
    /// # Arguments
    ///
    /// * `hash` - The hash of the new tip block
    pub fn set_tip(&self, hash: &[u8]) -> Result<(), StorageError> {
        self.metadata.insert(TIP_KEY, hash)?;
        self.metadata.flush()?;
        Ok(())
    }

    /// Gets the tip hash
    ///
    /// # Returns
    ///
    /// The tip hash, or None if no chain has been created
    pub fn tip(&self) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.metadata.get(TIP_KEY)?.map(|value| value.to_vec()))
    }

    /// Records the difficulty every block of the chain is mined at
    ///
    /// # Arguments
    ///
    /// * `difficulty` - Number of leading zero bits
    pub fn set_difficulty(&self, difficulty: u32) -> Result<(), StorageError> {
        self.metadata.insert(DIFFICULTY_KEY, difficulty.to_be_bytes().to_vec())?;
        self.metadata.flush()?;
        Ok(())
    }

    /// Gets the recorded chain difficulty
    ///
    /// # Returns
    ///
    /// The difficulty, or None if none was recorded
    pub fn difficulty(&self) -> Result<Option<u32>, StorageError> {
        match self.metadata.get(DIFFICULTY_KEY)? {
            Some(value) => {
                let bytes = <[u8; 4]>::try_from(&value[..]).map_err(|_| {
                    StorageError::DeserializationError(format!(
                        "difficulty has {} bytes, expected 4",
                        value.len()
                    ))
                })?;
                Ok(Some(u32::from_be_bytes(bytes)))
            }
            None => Ok(None),
        }
    }

    /// Number of stored blocks, including unreferenced ones
    ///
    /// # Returns
    ///
    /// The size of the `blocks` tree
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Flushes all pending writes to disk
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}
