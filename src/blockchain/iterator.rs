use super::block::Block;
use super::chain::BlockchainError;
use super::storage::BlockchainStorage;

/// Walks the chain from a starting hash back to genesis
///
/// Blocks are loaded lazily, one storage read per step. Once the genesis
/// block has been returned the cursor is exhausted.
#[derive(Debug)]
pub struct ChainIterator<'a> {
    storage: &'a BlockchainStorage,
    current: Option<Vec<u8>>,
}

impl<'a> ChainIterator<'a> {
    pub(crate) fn new(storage: &'a BlockchainStorage, start: Vec<u8>) -> Self {
        ChainIterator {
            storage,
            current: Some(start),
        }
    }

    /// Returns true while blocks remain
    pub fn has_next(&self) -> bool {
        self.current.is_some()
    }

    /// Loads the block under the cursor and steps to its predecessor
    ///
    /// Fails with [`BlockchainError::IteratorExhausted`] after genesis.
    pub fn next_block(&mut self) -> Result<Block, BlockchainError> {
        let hash = self
            .current
            .take()
            .ok_or(BlockchainError::IteratorExhausted)?;

        let block = self.storage.get_block(&hash)?;
        if !block.is_genesis() {
            self.current = Some(block.prev_hash.clone());
        }

        Ok(block)
    }
}

impl Iterator for ChainIterator<'_> {
    type Item = Result<Block, BlockchainError>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.has_next() {
            return None;
        }

        Some(self.next_block())
    }
}
