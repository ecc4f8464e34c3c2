use std::sync::atomic::{AtomicBool, Ordering};

use log::debug;
use num_bigint::BigUint;
use sha2::{Digest, Sha256};

use super::block::Block;

/// How often the search checks for cancellation and logs progress
const CHECK_INTERVAL: u64 = 1 << 16;

/// Highest difficulty a block may be mined or validated at
///
/// At 32 bits a search needs about 2^32 hashes on average, far inside the
/// 64-bit nonce space.
pub const MAX_TARGET_BITS: u32 = 32;

/// Returns true if `bits` is a difficulty blocks may carry
pub fn is_supported_target(bits: u32) -> bool {
    (1..=MAX_TARGET_BITS).contains(&bits)
}

/// Proof-of-work search and validation bound to one block
///
/// The digest covers the previous hash, the payload digest, the timestamp,
/// the target bits and the nonce. A nonce is accepted when the digest,
/// read as a big-endian integer, is strictly below `2^(256 - target_bits)`.
/// Blocks with `target_bits` outside `1..=MAX_TARGET_BITS` never validate.
#[derive(Debug)]
pub struct ProofOfWork<'a> {
    block: &'a Block,
    target: BigUint,
    payload_digest: Vec<u8>,
}

impl<'a> ProofOfWork<'a> {
    /// Binds the search to a block's fixed fields (hash and nonce excluded)
    pub fn new(block: &'a Block) -> Self {
        let shift = 256u32.saturating_sub(block.target_bits);
        let target = BigUint::from(1u8) << shift;

        ProofOfWork {
            block,
            target,
            payload_digest: block.payload_digest(),
        }
    }

    /// The numeric threshold a digest must stay below
    pub fn target(&self) -> &BigUint {
        &self.target
    }

    fn prepare_data(&self, nonce: u64) -> Vec<u8> {
        let mut data = Vec::with_capacity(self.block.prev_hash.len() + self.payload_digest.len() + 20);
        data.extend_from_slice(&self.block.prev_hash);
        data.extend_from_slice(&self.payload_digest);
        data.extend_from_slice(&self.block.timestamp.to_be_bytes());
        data.extend_from_slice(&self.block.target_bits.to_be_bytes());
        data.extend_from_slice(&nonce.to_be_bytes());
        data
    }

    /// Digest of the block fields with the given nonce
    pub fn digest(&self, nonce: u64) -> Vec<u8> {
        Sha256::digest(self.prepare_data(nonce)).to_vec()
    }

    fn meets_target(&self, hash: &[u8]) -> bool {
        BigUint::from_bytes_be(hash) < self.target
    }

    /// Searches nonces from 0 upward and returns the first match with its hash
    ///
    /// # Returns
    ///
    /// `None` if the block's difficulty is unsupported or no nonce satisfies
    /// the target
    pub fn run(&self) -> Option<(u64, Vec<u8>)> {
        let never = AtomicBool::new(false);
        self.run_cancellable(&never)
    }

    /// Like [`ProofOfWork::run`], but gives up when `cancel` becomes true
    ///
    /// Returns `None` if the search was cancelled, the difficulty is
    /// unsupported, or the nonce space ran out.
    pub fn run_cancellable(&self, cancel: &AtomicBool) -> Option<(u64, Vec<u8>)> {
        if !is_supported_target(self.block.target_bits) {
            debug!("Refusing to mine at {} target bits", self.block.target_bits);
            return None;
        }

        let mut nonce: u64 = 0;

        loop {
            if nonce % CHECK_INTERVAL == 0 {
                if cancel.load(Ordering::Relaxed) {
                    debug!("Proof-of-work search cancelled at nonce {}", nonce);
                    return None;
                }
                if nonce > 0 {
                    debug!("Mining... nonce: {}", nonce);
                }
            }

            let hash = self.digest(nonce);
            if self.meets_target(&hash) {
                debug!("Found nonce {} for hash {}", nonce, hex::encode(&hash));
                return Some((nonce, hash));
            }

            nonce = nonce.checked_add(1)?;
        }
    }

    /// Recomputes the digest with the stored nonce and checks it
    ///
    /// The digest must equal the stored hash and satisfy the target, and
    /// the block's difficulty must be supported.
    pub fn validate(&self) -> bool {
        if !is_supported_target(self.block.target_bits) {
            return false;
        }

        let hash = self.digest(self.block.nonce);
        hash == self.block.hash && self.meets_target(&hash)
    }
}
