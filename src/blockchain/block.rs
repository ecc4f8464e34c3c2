use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::transaction::Transaction;

/// Payload carried by a block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    /// Raw bytes (simple ledger mode)
    Data(Vec<u8>),

    /// Ordered transactions (UTXO mode)
    Transactions(Vec<Transaction>),
}

/// Represents a block in the blockchain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Unix timestamp (seconds) when the block was created
    pub timestamp: i64,

    /// Data or transactions included in this block
    pub payload: Payload,

    /// Hash of the previous block, empty for the genesis block
    pub prev_hash: Vec<u8>,

    /// Hash produced by the proof-of-work search
    pub hash: Vec<u8>,

    /// Nonce that produced `hash`
    pub nonce: u64,

    /// Number of leading zero bits the hash had to satisfy
    pub target_bits: u32,
}

impl Block {
    /// Creates an unmined block
    ///
    /// The timestamp never goes below `min_timestamp`, which keeps timestamps
    /// monotonic along the chain even if the wall clock steps back. `hash` and
    /// `nonce` are filled in by the proof-of-work search.
    pub(crate) fn unmined(
        payload: Payload,
        prev_hash: Vec<u8>,
        min_timestamp: i64,
        target_bits: u32,
    ) -> Self {
        Block {
            timestamp: Utc::now().timestamp().max(min_timestamp),
            payload,
            prev_hash,
            hash: Vec::new(),
            nonce: 0,
            target_bits,
        }
    }

    /// Returns true for the first block of a chain
    pub fn is_genesis(&self) -> bool {
        self.prev_hash.is_empty()
    }

    /// Raw data of a data-mode block
    pub fn data(&self) -> Option<&[u8]> {
        match &self.payload {
            Payload::Data(data) => Some(data),
            Payload::Transactions(_) => None,
        }
    }

    /// Transactions of a UTXO-mode block, empty for data blocks
    pub fn transactions(&self) -> &[Transaction] {
        match &self.payload {
            Payload::Data(_) => &[],
            Payload::Transactions(transactions) => transactions,
        }
    }

    /// Bytes committed to by the proof of work in place of the payload
    ///
    /// Data blocks commit to their raw bytes, transaction blocks to the
    /// SHA-256 of their concatenated transaction ids.
    pub fn payload_digest(&self) -> Vec<u8> {
        match &self.payload {
            Payload::Data(data) => data.clone(),
            Payload::Transactions(transactions) => {
                let mut hasher = Sha256::new();
                for transaction in transactions {
                    hasher.update(&transaction.id);
                }
                hasher.finalize().to_vec()
            }
        }
    }

    /// Block hash as a hexadecimal string
    pub fn hash_hex(&self) -> String {
        hex::encode(&self.hash)
    }

    /// Creation time as a UTC date
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.timestamp, 0).single()
    }
}
