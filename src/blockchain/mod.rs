// Blockchain module
//
// This module contains the ledger engine including:
// - Block structure and proof of work
// - UTXO transactions
// - The persisted chain and its iterator
// - Storage and configuration

pub mod address;
pub mod block;
pub mod chain;
pub mod config;
pub mod iterator;
pub mod proof_of_work;
pub mod storage;
pub mod transaction;

// Re-export main components for easier access
pub use address::Address;
pub use block::{Block, Payload};
pub use chain::{Blockchain, BlockchainError, Utxo};
pub use config::ChainConfig;
pub use iterator::ChainIterator;
pub use proof_of_work::ProofOfWork;
pub use transaction::{Transaction, TxInput, TxOutput};
