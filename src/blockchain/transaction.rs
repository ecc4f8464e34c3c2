use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::address::Address;
use super::chain::{Blockchain, BlockchainError};

/// Errors that can occur during transaction operations
#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

/// Reference to an output of an earlier transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    /// Id of the transaction holding the spent output
    pub txid: Vec<u8>,

    /// Index of the spent output in that transaction
    pub vout: u32,

    /// Address claiming the output
    pub spender: Address,
}

impl TxInput {
    /// Checks whether this input was signed off by `address`
    pub fn uses_key(&self, address: &Address) -> bool {
        &self.spender == address
    }
}

/// Value assigned to an address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub value: u64,
    pub recipient: Address,
}

impl TxOutput {
    /// Checks whether `address` may spend this output
    pub fn is_locked_with(&self, address: &Address) -> bool {
        &self.recipient == address
    }
}

/// Represents a transaction in the blockchain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// SHA-256 of the transaction contents
    pub id: Vec<u8>,

    pub inputs: Vec<TxInput>,

    pub outputs: Vec<TxOutput>,

    /// Free-form note, used by coinbase transactions to keep their ids distinct
    pub memo: String,
}

/// Fields covered by the transaction id
#[derive(Serialize)]
struct TransactionContents<'a> {
    inputs: &'a [TxInput],
    outputs: &'a [TxOutput],
    memo: &'a str,
}

impl Transaction {
    fn with_id(inputs: Vec<TxInput>, outputs: Vec<TxOutput>, memo: String) -> Result<Self, TransactionError> {
        let mut transaction = Transaction {
            id: Vec::new(),
            inputs,
            outputs,
            memo,
        };
        transaction.id = transaction.compute_id()?;
        Ok(transaction)
    }

    /// Creates a coinbase transaction paying `value` to `to`
    ///
    /// An empty memo is replaced by a reward description.
    pub fn new_coinbase(to: &Address, value: u64, memo: &str) -> Result<Self, TransactionError> {
        if value == 0 {
            return Err(TransactionError::InvalidAmount(
                "coinbase value must be positive".to_string(),
            ));
        }

        let memo = if memo.is_empty() {
            format!("Reward to '{}'", to)
        } else {
            memo.to_string()
        };

        Transaction::with_id(
            Vec::new(),
            vec![TxOutput {
                value,
                recipient: to.clone(),
            }],
            memo,
        )
    }

    /// Builds a transaction moving `amount` from `from` to `to`
    ///
    /// Unspent outputs of `from` are consumed in discovery order until they
    /// cover `amount`; any excess returns to `from` as a change output. The
    /// result is not mined yet.
    pub fn new_utxo(
        from: &Address,
        to: &Address,
        amount: u64,
        chain: &Blockchain,
    ) -> Result<Self, BlockchainError> {
        if amount == 0 {
            return Err(TransactionError::InvalidAmount("amount must be positive".to_string()).into());
        }

        let (accumulated, spendable) = chain.find_spendable_outputs(from, amount)?;
        if accumulated < amount {
            return Err(BlockchainError::InsufficientFunds {
                required: amount,
                available: accumulated,
            });
        }

        let inputs = spendable
            .into_iter()
            .map(|utxo| TxInput {
                txid: utxo.txid,
                vout: utxo.vout,
                spender: from.clone(),
            })
            .collect();

        let mut outputs = vec![TxOutput {
            value: amount,
            recipient: to.clone(),
        }];
        if accumulated > amount {
            outputs.push(TxOutput {
                value: accumulated - amount,
                recipient: from.clone(),
            });
        }

        Ok(Transaction::with_id(inputs, outputs, String::new())?)
    }

    /// Checks if the transaction is a coinbase transaction
    pub fn is_coinbase(&self) -> bool {
        self.inputs.is_empty()
    }

    /// Hashes the serialized inputs, outputs and memo
    pub fn compute_id(&self) -> Result<Vec<u8>, TransactionError> {
        let contents = TransactionContents {
            inputs: &self.inputs,
            outputs: &self.outputs,
            memo: &self.memo,
        };
        let encoded = bincode::serialize(&contents)
            .map_err(|e| TransactionError::SerializationError(e.to_string()))?;

        Ok(Sha256::digest(encoded).to_vec())
    }

    /// Sum of all output values, `None` on overflow
    pub fn output_total(&self) -> Option<u64> {
        self.outputs
            .iter()
            .try_fold(0u64, |total, output| total.checked_add(output.value))
    }

    /// Transaction id as a hexadecimal string
    pub fn id_hex(&self) -> String {
        hex::encode(&self.id)
    }
}
