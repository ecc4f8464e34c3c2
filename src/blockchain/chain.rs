use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use log::{debug, info, warn};
use thiserror::Error;

use super::address::Address;
use super::block::{Block, Payload};
use super::config::ChainConfig;
use super::iterator::ChainIterator;
use super::proof_of_work::ProofOfWork;
use super::storage::{BlockchainStorage, StorageError};
use super::transaction::{Transaction, TransactionError, TxOutput};

/// Memo of the coinbase transaction in a reward genesis block
const GENESIS_COINBASE_DATA: &str =
    "The Times 03/Jan/2009 Chancellor on brink of second bailout for banks";

/// Payload of a data-mode genesis block
const GENESIS_BLOCK_DATA: &[u8] = b"Genesis Block";

/// Errors that can occur during blockchain operations
#[derive(Debug, Error)]
pub enum BlockchainError {
    #[error("Blockchain already exists")]
    AlreadyExists,

    #[error("No existing blockchain found, create one first")]
    NotFound,

    #[error("Invalid transaction: {0}")]
    InvalidTransaction(String),

    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: u64, available: u64 },

    #[error("Iterator exhausted: genesis block already returned")]
    IteratorExhausted,

    #[error("Transaction not found: {0}")]
    TransactionNotFound(String),

    #[error("Invalid block: {0}")]
    InvalidBlock(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Mining cancelled")]
    MiningCancelled,

    #[error("Transaction error: {0}")]
    TransactionError(#[from] TransactionError),

    #[error("Storage error: {0}")]
    StorageError(#[from] StorageError),
}

/// An unspent transaction output and where it lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utxo {
    /// Id of the transaction that created the output
    pub txid: Vec<u8>,

    /// Index of the output in that transaction
    pub vout: u32,

    pub output: TxOutput,
}

impl Utxo {
    pub fn value(&self) -> u64 {
        self.output.value
    }
}

/// Result of one tip-to-genesis pass over the transactions
struct LedgerScan {
    /// Unspent outputs, newest block first
    utxos: Vec<Utxo>,

    /// Ids of every transaction on chain
    txids: HashSet<Vec<u8>>,
}

/// The persisted, hash-linked chain of blocks
///
/// The tip hash is cached behind a mutex. Mining runs without holding it;
/// only the commit of a mined block (write block, then move the tip) does.
#[derive(Debug)]
pub struct Blockchain {
    storage: BlockchainStorage,

    /// Hash of the most recently committed block
    tip: Mutex<Vec<u8>>,

    config: ChainConfig,
}

impl Blockchain {
    /// Creates a new chain and mines its genesis block
    ///
    /// With an address the genesis block holds a coinbase transaction paying
    /// the configured reward to it; without one it holds the fixed
    /// `"Genesis Block"` data. The configured difficulty is recorded and
    /// binds every later block of the chain.
    ///
    /// # Arguments
    ///
    /// * `config` - Storage location and chain parameters
    /// * `address` - Recipient of the genesis reward, if any
    ///
    /// # Returns
    ///
    /// The new Blockchain, or [`BlockchainError::AlreadyExists`] when the
    /// data directory already holds a chain
    pub fn create(config: ChainConfig, address: Option<&Address>) -> Result<Self, BlockchainError> {
        config.validate()?;

        let storage = BlockchainStorage::open(&config.data_dir)?;
        if storage.tip()?.is_some() {
            return Err(BlockchainError::AlreadyExists);
        }

        let payload = match address {
            Some(address) => Payload::Transactions(vec![Transaction::new_coinbase(
                address,
                config.genesis_reward,
                GENESIS_COINBASE_DATA,
            )?]),
            None => Payload::Data(GENESIS_BLOCK_DATA.to_vec()),
        };

        let mut genesis = Block::unmined(payload, Vec::new(), 0, config.difficulty);
        let (nonce, hash) = ProofOfWork::new(&genesis).run().ok_or_else(|| {
            BlockchainError::InvalidBlock(format!(
                "no nonce satisfies {} target bits for the genesis block",
                config.difficulty
            ))
        })?;
        genesis.nonce = nonce;
        genesis.hash = hash;

        // The tip is written last; it marks the chain as existing.
        storage.put_block(&genesis)?;
        storage.set_difficulty(config.difficulty)?;
        storage.set_tip(&genesis.hash)?;

        info!(
            "Created blockchain at {} with genesis block {}",
            config.data_dir.display(),
            genesis.hash_hex()
        );

        Ok(Blockchain {
            storage,
            tip: Mutex::new(genesis.hash),
            config,
        })
    }

    /// Opens an existing chain
    ///
    /// The difficulty recorded at creation wins over `config.difficulty`.
    ///
    /// # Arguments
    ///
    /// * `config` - Storage location and chain parameters
    /// * `address` - Accepted for call-site compatibility; has no effect
    ///
    /// # Returns
    ///
    /// The opened Blockchain, or [`BlockchainError::NotFound`] when no chain
    /// was created
    pub fn open(mut config: ChainConfig, address: Option<&Address>) -> Result<Self, BlockchainError> {
        config.validate()?;

        if !config.data_dir.exists() {
            return Err(BlockchainError::NotFound);
        }

        let storage = BlockchainStorage::open(&config.data_dir)?;
        let tip = storage.tip()?.ok_or(BlockchainError::NotFound)?;

        let difficulty = storage.difficulty()?.ok_or_else(|| {
            BlockchainError::InvalidBlock("chain has no recorded difficulty".to_string())
        })?;
        if difficulty != config.difficulty {
            warn!(
                "Ignoring requested difficulty {}, chain was created with {}",
                config.difficulty, difficulty
            );
            config.difficulty = difficulty;
        }
        config.validate()?;

        if let Some(address) = address {
            debug!("Ignoring address {} when opening the chain", address);
        }
        info!(
            "Opened blockchain at {} with tip {}",
            config.data_dir.display(),
            hex::encode(&tip)
        );

        Ok(Blockchain {
            storage,
            tip: Mutex::new(tip),
            config,
        })
    }

    /// The configuration in effect, with the chain's recorded difficulty
    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    fn lock_tip(&self) -> MutexGuard<'_, Vec<u8>> {
        // The tip is only replaced after a complete commit, so a poisoned
        // guard still holds a valid hash.
        self.tip.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Hash of the current tip
    pub fn tip_hash(&self) -> Vec<u8> {
        self.lock_tip().clone()
    }

    /// Returns a cursor positioned at the current tip
    ///
    /// # Returns
    ///
    /// A ChainIterator yielding blocks from the tip back to genesis
    pub fn iter(&self) -> ChainIterator<'_> {
        ChainIterator::new(&self.storage, self.tip_hash())
    }

    /// Mines a data block on top of the tip
    ///
    /// # Arguments
    ///
    /// * `data` - The raw payload of the block
    ///
    /// # Returns
    ///
    /// The committed block
    pub fn add_block(&self, data: &[u8]) -> Result<Block, BlockchainError> {
        let never = AtomicBool::new(false);
        let payload = Payload::Data(data.to_vec());
        self.append(|_| Ok(payload.clone()), &never)
    }

    /// Validates `transactions` and mines them into a new block
    ///
    /// # Arguments
    ///
    /// * `transactions` - The transactions to include, in order
    ///
    /// # Returns
    ///
    /// The committed block, or [`BlockchainError::InvalidTransaction`] if a
    /// transaction spends an output that is spent, unknown or not owned
    pub fn mine_block(&self, transactions: Vec<Transaction>) -> Result<Block, BlockchainError> {
        let never = AtomicBool::new(false);
        self.mine_block_cancellable(transactions, &never)
    }

    /// Like [`Blockchain::mine_block`], but aborts when `cancel` is set
    ///
    /// A cancelled search returns [`BlockchainError::MiningCancelled`] and
    /// leaves the chain untouched.
    pub fn mine_block_cancellable(
        &self,
        transactions: Vec<Transaction>,
        cancel: &AtomicBool,
    ) -> Result<Block, BlockchainError> {
        self.append(
            |tip| {
                self.validate_transactions(&transactions, tip)?;
                Ok(Payload::Transactions(transactions.clone()))
            },
            cancel,
        )
    }

    /// Builds, mines and commits a block on top of the tip
    ///
    /// `build` produces the payload for a given tip snapshot. If another
    /// block is committed while mining, the payload is rebuilt against the
    /// new tip and mined again.
    fn append<F>(&self, build: F, cancel: &AtomicBool) -> Result<Block, BlockchainError>
    where
        F: Fn(&[u8]) -> Result<Payload, BlockchainError>,
    {
        loop {
            let prev_hash = self.tip_hash();
            let prev = self.storage.get_block(&prev_hash)?;
            let payload = build(&prev_hash)?;

            let mut block = Block::unmined(payload, prev_hash, prev.timestamp, self.config.difficulty);
            let (nonce, hash) = match ProofOfWork::new(&block).run_cancellable(cancel) {
                Some(found) => found,
                None if cancel.load(Ordering::Relaxed) => return Err(BlockchainError::MiningCancelled),
                None => {
                    return Err(BlockchainError::InvalidBlock(format!(
                        "no nonce satisfies {} target bits",
                        block.target_bits
                    )))
                }
            };
            block.nonce = nonce;
            block.hash = hash;

            let mut tip = self.lock_tip();
            if *tip != block.prev_hash {
                warn!(
                    "Tip moved to {} while mining, rebuilding block",
                    hex::encode(&*tip)
                );
                continue;
            }

            self.storage.put_block(&block)?;
            self.storage.set_tip(&block.hash)?;
            *tip = block.hash.clone();

            info!(
                "Mined block {} (nonce {}, {} transactions)",
                block.hash_hex(),
                block.nonce,
                block.transactions().len()
            );

            return Ok(block);
        }
    }

    /// Checks transactions against the unspent outputs at `tip`
    ///
    /// Inputs may only spend outputs already on chain, so transactions in the
    /// same block cannot spend each other's outputs.
    fn validate_transactions(&self, transactions: &[Transaction], tip: &[u8]) -> Result<(), BlockchainError> {
        let scan = self.scan(tip)?;
        let unspent: HashMap<(Vec<u8>, u32), &TxOutput> = scan
            .utxos
            .iter()
            .map(|utxo| ((utxo.txid.clone(), utxo.vout), &utxo.output))
            .collect();

        let mut seen_ids = scan.txids.clone();
        let mut spent_in_block: HashSet<(Vec<u8>, u32)> = HashSet::new();

        for transaction in transactions {
            let id = transaction.id_hex();

            if transaction.compute_id()? != transaction.id {
                return Err(BlockchainError::InvalidTransaction(format!(
                    "{} does not match its contents",
                    id
                )));
            }
            if !seen_ids.insert(transaction.id.clone()) {
                return Err(BlockchainError::InvalidTransaction(format!(
                    "{} is already on chain",
                    id
                )));
            }
            if transaction.outputs.is_empty() || transaction.outputs.iter().any(|o| o.value == 0) {
                return Err(BlockchainError::InvalidTransaction(format!(
                    "{} has an empty or zero-value output",
                    id
                )));
            }
            let output_total = transaction.output_total().ok_or_else(|| {
                BlockchainError::InvalidTransaction(format!("{} output total overflows", id))
            })?;

            if transaction.is_coinbase() {
                continue;
            }

            let mut input_total: u64 = 0;
            for input in &transaction.inputs {
                let outpoint = (input.txid.clone(), input.vout);
                let output = unspent.get(&outpoint).ok_or_else(|| {
                    BlockchainError::InvalidTransaction(format!(
                        "{} spends {}:{} which is spent or unknown",
                        id,
                        hex::encode(&input.txid),
                        input.vout
                    ))
                })?;

                if !output.is_locked_with(&input.spender) {
                    return Err(BlockchainError::InvalidTransaction(format!(
                        "{} spends {}:{} which {} does not own",
                        id,
                        hex::encode(&input.txid),
                        input.vout,
                        input.spender
                    )));
                }
                if !spent_in_block.insert(outpoint) {
                    return Err(BlockchainError::InvalidTransaction(format!(
                        "{} spends {}:{} twice in one block",
                        id,
                        hex::encode(&input.txid),
                        input.vout
                    )));
                }

                input_total = input_total.checked_add(output.value).ok_or_else(|| {
                    BlockchainError::InvalidTransaction(format!("{} input total overflows", id))
                })?;
            }

            if input_total != output_total {
                return Err(BlockchainError::InvalidTransaction(format!(
                    "{} spends {} but pays out {}",
                    id, input_total, output_total
                )));
            }
        }

        Ok(())
    }

    /// Walks from `tip` to genesis collecting unspent outputs and tx ids
    fn scan(&self, tip: &[u8]) -> Result<LedgerScan, BlockchainError> {
        let mut spent: HashSet<(Vec<u8>, u32)> = HashSet::new();
        let mut utxos = Vec::new();
        let mut txids = HashSet::new();

        for block in ChainIterator::new(&self.storage, tip.to_vec()) {
            let block = block?;

            // Record the block's spends first so that outputs consumed later
            // in the same block are not reported as unspent.
            for transaction in block.transactions() {
                for input in &transaction.inputs {
                    spent.insert((input.txid.clone(), input.vout));
                }
            }

            for transaction in block.transactions() {
                txids.insert(transaction.id.clone());

                for (vout, output) in transaction.outputs.iter().enumerate() {
                    let vout = vout as u32;
                    if spent.contains(&(transaction.id.clone(), vout)) {
                        continue;
                    }
                    utxos.push(Utxo {
                        txid: transaction.id.clone(),
                        vout,
                        output: output.clone(),
                    });
                }
            }
        }

        Ok(LedgerScan { utxos, txids })
    }

    /// Unspent outputs owned by `address`, newest block first
    ///
    /// # Arguments
    ///
    /// * `address` - The owner to collect outputs for
    ///
    /// # Returns
    ///
    /// Every unspent output locked to `address`
    pub fn find_utxos(&self, address: &Address) -> Result<Vec<Utxo>, BlockchainError> {
        let scan = self.scan(&self.tip_hash())?;

        Ok(scan
            .utxos
            .into_iter()
            .filter(|utxo| utxo.output.is_locked_with(address))
            .collect())
    }

    /// Picks unspent outputs of `address` until they cover `amount`
    ///
    /// # Arguments
    ///
    /// * `address` - The owner of the outputs
    /// * `amount` - The value to cover
    ///
    /// # Returns
    ///
    /// The accumulated value and the chosen outputs. The total is below
    /// `amount` when the address cannot afford it.
    pub fn find_spendable_outputs(
        &self,
        address: &Address,
        amount: u64,
    ) -> Result<(u64, Vec<Utxo>), BlockchainError> {
        let mut accumulated: u64 = 0;
        let mut chosen = Vec::new();

        for utxo in self.find_utxos(address)? {
            if accumulated >= amount {
                break;
            }
            accumulated = accumulated.saturating_add(utxo.value());
            chosen.push(utxo);
        }

        Ok((accumulated, chosen))
    }

    /// Sum of the unspent outputs owned by `address`
    ///
    /// # Arguments
    ///
    /// * `address` - The owner to total
    ///
    /// # Returns
    ///
    /// The balance, 0 for an unknown address
    pub fn get_balance(&self, address: &Address) -> Result<u64, BlockchainError> {
        Ok(self
            .find_utxos(address)?
            .iter()
            .fold(0u64, |total, utxo| total.saturating_add(utxo.value())))
    }

    /// Looks up a transaction by id
    ///
    /// # Arguments
    ///
    /// * `id` - The transaction id
    ///
    /// # Returns
    ///
    /// The transaction, or [`BlockchainError::TransactionNotFound`]
    pub fn find_transaction(&self, id: &[u8]) -> Result<Transaction, BlockchainError> {
        for block in self.iter() {
            let block = block?;
            if let Some(transaction) = block.transactions().iter().find(|tx| tx.id == id) {
                return Ok(transaction.clone());
            }
        }

        Err(BlockchainError::TransactionNotFound(hex::encode(id)))
    }

    /// Returns true if `block` was mined at this chain's difficulty and its
    /// proof of work holds
    ///
    /// # Arguments
    ///
    /// * `block` - The block to check
    pub fn check_pow(&self, block: &Block) -> bool {
        block.target_bits == self.config.difficulty && ProofOfWork::new(block).validate()
    }

    /// Audits the chain from tip to genesis
    ///
    /// Checks that every block is stored under its own hash, carries a valid
    /// proof of work at the chain difficulty, has consistent transaction ids,
    /// and is not older than its predecessor.
    ///
    /// # Returns
    ///
    /// The number of blocks, or [`BlockchainError::InvalidBlock`] naming the
    /// first bad block
    pub fn verify(&self) -> Result<usize, BlockchainError> {
        let mut expected_hash = self.tip_hash();
        let mut newer_timestamp = i64::MAX;
        let mut count = 0;

        for block in self.iter() {
            let block = block?;
            let hash = block.hash_hex();

            if block.hash != expected_hash {
                return Err(BlockchainError::InvalidBlock(format!(
                    "{} is stored under {}",
                    hash,
                    hex::encode(&expected_hash)
                )));
            }
            if block.target_bits != self.config.difficulty {
                return Err(BlockchainError::InvalidBlock(format!(
                    "{} was mined at {} bits, chain difficulty is {}",
                    hash, block.target_bits, self.config.difficulty
                )));
            }
            if !ProofOfWork::new(&block).validate() {
                return Err(BlockchainError::InvalidBlock(format!(
                    "{} fails proof of work",
                    hash
                )));
            }
            if block.timestamp > newer_timestamp {
                return Err(BlockchainError::InvalidBlock(format!(
                    "{} is newer than its successor",
                    hash
                )));
            }
            for transaction in block.transactions() {
                if transaction.compute_id()? != transaction.id {
                    return Err(BlockchainError::InvalidBlock(format!(
                        "{} holds tampered transaction {}",
                        hash,
                        transaction.id_hex()
                    )));
                }
            }

            newer_timestamp = block.timestamp;
            expected_hash = block.prev_hash.clone();
            count += 1;
        }

        Ok(count)
    }

    /// Returns true if [`Blockchain::verify`] passes
    pub fn is_valid(&self) -> bool {
        match self.verify() {
            Ok(_) => true,
            Err(err) => {
                warn!("Chain validation failed: {}", err);
                false
            }
        }
    }

    /// Flushes and releases the storage handle
    ///
    /// # Returns
    ///
    /// Ok(()) once all writes are on disk
    pub fn close(self) -> Result<(), BlockchainError> {
        self.storage.flush()?;
        Ok(())
    }
}

impl Drop for Blockchain {
    fn drop(&mut self) {
        if let Err(err) = self.storage.flush() {
            warn!("Failed to flush blockchain storage: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::transaction::TxInput;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> ChainConfig {
        ChainConfig::with_data_dir(dir.path().join("chain")).difficulty(8)
    }

    fn funded_chain(dir: &TempDir) -> Blockchain {
        Blockchain::create(test_config(dir), Some(&Address::from("A"))).unwrap()
    }

    fn send(chain: &Blockchain, from: &str, to: &str, amount: u64) -> Result<Block, BlockchainError> {
        let tx = Transaction::new_utxo(&Address::from(from), &Address::from(to), amount, chain)?;
        chain.mine_block(vec![tx])
    }

    fn balance(chain: &Blockchain, address: &str) -> u64 {
        chain.get_balance(&Address::from(address)).unwrap()
    }

    #[test]
    fn test_genesis_reward() {
        let dir = TempDir::new().unwrap();
        let chain = funded_chain(&dir);

        assert_eq!(balance(&chain, "A"), 10);
        assert_eq!(balance(&chain, "B"), 0);

        let genesis = chain.iter().next_block().unwrap();
        assert!(genesis.is_genesis());
        assert_eq!(genesis.transactions().len(), 1);
        assert!(genesis.transactions()[0].is_coinbase());
        assert_eq!(genesis.hash, chain.tip_hash());
    }

    #[test]
    fn test_send_and_insufficient_funds() {
        let dir = TempDir::new().unwrap();
        let chain = funded_chain(&dir);

        send(&chain, "A", "B", 4).unwrap();
        assert_eq!(balance(&chain, "A"), 6);
        assert_eq!(balance(&chain, "B"), 4);

        let tip_before = chain.tip_hash();
        let result = send(&chain, "A", "B", 100);
        assert!(matches!(
            result,
            Err(BlockchainError::InsufficientFunds { required: 100, available: 6 })
        ));
        assert_eq!(chain.tip_hash(), tip_before);
        assert_eq!(balance(&chain, "A"), 6);
        assert_eq!(balance(&chain, "B"), 4);
    }

    #[test]
    fn test_balance_matches_utxos() {
        let dir = TempDir::new().unwrap();
        let chain = funded_chain(&dir);

        send(&chain, "A", "B", 3).unwrap();
        send(&chain, "A", "C", 2).unwrap();
        send(&chain, "B", "C", 3).unwrap();

        for address in ["A", "B", "C"] {
            let utxos = chain.find_utxos(&Address::from(address)).unwrap();
            let sum: u64 = utxos.iter().map(Utxo::value).sum();
            assert_eq!(sum, balance(&chain, address));
        }
        assert_eq!(balance(&chain, "A"), 5);
        assert_eq!(balance(&chain, "B"), 0);
        assert_eq!(balance(&chain, "C"), 5);
    }

    #[test]
    fn test_utxos_newest_first() {
        let dir = TempDir::new().unwrap();
        let chain = funded_chain(&dir);

        send(&chain, "A", "B", 1).unwrap();
        let latest = send(&chain, "A", "B", 2).unwrap();

        let utxos = chain.find_utxos(&Address::from("B")).unwrap();
        assert_eq!(utxos.len(), 2);
        assert_eq!(utxos[0].txid, latest.transactions()[0].id);
        assert_eq!(utxos[0].value(), 2);
        assert_eq!(utxos[1].value(), 1);
    }

    #[test]
    fn test_exact_spend_has_no_change() {
        let dir = TempDir::new().unwrap();
        let chain = funded_chain(&dir);

        let tx = Transaction::new_utxo(&Address::from("A"), &Address::from("B"), 10, &chain).unwrap();
        assert_eq!(tx.inputs.len(), 1);
        assert_eq!(tx.outputs.len(), 1);

        chain.mine_block(vec![tx]).unwrap();
        assert_eq!(balance(&chain, "A"), 0);
        assert_eq!(balance(&chain, "B"), 10);
    }

    #[test]
    fn test_zero_amount_rejected() {
        let dir = TempDir::new().unwrap();
        let chain = funded_chain(&dir);

        let result = Transaction::new_utxo(&Address::from("A"), &Address::from("B"), 0, &chain);
        assert!(matches!(
            result,
            Err(BlockchainError::TransactionError(TransactionError::InvalidAmount(_)))
        ));
    }

    #[test]
    fn test_replayed_transaction_rejected() {
        let dir = TempDir::new().unwrap();
        let chain = funded_chain(&dir);

        let tx = Transaction::new_utxo(&Address::from("A"), &Address::from("B"), 4, &chain).unwrap();
        chain.mine_block(vec![tx.clone()]).unwrap();

        let result = chain.mine_block(vec![tx]);
        assert!(matches!(result, Err(BlockchainError::InvalidTransaction(_))));
        assert_eq!(balance(&chain, "A"), 6);
    }

    #[test]
    fn test_double_spend_in_block_rejected() {
        let dir = TempDir::new().unwrap();
        let chain = funded_chain(&dir);

        let first = Transaction::new_utxo(&Address::from("A"), &Address::from("B"), 4, &chain).unwrap();
        let second = Transaction::new_utxo(&Address::from("A"), &Address::from("C"), 3, &chain).unwrap();

        let result = chain.mine_block(vec![first, second]);
        assert!(matches!(result, Err(BlockchainError::InvalidTransaction(_))));
        assert_eq!(chain.verify().unwrap(), 1);
    }

    #[test]
    fn test_foreign_spender_rejected() {
        let dir = TempDir::new().unwrap();
        let chain = funded_chain(&dir);

        let utxo = chain.find_utxos(&Address::from("A")).unwrap().remove(0);
        let mut theft = Transaction {
            id: Vec::new(),
            inputs: vec![TxInput {
                txid: utxo.txid,
                vout: utxo.vout,
                spender: Address::from("B"),
            }],
            outputs: vec![TxOutput {
                value: 10,
                recipient: Address::from("B"),
            }],
            memo: String::new(),
        };
        theft.id = theft.compute_id().unwrap();

        let result = chain.mine_block(vec![theft]);
        assert!(matches!(result, Err(BlockchainError::InvalidTransaction(_))));
        assert_eq!(balance(&chain, "A"), 10);
    }

    #[test]
    fn test_unbalanced_transaction_rejected() {
        let dir = TempDir::new().unwrap();
        let chain = funded_chain(&dir);

        let mut tx = Transaction::new_utxo(&Address::from("A"), &Address::from("B"), 4, &chain).unwrap();
        tx.outputs[1].value -= 1;
        tx.id = tx.compute_id().unwrap();

        let result = chain.mine_block(vec![tx]);
        assert!(matches!(result, Err(BlockchainError::InvalidTransaction(_))));
    }

    #[test]
    fn test_tampered_id_rejected() {
        let dir = TempDir::new().unwrap();
        let chain = funded_chain(&dir);

        let mut tx = Transaction::new_utxo(&Address::from("A"), &Address::from("B"), 4, &chain).unwrap();
        tx.outputs[0].value = 5;

        let result = chain.mine_block(vec![tx]);
        assert!(matches!(result, Err(BlockchainError::InvalidTransaction(_))));
    }

    #[test]
    fn test_coinbase_in_mined_block() {
        let dir = TempDir::new().unwrap();
        let chain = funded_chain(&dir);

        let reward = Transaction::new_coinbase(&Address::from("miner"), 50, "").unwrap();
        let payment = Transaction::new_utxo(&Address::from("A"), &Address::from("B"), 4, &chain).unwrap();
        chain.mine_block(vec![reward, payment]).unwrap();

        assert_eq!(balance(&chain, "miner"), 50);
        assert_eq!(balance(&chain, "A"), 6);
        assert_eq!(balance(&chain, "B"), 4);
    }

    #[test]
    fn test_printchain_three_blocks() {
        let dir = TempDir::new().unwrap();
        let chain = Blockchain::create(test_config(&dir), None).unwrap();

        chain.add_block(b"Send 1 BTC to Ivan").unwrap();
        chain.add_block(b"Send 2 more BTC to Ivan").unwrap();

        let blocks: Vec<Block> = chain.iter().collect::<Result<_, _>>().unwrap();
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0].data(), Some(&b"Send 2 more BTC to Ivan"[..]));
        assert_eq!(blocks[2].data(), Some(GENESIS_BLOCK_DATA));
        assert!(blocks[2].prev_hash.is_empty());
        assert!(blocks.iter().all(|block| ProofOfWork::new(block).validate()));

        for pair in blocks.windows(2) {
            assert_eq!(pair[0].prev_hash, pair[1].hash);
            assert!(pair[0].timestamp >= pair[1].timestamp);
        }
        assert_eq!(chain.verify().unwrap(), 3);
    }

    #[test]
    fn test_iterator_exhausted() {
        let dir = TempDir::new().unwrap();
        let chain = Blockchain::create(test_config(&dir), None).unwrap();

        let mut iter = chain.iter();
        assert!(iter.has_next());
        assert!(iter.next_block().unwrap().is_genesis());
        assert!(!iter.has_next());
        assert!(matches!(iter.next_block(), Err(BlockchainError::IteratorExhausted)));
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_create_twice_fails() {
        let dir = TempDir::new().unwrap();
        let chain = funded_chain(&dir);
        chain.close().unwrap();

        let result = Blockchain::create(test_config(&dir), Some(&Address::from("B")));
        assert!(matches!(result, Err(BlockchainError::AlreadyExists)));
    }

    #[test]
    fn test_open_missing_chain() {
        let dir = TempDir::new().unwrap();

        let result = Blockchain::open(test_config(&dir), None);
        assert!(matches!(result, Err(BlockchainError::NotFound)));
    }

    #[test]
    fn test_reopen_recovers_chain() {
        let dir = TempDir::new().unwrap();
        let tip = {
            let chain = funded_chain(&dir);
            send(&chain, "A", "B", 4).unwrap();
            let tip = chain.tip_hash();
            chain.close().unwrap();
            tip
        };

        let chain = Blockchain::open(test_config(&dir), Some(&Address::from("ignored"))).unwrap();
        assert_eq!(chain.tip_hash(), tip);
        assert_eq!(chain.verify().unwrap(), 2);
        assert_eq!(balance(&chain, "A"), 6);
        assert_eq!(balance(&chain, "B"), 4);
    }

    #[test]
    fn test_find_transaction() {
        let dir = TempDir::new().unwrap();
        let chain = funded_chain(&dir);
        let block = send(&chain, "A", "B", 4).unwrap();
        let id = block.transactions()[0].id.clone();

        assert_eq!(chain.find_transaction(&id).unwrap().id, id);
        assert!(matches!(
            chain.find_transaction(&[0; 32]),
            Err(BlockchainError::TransactionNotFound(_))
        ));
    }

    #[test]
    fn test_cancelled_mining_leaves_chain_untouched() {
        let dir = TempDir::new().unwrap();
        let chain = funded_chain(&dir);
        let tx = Transaction::new_utxo(&Address::from("A"), &Address::from("B"), 4, &chain).unwrap();

        let cancel = AtomicBool::new(false);
        cancel.store(true, Ordering::Relaxed);

        let result = chain.mine_block_cancellable(vec![tx], &cancel);
        assert!(matches!(result, Err(BlockchainError::MiningCancelled)));
        assert_eq!(chain.verify().unwrap(), 1);
        assert_eq!(balance(&chain, "A"), 10);
    }

    #[test]
    fn test_tampered_block_detected() {
        let dir = TempDir::new().unwrap();
        let chain = Blockchain::create(test_config(&dir), None).unwrap();
        let block = chain.add_block(b"original").unwrap();
        assert!(chain.is_valid());

        let mut forged = block.clone();
        forged.payload = Payload::Data(b"forged".to_vec());
        chain.storage.put_block(&forged).unwrap();

        assert!(matches!(chain.verify(), Err(BlockchainError::InvalidBlock(_))));
        assert!(!chain.is_valid());
    }

    #[test]
    fn test_concurrent_miners_serialize_on_tip() {
        let dir = TempDir::new().unwrap();
        let chain = Blockchain::create(test_config(&dir), None).unwrap();

        std::thread::scope(|scope| {
            for worker in 0..4 {
                let chain = &chain;
                scope.spawn(move || {
                    chain.add_block(format!("block from {}", worker).as_bytes()).unwrap();
                });
            }
        });

        assert_eq!(chain.verify().unwrap(), 5);
    }

    /// Writes `block` and moves the tip to it, bypassing mining and validation
    fn force_tip(chain: &Blockchain, block: &Block) {
        chain.storage.put_block(block).unwrap();
        chain.storage.set_tip(&block.hash).unwrap();
        *chain.lock_tip() = block.hash.clone();
    }

    #[test]
    fn test_zero_bit_block_rejected() {
        let dir = TempDir::new().unwrap();
        let chain = funded_chain(&dir);
        let genesis = chain.iter().next_block().unwrap();

        let reward = Transaction::new_coinbase(&Address::from("M"), 1_000_000, "").unwrap();
        let mut forged = Block::unmined(
            Payload::Transactions(vec![reward]),
            chain.tip_hash(),
            genesis.timestamp,
            0,
        );
        forged.nonce = 0;
        forged.hash = ProofOfWork::new(&forged).digest(0);
        force_tip(&chain, &forged);

        assert!(!ProofOfWork::new(&forged).validate());
        assert!(!chain.check_pow(&forged));
        assert!(matches!(chain.verify(), Err(BlockchainError::InvalidBlock(_))));
        assert!(!chain.is_valid());
    }

    #[test]
    fn test_easier_block_rejected() {
        let dir = TempDir::new().unwrap();
        let chain = funded_chain(&dir);
        let genesis = chain.iter().next_block().unwrap();

        let mut easy = Block::unmined(Payload::Data(b"cheap".to_vec()), chain.tip_hash(), genesis.timestamp, 1);
        let (nonce, hash) = ProofOfWork::new(&easy).run().unwrap();
        easy.nonce = nonce;
        easy.hash = hash;
        force_tip(&chain, &easy);

        assert!(ProofOfWork::new(&easy).validate());
        assert!(!chain.check_pow(&easy));
        assert!(matches!(chain.verify(), Err(BlockchainError::InvalidBlock(_))));
    }

    #[test]
    fn test_reopen_keeps_recorded_difficulty() {
        let dir = TempDir::new().unwrap();
        funded_chain(&dir).close().unwrap();

        let chain = Blockchain::open(test_config(&dir).difficulty(1), None).unwrap();
        assert_eq!(chain.config().difficulty, 8);

        let block = chain.add_block(b"after reopen").unwrap();
        assert_eq!(block.target_bits, 8);
        assert!(chain.check_pow(&block));
        assert_eq!(chain.verify().unwrap(), 2);
    }

    #[test]
    fn test_unreferenced_block_ignored_after_reopen() {
        let dir = TempDir::new().unwrap();
        let tip = {
            let chain = funded_chain(&dir);
            let genesis = chain.iter().next_block().unwrap();

            // Block written, but the tip never moved.
            let mut orphan =
                Block::unmined(Payload::Data(b"orphan".to_vec()), chain.tip_hash(), genesis.timestamp, 8);
            let (nonce, hash) = ProofOfWork::new(&orphan).run().unwrap();
            orphan.nonce = nonce;
            orphan.hash = hash;
            chain.storage.put_block(&orphan).unwrap();

            let tip = chain.tip_hash();
            chain.close().unwrap();
            tip
        };

        let chain = Blockchain::open(test_config(&dir), None).unwrap();
        assert_eq!(chain.tip_hash(), tip);
        assert_eq!(chain.verify().unwrap(), 1);
        assert_eq!(chain.storage.block_count(), 2);
        assert_eq!(balance(&chain, "A"), 10);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir).difficulty(0);

        let result = Blockchain::create(config, None);
        assert!(matches!(result, Err(BlockchainError::InvalidConfig(_))));

        let config = test_config(&dir).difficulty(33);
        let result = Blockchain::create(config, None);
        assert!(matches!(result, Err(BlockchainError::InvalidConfig(_))));
        assert!(matches!(
            Blockchain::open(test_config(&dir), None),
            Err(BlockchainError::NotFound)
        ));
    }
}
