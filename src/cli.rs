use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use serde::Serialize;

use crate::blockchain::config::{DEFAULT_DATA_DIR, DEFAULT_DIFFICULTY};
use crate::blockchain::{
    Address, Block, Blockchain, BlockchainError, ChainConfig, Transaction,
};

#[derive(Parser, Debug)]
#[command(name = "unchained", version)]
#[command(about = "Proof-of-work blockchain with a UTXO ledger")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Directory holding the chain database
    #[arg(long, global = true, env = "UNCHAINED_DATA_DIR", default_value = DEFAULT_DATA_DIR)]
    pub data_dir: PathBuf,

    /// Leading zero bits required in block hashes of a new chain
    #[arg(long, global = true, default_value_t = DEFAULT_DIFFICULTY)]
    pub difficulty: u32,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// Create a blockchain and send the genesis reward to ADDRESS
    #[command(name = "createblockchain")]
    CreateBlockchain {
        #[arg(long)]
        address: String,
    },
    /// Get the balance of ADDRESS
    #[command(name = "getbalance")]
    GetBalance {
        #[arg(long)]
        address: String,
    },
    /// Send AMOUNT of coins from FROM to TO
    Send {
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
        #[arg(long)]
        amount: u64,
    },
    /// Add a data block, creating a data-mode chain if none exists
    #[command(name = "addblock")]
    AddBlock {
        #[arg(long)]
        data: String,
    },
    /// Print all blocks of the chain (newest to oldest)
    #[command(name = "printchain")]
    PrintChain {
        /// Print blocks as JSON
        #[arg(long)]
        json: bool,
    },
    /// Check links and proof of work of every block
    Verify,
}

impl Cli {
    fn config(&self) -> ChainConfig {
        ChainConfig::with_data_dir(&self.data_dir).difficulty(self.difficulty)
    }
}

/// Printable form of a transaction
#[derive(Debug, Serialize)]
pub struct TransactionView {
    pub id: String,
    pub coinbase: bool,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
}

impl From<&Transaction> for TransactionView {
    fn from(tx: &Transaction) -> Self {
        TransactionView {
            id: tx.id_hex(),
            coinbase: tx.is_coinbase(),
            inputs: tx
                .inputs
                .iter()
                .map(|input| format!("{}:{} by {}", hex::encode(&input.txid), input.vout, input.spender))
                .collect(),
            outputs: tx
                .outputs
                .iter()
                .map(|output| format!("{} to {}", output.value, output.recipient))
                .collect(),
        }
    }
}

/// Printable form of a block
#[derive(Debug, Serialize)]
pub struct BlockView {
    pub prev_hash: String,
    pub hash: String,
    pub timestamp: String,
    pub nonce: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub transactions: Vec<TransactionView>,
    pub pow: bool,
}

impl BlockView {
    /// Builds the view of `block`, checking its proof of work against `chain`
    pub fn new(block: &Block, chain: &Blockchain) -> Self {
        BlockView {
            prev_hash: hex::encode(&block.prev_hash),
            hash: block.hash_hex(),
            timestamp: block
                .created_at()
                .map(|time| time.to_rfc3339())
                .unwrap_or_else(|| block.timestamp.to_string()),
            nonce: block.nonce,
            data: block.data().map(|data| String::from_utf8_lossy(data).into_owned()),
            transactions: block.transactions().iter().map(TransactionView::from).collect(),
            pow: chain.check_pow(block),
        }
    }
}

/// Renders a block the way `printchain` shows it
pub fn render_block(view: &BlockView) -> String {
    let mut out = format!("Prev. hash: {}\n", view.prev_hash);
    if let Some(data) = &view.data {
        out.push_str(&format!("Data: {}\n", data));
    }
    for tx in &view.transactions {
        let kind = if tx.coinbase { " (coinbase)" } else { "" };
        out.push_str(&format!("Transaction {}{}\n", tx.id, kind));
        for input in &tx.inputs {
            out.push_str(&format!("  in:  {}\n", input));
        }
        for output in &tx.outputs {
            out.push_str(&format!("  out: {}\n", output));
        }
    }
    out.push_str(&format!("Hash: {}\n", view.hash));
    out.push_str(&format!("Time: {}\n", view.timestamp));
    out.push_str(&format!("PoW: {}\n", view.pow));
    out
}

/// Executes one command against the chain in `cli.data_dir`
pub fn run(cli: Cli) -> Result<()> {
    let config = cli.config();

    match cli.command {
        Command::CreateBlockchain { address } => {
            let address: Address = address.parse()?;
            let chain = Blockchain::create(config, Some(&address)).context("failed to create blockchain")?;
            chain.close()?;
            println!("Done!");
        }
        Command::GetBalance { address } => {
            let address: Address = address.parse()?;
            let chain = Blockchain::open(config, Some(&address))?;
            let balance = chain.get_balance(&address)?;
            chain.close()?;
            println!("Balance of '{}': {}", address, balance);
        }
        Command::Send { from, to, amount } => {
            let from: Address = from.parse()?;
            let to: Address = to.parse()?;
            let chain = Blockchain::open(config, None)?;
            let tx = Transaction::new_utxo(&from, &to, amount, &chain)
                .with_context(|| format!("failed to send {} from {} to {}", amount, from, to))?;
            chain.mine_block(vec![tx])?;
            chain.close()?;
            println!("Success!");
        }
        Command::AddBlock { data } => {
            let chain = match Blockchain::open(config.clone(), None) {
                Ok(chain) => chain,
                Err(BlockchainError::NotFound) => {
                    info!("No existing blockchain found, creating a data-mode chain");
                    Blockchain::create(config, None)?
                }
                Err(err) => return Err(err.into()),
            };
            chain.add_block(data.as_bytes())?;
            chain.close()?;
            println!("Success!");
        }
        Command::PrintChain { json } => {
            let chain = Blockchain::open(config, None)?;
            let mut views = Vec::new();
            for block in chain.iter() {
                views.push(BlockView::new(&block?, &chain));
            }
            chain.close()?;

            if json {
                println!("{}", serde_json::to_string_pretty(&views)?);
            } else {
                for view in &views {
                    println!("{}", render_block(view));
                }
            }
        }
        Command::Verify => {
            let chain = Blockchain::open(config, None)?;
            let count = chain.verify()?;
            chain.close()?;
            println!("Chain is valid: {} blocks", count);
        }
    }

    Ok(())
}
