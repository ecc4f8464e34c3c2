//! A persisted, hash-linked block chain with proof-of-work admission and a
//! UTXO ledger, plus the command front end that drives it.

pub mod blockchain;
pub mod cli;
