use serde::{Deserialize, Serialize};

use std::fmt;
use std::str::FromStr;

use super::transaction::TransactionError;

/// Identifies the owner of a transaction output
///
/// Ownership is a plain identity claim: an output locked to an address can be
/// spent by an input that names the same address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address(pub String);

impl Address {
    /// Creates an address from any string-like value
    pub fn new<S: Into<String>>(value: S) -> Self {
        Address(value.into())
    }

    /// Returns the address as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Address {
    type Err = TransactionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(TransactionError::InvalidAddress(
                "address must not be empty".to_string(),
            ));
        }

        Ok(Address(trimmed.to_string()))
    }
}

impl From<&str> for Address {
    fn from(value: &str) -> Self {
        Address(value.to_string())
    }
}
