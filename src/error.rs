//! Error taxonomy for the bridge engine
//!
//! Adapter and home-ledger failures are kept apart from engine decisions so
//! the confirmation state machine can tell "retry next tick" from
//! "purge permanently".

use thiserror::Error;

/// Failures reported by an external chain adapter
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChainError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("rpc error: {0}")]
    Rpc(String),
    #[error("decode error: {0}")]
    Decode(String),
    /// The chain rejected a broadcast outright
    #[error("broadcast rejected: {0}")]
    Rejected(String),
}

/// Home-ledger callback failures
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CallbackError {
    /// The home ledger already holds this event; callers treat it as success
    #[error("duplicate: {0}")]
    Duplicate(String),
    #[error("{0}")]
    Other(String),
}

impl CallbackError {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, CallbackError::Duplicate(_))
    }
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("transient adapter error: {0}")]
    Transient(#[from] ChainError),
    #[error("home ledger error: {0}")]
    Home(#[from] CallbackError),
    #[error("classification rejected: {0}")]
    Classification(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("insufficient signatures: have {have}, need {need}")]
    SignatureInsufficient { have: usize, need: usize },
    #[error("resend limit reached for {home_tx_hash} after {attempts} attempts")]
    ResendExhausted { home_tx_hash: String, attempts: u32 },
    #[error("payload error: {0}")]
    Payload(String),
    #[error("insufficient funds: need {needed}, available {available}")]
    InsufficientFunds { needed: u64, available: u64 },
    #[error("store error: {0}")]
    Store(String),
    #[error("configuration error: {0}")]
    Config(String),
}

impl From<eyre::Report> for BridgeError {
    fn from(report: eyre::Report) -> Self {
        BridgeError::Store(format!("{:#}", report))
    }
}

pub type BridgeResult<T> = Result<T, BridgeError>;
