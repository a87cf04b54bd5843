//! Home-ledger callback gateway
//!
//! The home ledger is an external collaborator: it credits deposits, records
//! completed outbound actions, supplies the custodian set and stores the
//! quorum signatures its consensus produced.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::CallbackError;
use crate::types::{decimal_u128, CustodianSet, CustodianSignature, PendingBridgeTx, TxKind};

pub mod http;

pub use http::HttpHomeLedger;

/// Inbound deposit as reported to the home ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositNotice {
    pub chain_id: u16,
    pub external_tx_hash: String,
    pub height: u64,
    pub tx_time: u64,
    pub from: String,
    pub to: String,
    #[serde(with = "decimal_u128")]
    pub amount: u128,
    pub decimals: u8,
    pub asset_contract: Option<String>,
    pub memo_address: String,
}

impl DepositNotice {
    /// `None` while the record has no height or memo
    pub fn from_record(chain_id: u16, record: &PendingBridgeTx) -> Option<Self> {
        Some(Self {
            chain_id,
            external_tx_hash: record.external_tx_hash.clone(),
            height: record.block_height?,
            tx_time: record.tx_time,
            from: record.from.clone(),
            to: record.to.clone(),
            amount: record.amount,
            decimals: record.asset.decimals(),
            asset_contract: record.asset.contract().map(str::to_string),
            memo_address: record.memo_address.clone()?,
        })
    }
}

/// Completed outbound action on the external chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundConfirmation {
    pub chain_id: u16,
    pub kind: TxKind,
    pub home_tx_hash: String,
    pub external_tx_hash: String,
    pub height: u64,
    pub tx_time: u64,
    pub custodian_address: String,
    pub signers: Vec<String>,
}

/// Extra withdrawal fee paid on the external chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeNotice {
    pub chain_id: u16,
    pub external_tx_hash: String,
    pub home_tx_hash: String,
    #[serde(with = "decimal_u128")]
    pub amount: u128,
    pub decimals: u8,
    pub asset_contract: Option<String>,
}

/// Home-ledger view of one of its transactions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HomeTx {
    pub hash: String,
    pub height: u64,
    pub kind: Option<TxKind>,
}

#[async_trait]
pub trait HomeLedger: Send + Sync {
    async fn submit_pending_deposit(&self, notice: &DepositNotice) -> Result<(), CallbackError>;

    /// Returns the home tx hash crediting the deposit
    async fn submit_confirmed_deposit(&self, notice: &DepositNotice)
        -> Result<String, CallbackError>;

    async fn submit_confirmed_outbound(
        &self,
        confirmation: &OutboundConfirmation,
    ) -> Result<(), CallbackError>;

    async fn submit_withdrawal_fee(&self, notice: &FeeNotice) -> Result<(), CallbackError>;

    async fn get_home_tx(&self, home_tx_hash: &str) -> Result<Option<HomeTx>, CallbackError>;

    async fn get_home_tip_height(&self) -> Result<u64, CallbackError>;

    async fn get_current_custodian_set(&self) -> Result<CustodianSet, CallbackError>;

    async fn request_quorum_signatures(
        &self,
        home_tx_hash: &str,
        chain_id: u16,
    ) -> Result<Vec<CustodianSignature>, CallbackError>;
}
