//! Row types for the Postgres store
//!
//! Amounts are stored as NUMERIC(78,0) and travel as text: inserts cast with
//! `$n::NUMERIC`, selects read `amount::TEXT`.

use eyre::{eyre, Result, WrapErr};
use sqlx::types::Json;
use sqlx::FromRow;

use crate::types::{Asset, LocalBlockHeader, PendingBridgeTx};

#[derive(Debug, Clone, FromRow)]
pub struct PendingTxRow {
    pub external_tx_hash: String,
    pub home_tx_hash: Option<String>,
    pub kind: String,
    pub block_height: Option<i64>,
    pub block_hash: Option<String>,
    pub tx_time: i64,
    pub amount: String,
    pub asset_contract: Option<String>,
    pub asset_decimals: i16,
    pub from_address: String,
    pub to_address: String,
    pub memo_address: Option<String>,
    pub status: String,
    pub validated: bool,
    pub marked_deleted: bool,
    pub deletion_height: i64,
    pub skip_rounds: i32,
    pub error_count: i32,
    pub validation_attempts: i32,
    pub signers: Json<Vec<String>>,
}

impl TryFrom<PendingTxRow> for PendingBridgeTx {
    type Error = eyre::Report;

    fn try_from(row: PendingTxRow) -> Result<Self> {
        let decimals = u8::try_from(row.asset_decimals)
            .wrap_err_with(|| format!("invalid decimals for {}", row.external_tx_hash))?;
        Ok(PendingBridgeTx {
            kind: row.kind.parse().map_err(|e: String| eyre!(e))?,
            status: row.status.parse().map_err(|e: String| eyre!(e))?,
            amount: row
                .amount
                .parse()
                .wrap_err_with(|| format!("invalid amount for {}", row.external_tx_hash))?,
            asset: Asset::from_parts(row.asset_contract, decimals),
            home_tx_hash: row.home_tx_hash,
            block_height: row.block_height.map(|h| h as u64),
            block_hash: row.block_hash,
            tx_time: row.tx_time as u64,
            from: row.from_address,
            to: row.to_address,
            memo_address: row.memo_address,
            validated: row.validated,
            marked_deleted: row.marked_deleted,
            deletion_height: row.deletion_height as u64,
            skip_rounds: row.skip_rounds as u32,
            error_count: row.error_count as u32,
            validation_attempts: row.validation_attempts as u32,
            signers: row.signers.0,
            external_tx_hash: row.external_tx_hash,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct HeaderRow {
    pub height: i64,
    pub hash: String,
    pub parent_hash: String,
}

impl From<HeaderRow> for LocalBlockHeader {
    fn from(row: HeaderRow) -> Self {
        LocalBlockHeader {
            height: row.height as u64,
            hash: row.hash,
            parent_hash: row.parent_hash,
        }
    }
}
