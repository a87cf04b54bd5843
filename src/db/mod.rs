//! Durable bridge state
//!
//! The store is the source of truth on restart. Every write is a single-row
//! statement so a record is never left half-written.

use async_trait::async_trait;
use eyre::{Result, WrapErr};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use tracing::error;

use crate::types::{LocalBlockHeader, PendingBridgeTx};
use crate::writers::session::OutboundSigningSession;

pub mod memory;
pub mod models;

pub use memory::MemoryStore;
pub use models::*;

#[async_trait]
pub trait BridgeStore: Send + Sync {
    /// Insert or replace the record keyed by `(chain, external_tx_hash)`
    async fn save_pending_tx(&self, chain: &str, tx: &PendingBridgeTx) -> Result<()>;

    async fn get_pending_tx(&self, chain: &str, external_tx_hash: &str)
        -> Result<Option<PendingBridgeTx>>;

    async fn find_pending_by_home_hash(
        &self,
        chain: &str,
        home_tx_hash: &str,
    ) -> Result<Vec<PendingBridgeTx>>;

    async fn delete_pending_tx(&self, chain: &str, external_tx_hash: &str) -> Result<()>;

    async fn list_pending_txs(&self, chain: &str) -> Result<Vec<PendingBridgeTx>>;

    async fn latest_header(&self, chain: &str) -> Result<Option<LocalBlockHeader>>;

    async fn get_header(&self, chain: &str, height: u64) -> Result<Option<LocalBlockHeader>>;

    async fn append_header(&self, chain: &str, header: &LocalBlockHeader) -> Result<()>;

    async fn delete_header(&self, chain: &str, height: u64) -> Result<()>;

    /// Drop headers below `min_height`
    async fn prune_headers(&self, chain: &str, min_height: u64) -> Result<()>;

    async fn clear_headers(&self, chain: &str) -> Result<()>;

    async fn count_headers(&self, chain: &str) -> Result<usize>;

    async fn save_session(&self, chain: &str, session: &OutboundSigningSession) -> Result<()>;

    async fn get_session(&self, chain: &str, home_tx_hash: &str)
        -> Result<Option<OutboundSigningSession>>;

    async fn delete_session(&self, chain: &str, home_tx_hash: &str) -> Result<()>;

    async fn list_sessions(&self, chain: &str) -> Result<Vec<OutboundSigningSession>>;

    async fn get_resend_count(&self, chain: &str, home_tx_hash: &str) -> Result<u32>;

    /// Increment and return the new count
    async fn increment_resend_count(&self, chain: &str, home_tx_hash: &str) -> Result<u32>;

    /// Record that the outbound action for `home_tx_hash` is confirmed.
    /// The marker outlives the session and the pending record.
    async fn mark_outbound_completed(
        &self,
        chain: &str,
        home_tx_hash: &str,
        external_tx_hash: &str,
    ) -> Result<()>;

    /// External tx that completed `home_tx_hash`, if any
    async fn get_completed_outbound(&self, chain: &str, home_tx_hash: &str)
        -> Result<Option<String>>;
}

/// Create a database connection pool
pub async fn create_pool(database_url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .wrap_err("Failed to connect to database")
}

/// Run pending migrations (uses the migration files in migrations/)
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .wrap_err("Failed to run database migrations")?;
    Ok(())
}

/// Postgres-backed store
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

const PENDING_COLUMNS: &str = r#"external_tx_hash, home_tx_hash, kind, block_height, block_hash,
    tx_time, amount::TEXT AS amount, asset_contract, asset_decimals, from_address, to_address,
    memo_address, status, validated, marked_deleted, deletion_height, skip_rounds, error_count,
    validation_attempts, signers"#;

fn rows_to_txs(rows: Vec<PendingTxRow>) -> Result<Vec<PendingBridgeTx>> {
    rows.into_iter().map(PendingBridgeTx::try_from).collect()
}

#[async_trait]
impl BridgeStore for PgStore {
    async fn save_pending_tx(&self, chain: &str, tx: &PendingBridgeTx) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO pending_bridge_txs (chain, external_tx_hash, home_tx_hash, kind,
                block_height, block_hash, tx_time, amount, asset_contract, asset_decimals,
                from_address, to_address, memo_address, status, validated, marked_deleted,
                deletion_height, skip_rounds, error_count, validation_attempts, signers)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8::NUMERIC, $9, $10, $11, $12, $13, $14, $15,
                $16, $17, $18, $19, $20, $21)
            ON CONFLICT (chain, external_tx_hash) DO UPDATE SET
                home_tx_hash = EXCLUDED.home_tx_hash,
                kind = EXCLUDED.kind,
                block_height = EXCLUDED.block_height,
                block_hash = EXCLUDED.block_hash,
                tx_time = EXCLUDED.tx_time,
                amount = EXCLUDED.amount,
                asset_contract = EXCLUDED.asset_contract,
                asset_decimals = EXCLUDED.asset_decimals,
                from_address = EXCLUDED.from_address,
                to_address = EXCLUDED.to_address,
                memo_address = EXCLUDED.memo_address,
                status = EXCLUDED.status,
                validated = EXCLUDED.validated,
                marked_deleted = EXCLUDED.marked_deleted,
                deletion_height = EXCLUDED.deletion_height,
                skip_rounds = EXCLUDED.skip_rounds,
                error_count = EXCLUDED.error_count,
                validation_attempts = EXCLUDED.validation_attempts,
                signers = EXCLUDED.signers,
                updated_at = NOW()
            "#,
        )
        .bind(chain)
        .bind(&tx.external_tx_hash)
        .bind(&tx.home_tx_hash)
        .bind(tx.kind.as_str())
        .bind(tx.block_height.map(|h| h as i64))
        .bind(&tx.block_hash)
        .bind(tx.tx_time as i64)
        .bind(tx.amount.to_string())
        .bind(tx.asset.contract())
        .bind(tx.asset.decimals() as i16)
        .bind(&tx.from)
        .bind(&tx.to)
        .bind(&tx.memo_address)
        .bind(tx.status.as_str())
        .bind(tx.validated)
        .bind(tx.marked_deleted)
        .bind(tx.deletion_height as i64)
        .bind(tx.skip_rounds as i32)
        .bind(tx.error_count as i32)
        .bind(tx.validation_attempts as i32)
        .bind(Json(&tx.signers))
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("SQL error saving pending tx: {:?}", e);
            e
        })
        .wrap_err_with(|| format!("Failed to save pending tx {}", tx.external_tx_hash))?;
        Ok(())
    }

    async fn get_pending_tx(
        &self,
        chain: &str,
        external_tx_hash: &str,
    ) -> Result<Option<PendingBridgeTx>> {
        let row = sqlx::query_as::<_, PendingTxRow>(&format!(
            "SELECT {} FROM pending_bridge_txs WHERE chain = $1 AND external_tx_hash = $2",
            PENDING_COLUMNS
        ))
        .bind(chain)
        .bind(external_tx_hash)
        .fetch_optional(&self.pool)
        .await
        .wrap_err("Failed to get pending tx")?;
        row.map(PendingBridgeTx::try_from).transpose()
    }

    async fn find_pending_by_home_hash(
        &self,
        chain: &str,
        home_tx_hash: &str,
    ) -> Result<Vec<PendingBridgeTx>> {
        let rows = sqlx::query_as::<_, PendingTxRow>(&format!(
            "SELECT {} FROM pending_bridge_txs WHERE chain = $1 AND home_tx_hash = $2",
            PENDING_COLUMNS
        ))
        .bind(chain)
        .bind(home_tx_hash)
        .fetch_all(&self.pool)
        .await
        .wrap_err("Failed to find pending txs by home hash")?;
        rows_to_txs(rows)
    }

    async fn delete_pending_tx(&self, chain: &str, external_tx_hash: &str) -> Result<()> {
        sqlx::query("DELETE FROM pending_bridge_txs WHERE chain = $1 AND external_tx_hash = $2")
            .bind(chain)
            .bind(external_tx_hash)
            .execute(&self.pool)
            .await
            .wrap_err("Failed to delete pending tx")?;
        Ok(())
    }

    async fn list_pending_txs(&self, chain: &str) -> Result<Vec<PendingBridgeTx>> {
        let rows = sqlx::query_as::<_, PendingTxRow>(&format!(
            "SELECT {} FROM pending_bridge_txs WHERE chain = $1 ORDER BY created_at ASC",
            PENDING_COLUMNS
        ))
        .bind(chain)
        .fetch_all(&self.pool)
        .await
        .wrap_err("Failed to list pending txs")?;
        rows_to_txs(rows)
    }

    async fn latest_header(&self, chain: &str) -> Result<Option<LocalBlockHeader>> {
        let row = sqlx::query_as::<_, HeaderRow>(
            r#"SELECT height, hash, parent_hash FROM local_block_headers
               WHERE chain = $1 ORDER BY height DESC LIMIT 1"#,
        )
        .bind(chain)
        .fetch_optional(&self.pool)
        .await
        .wrap_err("Failed to get latest header")?;
        Ok(row.map(Into::into))
    }

    async fn get_header(&self, chain: &str, height: u64) -> Result<Option<LocalBlockHeader>> {
        let row = sqlx::query_as::<_, HeaderRow>(
            "SELECT height, hash, parent_hash FROM local_block_headers WHERE chain = $1 AND height = $2",
        )
        .bind(chain)
        .bind(height as i64)
        .fetch_optional(&self.pool)
        .await
        .wrap_err("Failed to get header")?;
        Ok(row.map(Into::into))
    }

    async fn append_header(&self, chain: &str, header: &LocalBlockHeader) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO local_block_headers (chain, height, hash, parent_hash)
               VALUES ($1, $2, $3, $4)
               ON CONFLICT (chain, height) DO UPDATE SET
                   hash = EXCLUDED.hash, parent_hash = EXCLUDED.parent_hash"#,
        )
        .bind(chain)
        .bind(header.height as i64)
        .bind(&header.hash)
        .bind(&header.parent_hash)
        .execute(&self.pool)
        .await
        .wrap_err_with(|| format!("Failed to append header {}", header.height))?;
        Ok(())
    }

    async fn delete_header(&self, chain: &str, height: u64) -> Result<()> {
        sqlx::query("DELETE FROM local_block_headers WHERE chain = $1 AND height = $2")
            .bind(chain)
            .bind(height as i64)
            .execute(&self.pool)
            .await
            .wrap_err("Failed to delete header")?;
        Ok(())
    }

    async fn prune_headers(&self, chain: &str, min_height: u64) -> Result<()> {
        sqlx::query("DELETE FROM local_block_headers WHERE chain = $1 AND height < $2")
            .bind(chain)
            .bind(min_height as i64)
            .execute(&self.pool)
            .await
            .wrap_err("Failed to prune headers")?;
        Ok(())
    }

    async fn clear_headers(&self, chain: &str) -> Result<()> {
        sqlx::query("DELETE FROM local_block_headers WHERE chain = $1")
            .bind(chain)
            .execute(&self.pool)
            .await
            .wrap_err("Failed to clear headers")?;
        Ok(())
    }

    async fn count_headers(&self, chain: &str) -> Result<usize> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM local_block_headers WHERE chain = $1")
                .bind(chain)
                .fetch_one(&self.pool)
                .await
                .wrap_err("Failed to count headers")?;
        Ok(count as usize)
    }

    async fn save_session(&self, chain: &str, session: &OutboundSigningSession) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO signing_sessions (chain, home_tx_hash, body)
               VALUES ($1, $2, $3)
               ON CONFLICT (chain, home_tx_hash) DO UPDATE SET
                   body = EXCLUDED.body, updated_at = NOW()"#,
        )
        .bind(chain)
        .bind(&session.home_tx_hash)
        .bind(Json(session))
        .execute(&self.pool)
        .await
        .wrap_err_with(|| format!("Failed to save signing session {}", session.home_tx_hash))?;
        Ok(())
    }

    async fn get_session(
        &self,
        chain: &str,
        home_tx_hash: &str,
    ) -> Result<Option<OutboundSigningSession>> {
        let row: Option<(Json<OutboundSigningSession>,)> = sqlx::query_as(
            "SELECT body FROM signing_sessions WHERE chain = $1 AND home_tx_hash = $2",
        )
        .bind(chain)
        .bind(home_tx_hash)
        .fetch_optional(&self.pool)
        .await
        .wrap_err("Failed to get signing session")?;
        Ok(row.map(|(body,)| body.0))
    }

    async fn delete_session(&self, chain: &str, home_tx_hash: &str) -> Result<()> {
        sqlx::query("DELETE FROM signing_sessions WHERE chain = $1 AND home_tx_hash = $2")
            .bind(chain)
            .bind(home_tx_hash)
            .execute(&self.pool)
            .await
            .wrap_err("Failed to delete signing session")?;
        Ok(())
    }

    async fn list_sessions(&self, chain: &str) -> Result<Vec<OutboundSigningSession>> {
        let rows: Vec<(Json<OutboundSigningSession>,)> = sqlx::query_as(
            "SELECT body FROM signing_sessions WHERE chain = $1 ORDER BY updated_at ASC",
        )
        .bind(chain)
        .fetch_all(&self.pool)
        .await
        .wrap_err("Failed to list signing sessions")?;
        Ok(rows.into_iter().map(|(body,)| body.0).collect())
    }

    async fn get_resend_count(&self, chain: &str, home_tx_hash: &str) -> Result<u32> {
        let row: Option<(i32,)> = sqlx::query_as(
            "SELECT attempts FROM resend_counters WHERE chain = $1 AND home_tx_hash = $2",
        )
        .bind(chain)
        .bind(home_tx_hash)
        .fetch_optional(&self.pool)
        .await
        .wrap_err("Failed to get resend count")?;
        Ok(row.map(|(n,)| n as u32).unwrap_or(0))
    }

    async fn increment_resend_count(&self, chain: &str, home_tx_hash: &str) -> Result<u32> {
        let (attempts,): (i32,) = sqlx::query_as(
            r#"INSERT INTO resend_counters (chain, home_tx_hash, attempts)
               VALUES ($1, $2, 1)
               ON CONFLICT (chain, home_tx_hash) DO UPDATE SET
                   attempts = resend_counters.attempts + 1, updated_at = NOW()
               RETURNING attempts"#,
        )
        .bind(chain)
        .bind(home_tx_hash)
        .fetch_one(&self.pool)
        .await
        .wrap_err("Failed to increment resend count")?;
        Ok(attempts as u32)
    }

    async fn mark_outbound_completed(
        &self,
        chain: &str,
        home_tx_hash: &str,
        external_tx_hash: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO completed_outbound (chain, home_tx_hash, external_tx_hash)
               VALUES ($1, $2, $3)
               ON CONFLICT (chain, home_tx_hash) DO NOTHING"#,
        )
        .bind(chain)
        .bind(home_tx_hash)
        .bind(external_tx_hash)
        .execute(&self.pool)
        .await
        .wrap_err("Failed to mark outbound completed")?;
        Ok(())
    }

    async fn get_completed_outbound(
        &self,
        chain: &str,
        home_tx_hash: &str,
    ) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT external_tx_hash FROM completed_outbound WHERE chain = $1 AND home_tx_hash = $2",
        )
        .bind(chain)
        .bind(home_tx_hash)
        .fetch_optional(&self.pool)
        .await
        .wrap_err("Failed to get completed outbound")?;
        Ok(row.map(|(hash,)| hash))
    }
}
