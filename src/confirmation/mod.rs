//! Confirmation state machine for in-flight bridge transactions
//!
//! Every tick walks the unconfirmed queue once (bounded by its length at tick
//! start). Each record is parked, validated, reported to the home ledger or
//! purged; the store is written once per record and only when it changed.

use std::sync::Arc;
use std::time::Duration;

use eyre::{Result, WrapErr};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::context::ChainContext;
use crate::error::{BridgeError, CallbackError, ChainError};
use crate::hash::normalize_hash;
use crate::home::{DepositNotice, FeeNotice, OutboundConfirmation};
use crate::metrics;
use crate::types::{PendingBridgeTx, TxKind, TxStatus};
use crate::writers::retry::{with_retry, RetryConfig};
use crate::writers::SigningCoordinator;

pub mod queue;

pub use queue::UnconfirmedQueue;

/// What happens to a record after one step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Back to the end of the queue
    Requeue,
    /// Delete from the store; the reason is logged and counted
    Purge(&'static str),
    /// A rebroadcast under the same hash already replaced the stored record
    Replaced,
}

/// Outcome of re-checking a completed outbound transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundCheck {
    Success,
    ReValidate,
    ReSend,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickStats {
    pub processed: usize,
    pub requeued: usize,
    pub purged: usize,
}

pub struct ConfirmationTask {
    ctx: Arc<ChainContext>,
    coordinator: Arc<SigningCoordinator>,
    retry: RetryConfig,
}

impl ConfirmationTask {
    pub fn new(ctx: Arc<ChainContext>, coordinator: Arc<SigningCoordinator>) -> Self {
        Self {
            ctx,
            coordinator,
            retry: RetryConfig::default(),
        }
    }

    /// Run ticks until shutdown. A running tick always completes.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let interval = Duration::from_millis(self.ctx.settings.confirm_interval_ms);

        tokio::select! {
            _ = self.ctx.queue.wait_loaded() => {}
            _ = shutdown.changed() => return Ok(()),
        }
        info!(
            chain = %self.ctx.name,
            interval_ms = interval.as_millis() as u64,
            "Confirmation task started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.tick().await {
                Ok(stats) if stats.processed > 0 => debug!(
                    chain = %self.ctx.name,
                    processed = stats.processed,
                    requeued = stats.requeued,
                    purged = stats.purged,
                    "Confirmation tick finished"
                ),
                Ok(_) => {}
                Err(e) => {
                    metrics::record_error(&self.ctx.name, "confirmation_tick");
                    error!(chain = %self.ctx.name, error = ?e, "Confirmation tick failed");
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {}
            }
        }

        info!(chain = %self.ctx.name, "Confirmation task stopped");
        Ok(())
    }

    /// Process each record queued at tick start exactly once
    pub async fn tick(&self) -> Result<TickStats> {
        let ctx = &self.ctx;
        ctx.queue.wait_loaded().await;

        let budget = ctx.queue.len().await;
        let mut stats = TickStats::default();

        for _ in 0..budget {
            let Some(hash) = ctx.queue.pop().await else {
                break;
            };
            let record = match ctx.store.get_pending_tx(&ctx.name, &hash).await {
                Ok(Some(record)) => record,
                Ok(None) => {
                    debug!(chain = %ctx.name, tx_hash = %hash, "Queued hash has no stored record");
                    continue;
                }
                Err(e) => {
                    ctx.queue.push(&hash).await;
                    return Err(e.wrap_err("Failed to load pending tx"));
                }
            };

            let mut updated = record.clone();
            let disposition = self.advance(&mut updated).await;
            stats.processed += 1;

            match disposition {
                Disposition::Requeue => {
                    if updated != record {
                        if let Err(e) = self.persist(&record, &mut updated).await {
                            ctx.queue.push(&hash).await;
                            return Err(e);
                        }
                    }
                    ctx.queue.push(&hash).await;
                    stats.requeued += 1;
                }
                Disposition::Purge(reason) => {
                    if let Err(e) = self.purge(&hash).await {
                        ctx.queue.push(&hash).await;
                        return Err(e);
                    }
                    info!(
                        chain = %ctx.name,
                        tx_hash = %hash,
                        kind = %record.kind,
                        reason,
                        "Pending tx purged"
                    );
                    metrics::record_purge(&ctx.name, reason);
                    stats.purged += 1;
                }
                Disposition::Replaced => {
                    ctx.queue.push(&hash).await;
                    stats.requeued += 1;
                }
            }
        }

        metrics::set_queue_depth(&ctx.name, ctx.queue.len().await);
        Ok(stats)
    }

    /// One state-machine step for `record`
    pub async fn advance(&self, record: &mut PendingBridgeTx) -> Disposition {
        if record.marked_deleted {
            return self.await_deletion(record).await;
        }

        if record.block_height.is_none() {
            self.resolve_height(record).await;
            return Disposition::Requeue;
        }

        if record.skip_rounds > 0 {
            record.skip_rounds -= 1;
            return Disposition::Requeue;
        }

        // Always the live tip; a cached one would skew confirmation counts
        let tip = match self.ctx.reader.get_tip_height().await {
            Ok(tip) => tip,
            Err(e) => {
                self.transient("tip_height", &record.external_tx_hash, &e);
                return Disposition::Requeue;
            }
        };
        let required = self.ctx.settings.required_confirmations(record.kind);
        let confirmations = record.confirmations(tip);
        if confirmations < required {
            debug!(
                chain = %self.ctx.name,
                tx_hash = %record.external_tx_hash,
                confirmations,
                required,
                "Waiting for confirmations"
            );
            return Disposition::Requeue;
        }

        if record.is_inbound() {
            self.confirm_inbound(record).await
        } else {
            self.confirm_outbound(record).await
        }
    }

    /// Finalized records stay until the home ledger passes `deletion_height`
    async fn await_deletion(&self, record: &PendingBridgeTx) -> Disposition {
        match self.ctx.home.get_home_tip_height().await {
            Ok(home_tip) if home_tip >= record.deletion_height => Disposition::Purge("finalized"),
            Ok(_) => Disposition::Requeue,
            Err(e) => {
                warn!(
                    chain = %self.ctx.name,
                    tx_hash = %record.external_tx_hash,
                    error = %e,
                    "Home tip unavailable, keeping marked record"
                );
                Disposition::Requeue
            }
        }
    }

    async fn resolve_height(&self, record: &mut PendingBridgeTx) {
        let ctx = &self.ctx;
        let receipt = match ctx
            .reader
            .get_transaction_receipt(&record.external_tx_hash)
            .await
        {
            Ok(Some(receipt)) => receipt,
            Ok(None) => {
                debug!(chain = %ctx.name, tx_hash = %record.external_tx_hash, "Not mined yet");
                return;
            }
            Err(e) => {
                self.transient("receipt", &record.external_tx_hash, &e);
                return;
            }
        };

        record.block_height = Some(receipt.block_height);
        record.block_hash = Some(receipt.block_hash.clone());
        if let Ok(Some(header)) = ctx.reader.get_header(receipt.block_height).await {
            record.tx_time = header.time;
        }
        if !record.is_inbound() {
            record.status = ctx.family.outbound_status(record.kind, Some(&receipt));
        }
        info!(
            chain = %ctx.name,
            tx_hash = %record.external_tx_hash,
            height = receipt.block_height,
            status = %record.status,
            "Block height resolved"
        );
    }

    async fn confirm_inbound(&self, record: &mut PendingBridgeTx) -> Disposition {
        let ctx = &self.ctx;

        if !record.validated {
            match self.validate_inbound(record).await {
                Ok(true) => {
                    record.validated = true;
                    info!(
                        chain = %ctx.name,
                        tx_hash = %record.external_tx_hash,
                        kind = %record.kind,
                        "Inbound tx validated"
                    );
                }
                Ok(false) => {
                    warn!(
                        chain = %ctx.name,
                        tx_hash = %record.external_tx_hash,
                        kind = %record.kind,
                        "Inbound tx failed validation, never credited"
                    );
                    return Disposition::Purge("validation_failed");
                }
                Err(e) => {
                    self.transient("validation", &record.external_tx_hash, &e);
                    return Disposition::Requeue;
                }
            }
        }

        let result = match record.kind {
            TxKind::FeeRecord => {
                let Some(home_tx_hash) = record.home_tx_hash.clone() else {
                    return Disposition::Purge("validation_failed");
                };
                let notice = FeeNotice {
                    chain_id: ctx.chain_id,
                    external_tx_hash: record.external_tx_hash.clone(),
                    home_tx_hash,
                    amount: record.amount,
                    decimals: record.asset.decimals(),
                    asset_contract: record.asset.contract().map(str::to_string),
                };
                ctx.home.submit_withdrawal_fee(&notice).await
            }
            _ => {
                let Some(notice) = DepositNotice::from_record(ctx.chain_id, record) else {
                    return Disposition::Purge("validation_failed");
                };
                match ctx.home.submit_confirmed_deposit(&notice).await {
                    Ok(home_tx_hash) => {
                        record.home_tx_hash = Some(normalize_hash(&home_tx_hash));
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
        };

        self.after_callback(record, result).await
    }

    /// Re-fetch the receipt and check it still proves the recorded event
    async fn validate_inbound(&self, record: &PendingBridgeTx) -> Result<bool, ChainError> {
        let Some(receipt) = self
            .ctx
            .reader
            .get_transaction_receipt(&record.external_tx_hash)
            .await?
        else {
            return Ok(false);
        };
        if !self.ctx.family.receipt_matches_inbound(record, &receipt) {
            return Ok(false);
        }
        Ok(match record.kind {
            TxKind::FeeRecord => record.home_tx_hash.is_some(),
            _ => record
                .memo_address
                .as_deref()
                .is_some_and(|memo| self.ctx.codec.is_valid(memo)),
        })
    }

    async fn confirm_outbound(&self, record: &mut PendingBridgeTx) -> Disposition {
        let ctx = &self.ctx;

        match record.status {
            TxStatus::Failed => return Disposition::Purge("failed"),
            TxStatus::Initial | TxStatus::Doing => {
                // Still in flight; pick up a completion the scanner has not seen
                if let Ok(receipt) = ctx
                    .reader
                    .get_transaction_receipt(&record.external_tx_hash)
                    .await
                {
                    let status = ctx.family.outbound_status(record.kind, receipt.as_ref());
                    if status != record.status {
                        info!(
                            chain = %ctx.name,
                            tx_hash = %record.external_tx_hash,
                            from = %record.status,
                            to = %status,
                            "Outbound status changed"
                        );
                        record.status = status;
                    }
                }
                return Disposition::Requeue;
            }
            TxStatus::Completed => {}
        }

        let check = match self.revalidate_outbound(record).await {
            Ok(check) => check,
            Err(e) => {
                self.transient("revalidation", &record.external_tx_hash, &e);
                return Disposition::Requeue;
            }
        };

        match check {
            OutboundCheck::Success => {
                record.validated = true;
                let Some(home_tx_hash) = record.home_tx_hash.clone() else {
                    error!(
                        chain = %ctx.name,
                        tx_hash = %record.external_tx_hash,
                        "Outbound tx has no home tx hash"
                    );
                    return Disposition::Purge("unlinked");
                };
                let confirmation = OutboundConfirmation {
                    chain_id: ctx.chain_id,
                    kind: record.kind,
                    home_tx_hash: home_tx_hash.clone(),
                    external_tx_hash: record.external_tx_hash.clone(),
                    height: record.block_height.unwrap_or_default(),
                    tx_time: record.tx_time,
                    custodian_address: ctx.family.custodian_address().to_string(),
                    signers: record.signers.clone(),
                };
                let result = ctx.home.submit_confirmed_outbound(&confirmation).await;
                let finished = match &result {
                    Ok(()) => true,
                    Err(e) => e.is_duplicate(),
                };
                if finished {
                    let external_tx_hash = record.external_tx_hash.clone();
                    if let Err(e) = with_retry(&self.retry, "mark outbound completed", |_| {
                        ctx.store
                            .mark_outbound_completed(&ctx.name, &home_tx_hash, &external_tx_hash)
                    })
                    .await
                    {
                        // Keep session and record; the next tick repeats the callback
                        error!(
                            chain = %ctx.name,
                            home_tx_hash = %home_tx_hash,
                            error = ?e,
                            "Failed to record completed outbound tx"
                        );
                        return Disposition::Requeue;
                    }
                    if let Err(e) = ctx.store.delete_session(&ctx.name, &home_tx_hash).await {
                        warn!(
                            chain = %ctx.name,
                            home_tx_hash = %home_tx_hash,
                            error = ?e,
                            "Failed to drop finished signing session"
                        );
                    }
                }
                self.after_callback(record, result).await
            }
            OutboundCheck::ReValidate => {
                record.validation_attempts += 1;
                if record.validation_attempts > ctx.tuning.max_revalidations {
                    warn!(
                        chain = %ctx.name,
                        tx_hash = %record.external_tx_hash,
                        attempts = record.validation_attempts,
                        "Revalidation limit reached, resending"
                    );
                    return self.resend(record).await;
                }
                record.skip_rounds = ctx.tuning.revalidation_skip_rounds;
                info!(
                    chain = %ctx.name,
                    tx_hash = %record.external_tx_hash,
                    attempts = record.validation_attempts,
                    "Outbound tx needs revalidation"
                );
                Disposition::Requeue
            }
            OutboundCheck::ReSend => self.resend(record).await,
        }
    }

    /// Check a completed outbound tx against the chain as it is now
    pub async fn revalidate_outbound(
        &self,
        record: &mut PendingBridgeTx,
    ) -> Result<OutboundCheck, ChainError> {
        let receipt = self
            .ctx
            .reader
            .get_transaction_receipt(&record.external_tx_hash)
            .await?;
        Ok(match receipt {
            // Reorged out, it may come back
            None => OutboundCheck::ReValidate,
            Some(r) if !r.success => OutboundCheck::ReSend,
            Some(r) if record.block_hash.as_deref() != Some(r.block_hash.as_str()) => {
                record.block_height = Some(r.block_height);
                record.block_hash = Some(r.block_hash);
                OutboundCheck::ReValidate
            }
            Some(r) if self.ctx.family.receipt_completes(record.kind, &r) => OutboundCheck::Success,
            Some(_) => OutboundCheck::ReValidate,
        })
    }

    async fn resend(&self, record: &PendingBridgeTx) -> Disposition {
        let Some(home_tx_hash) = record.home_tx_hash.as_deref() else {
            return Disposition::Purge("unlinked");
        };
        match self.coordinator.resend(home_tx_hash).await {
            Ok(Some(hash)) if hash == record.external_tx_hash => Disposition::Replaced,
            Ok(_) => Disposition::Purge("resent"),
            Err(BridgeError::ResendExhausted { .. }) => Disposition::Purge("resend_exhausted"),
            Err(e) => {
                // The session stays stored; the signing task retries it on expiry
                error!(
                    chain = %self.ctx.name,
                    tx_hash = %record.external_tx_hash,
                    home_tx_hash = %home_tx_hash,
                    error = %e,
                    "Resend failed"
                );
                Disposition::Purge("resend_failed")
            }
        }
    }

    async fn after_callback(
        &self,
        record: &mut PendingBridgeTx,
        result: Result<(), CallbackError>,
    ) -> Disposition {
        let ctx = &self.ctx;
        let kind = record.kind.as_str();
        match result {
            Ok(()) => {
                metrics::record_callback(&ctx.name, kind, "ok");
                let home_tip = match ctx.home.get_home_tip_height().await {
                    Ok(tip) => tip,
                    Err(e) => {
                        warn!(chain = %ctx.name, error = %e, "Home tip unavailable after callback");
                        0
                    }
                };
                record.marked_deleted = true;
                record.deletion_height = home_tip + ctx.tuning.deletion_delay;
                record.error_count = 0;
                info!(
                    chain = %ctx.name,
                    tx_hash = %record.external_tx_hash,
                    kind,
                    home_tx_hash = ?record.home_tx_hash,
                    deletion_height = record.deletion_height,
                    "Home ledger callback accepted"
                );
                Disposition::Requeue
            }
            Err(e) if e.is_duplicate() => {
                metrics::record_callback(&ctx.name, kind, "duplicate");
                info!(
                    chain = %ctx.name,
                    tx_hash = %record.external_tx_hash,
                    kind,
                    "Home ledger already has this event"
                );
                Disposition::Purge("duplicate")
            }
            Err(e) => {
                metrics::record_callback(&ctx.name, kind, "error");
                record.error_count += 1;
                if record.error_count >= ctx.tuning.max_callback_errors {
                    error!(
                        chain = %ctx.name,
                        tx_hash = %record.external_tx_hash,
                        kind,
                        errors = record.error_count,
                        error = %e,
                        "Callback error limit reached, dropping record"
                    );
                    return Disposition::Purge("callback_errors");
                }
                warn!(
                    chain = %ctx.name,
                    tx_hash = %record.external_tx_hash,
                    kind,
                    errors = record.error_count,
                    error = %e,
                    "Home ledger callback failed"
                );
                Disposition::Requeue
            }
        }
    }

    /// Save `updated`, keeping changes the scanner or the mark-deleted hook
    /// wrote since `original` was loaded
    async fn persist(&self, original: &PendingBridgeTx, updated: &mut PendingBridgeTx) -> Result<()> {
        let ctx = &self.ctx;
        if let Some(current) = ctx
            .store
            .get_pending_tx(&ctx.name, &updated.external_tx_hash)
            .await?
        {
            if current != *original {
                absorb_concurrent(original, &current, updated);
            }
        }
        let record = &*updated;
        with_retry(&self.retry, "save pending tx", |_| {
            ctx.store.save_pending_tx(&ctx.name, record)
        })
        .await
        .wrap_err_with(|| format!("Failed to save pending tx {}", record.external_tx_hash))
    }

    async fn purge(&self, hash: &str) -> Result<()> {
        let ctx = &self.ctx;
        with_retry(&self.retry, "delete pending tx", |_| {
            ctx.store.delete_pending_tx(&ctx.name, hash)
        })
        .await
        .wrap_err_with(|| format!("Failed to delete pending tx {}", hash))
    }

    fn transient(&self, what: &str, tx_hash: &str, error: &ChainError) {
        metrics::record_error(&self.ctx.name, what);
        warn!(
            chain = %self.ctx.name,
            tx_hash = %tx_hash,
            error = %error,
            "Transient adapter error during {}, retrying next tick", what
        );
    }
}

/// Carry over fields another writer changed while this tick held the record
fn absorb_concurrent(original: &PendingBridgeTx, current: &PendingBridgeTx, updated: &mut PendingBridgeTx) {
    if current.marked_deleted && !updated.marked_deleted {
        updated.marked_deleted = true;
        updated.deletion_height = current.deletion_height;
    }
    if current.block_hash != original.block_hash {
        updated.block_height = current.block_height;
        updated.block_hash = current.block_hash.clone();
        updated.tx_time = current.tx_time;
        updated.validated = false;
    }
    if current.status != original.status && updated.status == original.status {
        updated.status = current.status;
    }
    if current.signers != original.signers && updated.signers == original.signers {
        updated.signers = current.signers.clone();
    }
}
