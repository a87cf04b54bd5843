//! Block scanner with fork detection
//!
//! Walks an external chain block by block from the last stored header,
//! classifying every transaction. A bounded window of recent headers is kept
//! in the store; a hash mismatch at the local tip drops that header and the
//! next tick re-checks one block lower, until the chains agree again.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use eyre::Result;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::context::ChainContext;
use crate::error::{BridgeError, BridgeResult, ChainError};
use crate::home::DepositNotice;
use crate::metrics;
use crate::types::{LocalBlockHeader, PendingBridgeTx, TxKind, TxStatus};
use crate::watchers::classifier::{Classification, Classifier};
use crate::writers::retry::{with_retry, RetryConfig};

/// Result of one scanner tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutcome {
    /// This node is not in the current custodian set
    NotCustodian,
    /// First header stored at the remote tip
    Seeded { height: u64 },
    /// Local history discarded and restarted at the remote tip
    Reseeded { height: u64 },
    /// Local tip header dropped after a hash mismatch
    Forked { height: u64 },
    /// Blocks processed up to `height`
    Advanced { height: u64, blocks: u64 },
    UpToDate,
}

enum BlockStep {
    Stored(LocalBlockHeader),
    ParentMismatch,
}

pub struct BlockScanner {
    ctx: Arc<ChainContext>,
    retry: RetryConfig,
    synced: AtomicBool,
}

impl BlockScanner {
    pub fn new(ctx: Arc<ChainContext>) -> Self {
        Self {
            ctx,
            retry: RetryConfig::default(),
            synced: AtomicBool::new(false),
        }
    }

    /// Run ticks until shutdown
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let interval = Duration::from_millis(self.ctx.settings.scan_interval_ms);
        info!(
            chain = %self.ctx.name,
            family = self.ctx.family.name(),
            custodian_address = %self.ctx.family.custodian_address(),
            interval_ms = interval.as_millis() as u64,
            "Block scanner started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.tick().await {
                Ok(ScanOutcome::Advanced { height, blocks }) => debug!(
                    chain = %self.ctx.name,
                    height,
                    blocks,
                    "Scanner advanced"
                ),
                Ok(_) => {}
                Err(BridgeError::Transient(e)) => {
                    metrics::record_error(&self.ctx.name, "scanner_rpc");
                    warn!(chain = %self.ctx.name, error = %e, "Scanner tick hit a transient chain error");
                }
                Err(e) => {
                    metrics::record_error(&self.ctx.name, "scanner_tick");
                    error!(chain = %self.ctx.name, error = %e, "Scanner tick failed");
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {}
            }
        }

        info!(chain = %self.ctx.name, "Block scanner stopped");
        Ok(())
    }

    pub async fn tick(&self) -> BridgeResult<ScanOutcome> {
        let ctx = &self.ctx;

        let custodians = ctx.home.get_current_custodian_set().await?;
        let is_custodian = custodians.contains(ctx.signer.pubkey());
        ctx.status.set_custodian(is_custodian);
        if !is_custodian {
            if ctx.status.take_headers_purge() {
                ctx.store.clear_headers(&ctx.name).await?;
                warn!(
                    chain = %ctx.name,
                    pubkey = %ctx.signer.pubkey(),
                    "Not in the current custodian set, local headers purged"
                );
            }
            return Ok(ScanOutcome::NotCustodian);
        }

        let remote_tip = ctx.reader.get_tip_height().await?;
        let Some(local) = ctx.store.latest_header(&ctx.name).await? else {
            self.process_block(remote_tip, None).await?;
            self.synced.store(true, Ordering::Relaxed);
            info!(chain = %ctx.name, height = remote_tip, "Scanner seeded at remote tip");
            return Ok(ScanOutcome::Seeded { height: remote_tip });
        };

        if !self.synced.swap(true, Ordering::Relaxed)
            && remote_tip > local.height.saturating_add(ctx.settings.max_catchup_gap)
        {
            warn!(
                chain = %ctx.name,
                local_height = local.height,
                remote_tip,
                max_gap = ctx.settings.max_catchup_gap,
                "Local headers too far behind, reseeding at remote tip"
            );
            ctx.store.clear_headers(&ctx.name).await?;
            self.process_block(remote_tip, None).await?;
            return Ok(ScanOutcome::Reseeded { height: remote_tip });
        }

        let remote = ctx
            .reader
            .get_header(local.height)
            .await?
            .ok_or_else(|| ChainError::NotFound(format!("header at {}", local.height)))?;
        if remote.hash != local.hash {
            return self.roll_back(&local).await;
        }

        let mut parent = local;
        let mut blocks = 0;
        for height in parent.height + 1..=remote_tip {
            match self.process_block(height, Some(&parent.hash)).await? {
                BlockStep::Stored(header) => {
                    blocks += 1;
                    parent = header;
                }
                BlockStep::ParentMismatch => return self.roll_back(&parent).await,
            }
        }

        Ok(if blocks > 0 {
            ScanOutcome::Advanced {
                height: parent.height,
                blocks,
            }
        } else {
            ScanOutcome::UpToDate
        })
    }

    async fn roll_back(&self, local: &LocalBlockHeader) -> BridgeResult<ScanOutcome> {
        let ctx = &self.ctx;
        ctx.store.delete_header(&ctx.name, local.height).await?;
        metrics::record_fork(&ctx.name);
        warn!(
            chain = %ctx.name,
            height = local.height,
            local_hash = %local.hash,
            "Fork detected, local tip header dropped"
        );
        Ok(ScanOutcome::Forked {
            height: local.height,
        })
    }

    /// Classify one block and store its header. Records are written before
    /// the header so a crash re-scans the block instead of skipping it.
    async fn process_block(&self, height: u64, parent: Option<&str>) -> BridgeResult<BlockStep> {
        let ctx = &self.ctx;
        let block = ctx.reader.get_block(height).await?;
        if parent.is_some_and(|p| p != block.header.parent_hash) {
            return Ok(BlockStep::ParentMismatch);
        }

        let classifier = Classifier::new(ctx);
        for tx in &block.txs {
            match classifier.classify(&block.header, tx).await? {
                Classification::Irrelevant => {}
                Classification::Rejected(reason) => {
                    metrics::record_rejected(&ctx.name);
                    warn!(
                        chain = %ctx.name,
                        tx_hash = %tx.hash(),
                        height,
                        reason = %reason,
                        "Transaction to custodian rejected"
                    );
                }
                Classification::Event(event) => self.record_event(event).await?,
            }
        }

        let header = LocalBlockHeader {
            height,
            hash: block.header.hash.clone(),
            parent_hash: block.header.parent_hash.clone(),
        };
        ctx.store.append_header(&ctx.name, &header).await?;
        let retention = ctx.settings.header_retention.max(1);
        if height >= retention {
            ctx.store.prune_headers(&ctx.name, height + 1 - retention).await?;
        }
        ctx.status.set_last_scanned(height);
        metrics::record_block_scanned(&ctx.name, height);
        Ok(BlockStep::Stored(header))
    }

    async fn record_event(&self, mut event: PendingBridgeTx) -> BridgeResult<()> {
        let ctx = &self.ctx;
        if !event.is_inbound() && event.signers.is_empty() {
            if let Some(home_tx_hash) = &event.home_tx_hash {
                if let Some(session) = ctx.store.get_session(&ctx.name, home_tx_hash).await? {
                    event.signers = session.signatures.keys().cloned().collect();
                }
            }
        }

        let existing = ctx
            .store
            .get_pending_tx(&ctx.name, &event.external_tx_hash)
            .await?;
        let is_new = existing.is_none();
        let Some(record) = merge_event(existing, event) else {
            return Ok(());
        };

        with_retry(&self.retry, "save scanned tx", |_| {
            ctx.store.save_pending_tx(&ctx.name, &record)
        })
        .await?;
        ctx.queue.push(&record.external_tx_hash).await;

        if !is_new {
            debug!(
                chain = %ctx.name,
                tx_hash = %record.external_tx_hash,
                height = ?record.block_height,
                "Pending tx moved to a new block"
            );
            return Ok(());
        }

        metrics::record_classified(&ctx.name, record.kind.as_str());
        info!(
            chain = %ctx.name,
            tx_hash = %record.external_tx_hash,
            kind = %record.kind,
            height = ?record.block_height,
            amount = %record.amount,
            home_tx_hash = ?record.home_tx_hash,
            "Bridge event recorded"
        );

        if record.kind == TxKind::Deposit {
            if let Some(notice) = DepositNotice::from_record(ctx.chain_id, &record) {
                match ctx.home.submit_pending_deposit(&notice).await {
                    Ok(()) => {}
                    Err(e) if e.is_duplicate() => {}
                    Err(e) => warn!(
                        chain = %ctx.name,
                        tx_hash = %record.external_tx_hash,
                        error = %e,
                        "Pending deposit notice failed"
                    ),
                }
            }
        }
        Ok(())
    }
}

/// Fold a freshly scanned event into the stored record.
///
/// Returns `None` when nothing needs writing. Engine state (error counts,
/// deletion marks, revalidation progress) always survives a re-scan.
pub fn merge_event(
    existing: Option<PendingBridgeTx>,
    event: PendingBridgeTx,
) -> Option<PendingBridgeTx> {
    let Some(existing) = existing else {
        return Some(event);
    };
    if existing.marked_deleted {
        return None;
    }

    let mut merged = existing.clone();
    if merged.block_hash != event.block_hash {
        merged.block_height = event.block_height;
        merged.block_hash = event.block_hash;
        merged.tx_time = event.tx_time;
        merged.validated = false;
    }
    if !merged.is_inbound() && merged.status != TxStatus::Failed {
        merged.status = event.status;
    }
    if merged.home_tx_hash.is_none() {
        merged.home_tx_hash = event.home_tx_hash;
    }
    if merged.signers.is_empty() {
        merged.signers = event.signers;
    }
    if merged.to.is_empty() {
        merged.to = event.to;
    }

    (merged != existing).then_some(merged)
}
