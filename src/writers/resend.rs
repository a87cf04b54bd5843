//! Bounded resend and signature recovery for outbound transactions

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::context::ChainContext;
use crate::error::{BridgeError, BridgeResult};
use crate::metrics;
use crate::writers::session::OutboundSigningSession;
use crate::writers::{accept_signature, build_payload, SignatureCheck};

pub struct ResendHelper {
    ctx: Arc<ChainContext>,
}

impl ResendHelper {
    pub fn new(ctx: Arc<ChainContext>) -> Self {
        Self { ctx }
    }

    /// Count one more resend; fails once the configured maximum is exceeded
    pub async fn bump_counter(&self, home_tx_hash: &str) -> BridgeResult<u32> {
        let ctx = &self.ctx;
        let attempts = ctx
            .store
            .increment_resend_count(&ctx.name, home_tx_hash)
            .await?;
        if attempts > ctx.tuning.max_resend {
            metrics::record_resend(&ctx.name, "exhausted");
            error!(
                chain = %ctx.name,
                home_tx_hash = %home_tx_hash,
                attempts,
                max_resend = ctx.tuning.max_resend,
                "ALERT: resend limit exceeded, outbound tx abandoned; manual intervention required"
            );
            return Err(BridgeError::ResendExhausted {
                home_tx_hash: home_tx_hash.to_string(),
                attempts,
            });
        }
        Ok(attempts)
    }

    /// Rebuild `session` against the current custodian set and chain state.
    ///
    /// Signatures that still verify on the rebuilt payload are kept (all of
    /// them when the payload did not change). Both waiting windows move
    /// forward, never back.
    pub async fn resend(&self, session: &mut OutboundSigningSession, now: i64) -> BridgeResult<u32> {
        let ctx = &self.ctx;
        let attempts = self.bump_counter(&session.home_tx_hash).await?;

        let custodians = ctx.home.get_current_custodian_set().await?;
        let send_order = custodians.send_order(ctx.signer.pubkey()).ok_or_else(|| {
            BridgeError::Validation("this node is no longer a custodian".to_string())
        })?;
        let payload = build_payload(ctx, &session.request, &custodians).await?;

        let previous = std::mem::take(&mut session.signatures);
        let payload_changed = payload != session.payload;
        session.payload = payload;
        session.custodians = custodians;
        session.send_order = send_order;
        session.broadcast_tx_hash = None;
        for signature in previous.into_values() {
            accept_signature(&ctx.family, session, signature);
        }
        session.refresh_window(now, &ctx.tuning.window_policy());

        metrics::record_resend(&ctx.name, "ok");
        info!(
            chain = %ctx.name,
            home_tx_hash = %session.home_tx_hash,
            attempts,
            payload_changed,
            kept_signatures = session.signatures.len(),
            waiting_end_time = session.waiting_end_time,
            max_waiting_end_time = session.max_waiting_end_time,
            "Outbound tx prepared for resend"
        );
        Ok(attempts)
    }

    /// Pull the home ledger's quorum signatures into `session`.
    ///
    /// At most `n` signatures are considered; each is verified before it is
    /// counted. Returns how many were added.
    pub async fn refresh_signatures(&self, session: &mut OutboundSigningSession) -> BridgeResult<usize> {
        let ctx = &self.ctx;
        let mut batch = ctx
            .home
            .request_quorum_signatures(&session.home_tx_hash, ctx.chain_id)
            .await?;
        if batch.len() > session.custodians.n() {
            warn!(
                chain = %ctx.name,
                home_tx_hash = %session.home_tx_hash,
                received = batch.len(),
                custodians = session.custodians.n(),
                "Quorum store returned more signatures than custodians, truncating"
            );
            batch.truncate(session.custodians.n());
        }

        let mut added = 0;
        for signature in batch {
            let pubkey = signature.pubkey.clone();
            match accept_signature(&ctx.family, session, signature) {
                SignatureCheck::Added => added += 1,
                SignatureCheck::Invalid => {
                    metrics::record_error(&ctx.name, "invalid_signature");
                    warn!(
                        chain = %ctx.name,
                        home_tx_hash = %session.home_tx_hash,
                        pubkey = %pubkey,
                        "Quorum signature failed verification"
                    );
                }
                SignatureCheck::NotCustodian => warn!(
                    chain = %ctx.name,
                    home_tx_hash = %session.home_tx_hash,
                    pubkey = %pubkey,
                    "Quorum signature from a non-custodian ignored"
                ),
                SignatureCheck::Duplicate | SignatureCheck::Closed => {}
            }
        }
        Ok(added)
    }
}
