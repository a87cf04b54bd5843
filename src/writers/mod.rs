//! Outbound signing coordinator
//!
//! Turns a home-ledger action into a quorum-signed external transaction:
//! build the payload every custodian derives identically, sign it locally,
//! collect and verify the other custodians' signatures, then broadcast from
//! this node's staggered window once `m` of `n` are present.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::chain::{BuildContext, ChainFamily, SignedTx, UnsignedPayload};
use crate::context::ChainContext;
use crate::error::{BridgeError, BridgeResult};
use crate::hash::normalize_hash;
use crate::metrics;
use crate::types::{
    normalize_pubkey, Asset, CustodianSet, CustodianSignature, OutboundParams, OutboundRequest,
    PendingBridgeTx, TxKind, TxStatus,
};

pub mod resend;
pub mod retry;
pub mod session;

pub use resend::ResendHelper;
pub use retry::{classify_error, with_retry, ErrorClass, RetryConfig};
pub use session::{OutboundSigningSession, SessionLocks, WindowPolicy};

/// Result of offering a signature to a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureCheck {
    Added,
    Duplicate,
    NotCustodian,
    Invalid,
    /// The session already broadcast
    Closed,
}

/// Count `signature` toward quorum only if it verifies against the session
/// payload and comes from a member of the session's custodian set
pub fn accept_signature(
    family: &ChainFamily,
    session: &mut OutboundSigningSession,
    signature: CustodianSignature,
) -> SignatureCheck {
    if session.is_broadcast() {
        return SignatureCheck::Closed;
    }
    let pubkey = normalize_pubkey(&signature.pubkey);
    if !session.custodians.contains(&pubkey) {
        return SignatureCheck::NotCustodian;
    }
    if session.signatures.contains_key(&pubkey) {
        return SignatureCheck::Duplicate;
    }
    let signature = CustodianSignature {
        pubkey: pubkey.clone(),
        parts: signature.parts,
    };
    if !family.verify(&session.payload, &signature) {
        return SignatureCheck::Invalid;
    }
    session.signatures.insert(pubkey, signature);
    SignatureCheck::Added
}

/// Derive the unsigned payload from the live chain state
pub async fn build_payload(
    ctx: &ChainContext,
    request: &OutboundRequest,
    custodians: &CustodianSet,
) -> BridgeResult<UnsignedPayload> {
    let (unspent, fee_rate) = if ctx.family.needs_unspent() {
        let unspent = ctx
            .reader
            .list_unspent(ctx.family.custodian_address())
            .await?;
        let fee_rate = match request.fee_rate {
            Some(rate) => rate,
            None => ctx.reader.estimate_fee_rate().await?,
        };
        (unspent, fee_rate)
    } else {
        (Vec::new(), 0)
    };
    ctx.family.build_unsigned_outbound(
        request,
        &BuildContext {
            custodians,
            unspent: &unspent,
            fee_rate,
        },
    )
}

pub struct SigningCoordinator {
    ctx: Arc<ChainContext>,
    locks: SessionLocks,
    resend: ResendHelper,
    retry: RetryConfig,
}

impl SigningCoordinator {
    pub fn new(ctx: Arc<ChainContext>) -> Self {
        Self {
            resend: ResendHelper::new(ctx.clone()),
            ctx,
            locks: SessionLocks::new(),
            retry: RetryConfig::default(),
        }
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> eyre::Result<()> {
        let interval = Duration::from_millis(self.ctx.settings.signing_interval_ms);
        info!(
            chain = %self.ctx.name,
            interval_ms = interval.as_millis() as u64,
            "Signing task started"
        );
        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = self.tick().await {
                metrics::record_error(&self.ctx.name, "signing_tick");
                error!(chain = %self.ctx.name, error = %e, "Signing tick failed");
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {}
            }
        }
        info!(chain = %self.ctx.name, "Signing task stopped");
        Ok(())
    }

    pub async fn submit(&self, request: OutboundRequest) -> BridgeResult<OutboundSigningSession> {
        self.submit_at(request, Utc::now().timestamp()).await
    }

    /// Open a signing session for `request` and add this node's signature.
    ///
    /// Submitting a request that already has a session returns the stored
    /// session unchanged, so a restart or a repeated hook call never
    /// originates a second outbound transaction. The home ledger must know
    /// the home tx as an action of the requested kind, and a home tx whose
    /// outbound action already confirmed is refused.
    pub async fn submit_at(
        &self,
        request: OutboundRequest,
        now: i64,
    ) -> BridgeResult<OutboundSigningSession> {
        let ctx = &self.ctx;
        let home_tx_hash = normalize_hash(&request.home_tx_hash);
        let _guard = self.locks.lock(&home_tx_hash).await;

        if let Some(session) = ctx.store.get_session(&ctx.name, &home_tx_hash).await? {
            debug!(chain = %ctx.name, home_tx_hash = %home_tx_hash, "Signing session already open");
            return Ok(session);
        }
        if let Some(external) = ctx
            .store
            .get_completed_outbound(&ctx.name, &home_tx_hash)
            .await?
        {
            return Err(BridgeError::Validation(format!(
                "outbound tx for {} already completed in {}",
                home_tx_hash, external
            )));
        }
        self.require_home_tx(&home_tx_hash, request.kind()).await?;
        if self.tracked_broadcast(&home_tx_hash, request.kind()).await?.is_some() {
            return Err(BridgeError::Validation(format!(
                "outbound tx for {} is already tracked",
                home_tx_hash
            )));
        }

        let custodians = ctx.home.get_current_custodian_set().await?;
        let send_order = custodians.send_order(ctx.signer.pubkey()).ok_or_else(|| {
            BridgeError::Validation("this node is not a custodian".to_string())
        })?;
        let payload = build_payload(ctx, &request, &custodians).await?;

        let mut session = OutboundSigningSession::new(
            request,
            payload,
            custodians,
            send_order,
            now,
            &ctx.tuning.window_policy(),
        );
        self.sign_own(&mut session)?;
        self.checkpoint(&session).await?;

        info!(
            chain = %ctx.name,
            home_tx_hash = %session.home_tx_hash,
            kind = %session.kind(),
            n = session.custodians.n(),
            m = session.custodians.m(),
            send_order,
            required_inputs = ?session.required_inputs(),
            "Signing session opened"
        );

        self.try_finalize(&mut session, now).await?;
        Ok(session)
    }

    pub async fn add_signature(
        &self,
        home_tx_hash: &str,
        signature: CustodianSignature,
    ) -> BridgeResult<SignatureCheck> {
        self.add_signature_at(home_tx_hash, signature, Utc::now().timestamp())
            .await
    }

    /// Offer another custodian's signature; unverified signatures never count
    pub async fn add_signature_at(
        &self,
        home_tx_hash: &str,
        signature: CustodianSignature,
        now: i64,
    ) -> BridgeResult<SignatureCheck> {
        let ctx = &self.ctx;
        let home_tx_hash = normalize_hash(home_tx_hash);
        let _guard = self.locks.lock(&home_tx_hash).await;

        let mut session = ctx
            .store
            .get_session(&ctx.name, &home_tx_hash)
            .await?
            .ok_or_else(|| BridgeError::Validation(format!("no signing session for {}", home_tx_hash)))?;

        let pubkey = signature.pubkey.clone();
        let check = accept_signature(&ctx.family, &mut session, signature);
        match check {
            SignatureCheck::Added => {
                debug!(
                    chain = %ctx.name,
                    home_tx_hash = %home_tx_hash,
                    pubkey = %pubkey,
                    have = session.signatures.len(),
                    need = session.custodians.m(),
                    "Signature accepted"
                );
                self.checkpoint(&session).await?;
                self.try_finalize(&mut session, now).await?;
            }
            SignatureCheck::Invalid => {
                metrics::record_error(&ctx.name, "invalid_signature");
                warn!(
                    chain = %ctx.name,
                    home_tx_hash = %home_tx_hash,
                    pubkey = %pubkey,
                    "Signature failed verification, not counted"
                );
            }
            SignatureCheck::NotCustodian => warn!(
                chain = %ctx.name,
                home_tx_hash = %home_tx_hash,
                pubkey = %pubkey,
                "Signature from a non-custodian ignored"
            ),
            SignatureCheck::Duplicate | SignatureCheck::Closed => {}
        }
        Ok(check)
    }

    pub async fn tick(&self) -> BridgeResult<()> {
        self.tick_at(Utc::now().timestamp()).await
    }

    /// Advance every stored session: pull quorum signatures, broadcast when
    /// possible, resend when the window ran out
    pub async fn tick_at(&self, now: i64) -> BridgeResult<()> {
        let ctx = &self.ctx;
        let sessions = ctx.store.list_sessions(&ctx.name).await?;
        metrics::set_open_sessions(
            &ctx.name,
            sessions.iter().filter(|s| !s.is_broadcast()).count(),
        );

        for stored in sessions {
            if let Err(e) = self.tick_session(&stored.home_tx_hash, now).await {
                metrics::record_error(&ctx.name, "signing_session");
                warn!(
                    chain = %ctx.name,
                    home_tx_hash = %stored.home_tx_hash,
                    error = %e,
                    "Signing session step failed"
                );
            }
        }
        Ok(())
    }

    async fn tick_session(&self, home_tx_hash: &str, now: i64) -> BridgeResult<()> {
        let ctx = &self.ctx;
        let _guard = self.locks.lock(home_tx_hash).await;
        let Some(mut session) = ctx.store.get_session(&ctx.name, home_tx_hash).await? else {
            return Ok(());
        };

        if let Some(broadcast) = session.broadcast_tx_hash.clone() {
            let record = ctx.store.get_pending_tx(&ctx.name, &broadcast).await?;
            // Purged (failed on chain) or never mined
            let stuck = record.map_or(true, |r| r.block_height.is_none());
            if stuck && session.expired(now) {
                warn!(
                    chain = %ctx.name,
                    home_tx_hash = %home_tx_hash,
                    tx_hash = %broadcast,
                    "Broadcast tx not confirmed within the window, resending"
                );
                self.resend_locked(&mut session, now).await?;
            }
            return Ok(());
        }

        let added = self.resend.refresh_signatures(&mut session).await?;
        if added > 0 {
            self.checkpoint(&session).await?;
        }
        if self.try_finalize(&mut session, now).await?.is_some() {
            return Ok(());
        }
        if !session.is_broadcast() && session.expired(now) {
            warn!(
                chain = %ctx.name,
                home_tx_hash = %home_tx_hash,
                have = session.signatures.len(),
                need = session.custodians.m(),
                "Quorum not reached within the window, resending"
            );
            self.resend_locked(&mut session, now).await?;
        }
        Ok(())
    }

    /// Rebuild and re-sign an outbound tx that did not make it.
    ///
    /// The previous broadcast is retired first so it is never adopted again.
    /// Returns the new external tx hash when this call broadcast.
    pub async fn resend(&self, home_tx_hash: &str) -> BridgeResult<Option<String>> {
        let ctx = &self.ctx;
        let home_tx_hash = normalize_hash(home_tx_hash);
        let _guard = self.locks.lock(&home_tx_hash).await;
        let mut session = ctx
            .store
            .get_session(&ctx.name, &home_tx_hash)
            .await?
            .ok_or_else(|| BridgeError::Validation(format!("no signing session for {}", home_tx_hash)))?;
        self.resend_locked(&mut session, Utc::now().timestamp()).await
    }

    async fn resend_locked(
        &self,
        session: &mut OutboundSigningSession,
        now: i64,
    ) -> BridgeResult<Option<String>> {
        let ctx = &self.ctx;
        if ctx
            .store
            .get_completed_outbound(&ctx.name, &session.home_tx_hash)
            .await?
            .is_some()
        {
            info!(
                chain = %ctx.name,
                home_tx_hash = %session.home_tx_hash,
                "Outbound tx already completed, dropping session instead of resending"
            );
            ctx.store
                .delete_session(&ctx.name, &session.home_tx_hash)
                .await?;
            return Ok(None);
        }
        self.require_home_tx(&session.home_tx_hash, session.kind())
            .await?;
        if let Some(previous) = session.broadcast_tx_hash.clone() {
            self.retire_broadcast(&previous).await?;
        }

        match self.resend.resend(session, now).await {
            Ok(_) => {}
            Err(e @ BridgeError::ResendExhausted { .. }) => {
                // Abandoned: stop ticking it, the counter stays for operators
                ctx.store
                    .delete_session(&ctx.name, &session.home_tx_hash)
                    .await?;
                return Err(e);
            }
            Err(e) => return Err(e),
        }
        self.sign_own(session)?;
        self.checkpoint(session).await?;
        self.try_finalize(session, now).await
    }

    /// Mark a replaced broadcast failed so `tracked_broadcast` skips it
    async fn retire_broadcast(&self, external_tx_hash: &str) -> BridgeResult<()> {
        let ctx = &self.ctx;
        let Some(mut record) = ctx.store.get_pending_tx(&ctx.name, external_tx_hash).await? else {
            return Ok(());
        };
        if record.status == TxStatus::Failed {
            return Ok(());
        }
        record.status = TxStatus::Failed;
        with_retry(&self.retry, "retire outbound tx", |_| {
            ctx.store.save_pending_tx(&ctx.name, &record)
        })
        .await?;
        debug!(chain = %ctx.name, tx_hash = %external_tx_hash, "Replaced broadcast retired");
        Ok(())
    }

    /// The home ledger must have issued `home_tx_hash` as an action of `kind`
    async fn require_home_tx(&self, home_tx_hash: &str, kind: TxKind) -> BridgeResult<()> {
        match self.ctx.home.get_home_tx(home_tx_hash).await? {
            Some(home_tx) if home_tx.kind == Some(kind) => Ok(()),
            Some(home_tx) => Err(BridgeError::Validation(format!(
                "home tx {} is {}, not {}",
                home_tx_hash,
                home_tx.kind.map_or("untyped", |k| k.as_str()),
                kind
            ))),
            None => Err(BridgeError::Validation(format!(
                "home tx {} is unknown to the home ledger",
                home_tx_hash
            ))),
        }
    }

    pub async fn session(&self, home_tx_hash: &str) -> BridgeResult<Option<OutboundSigningSession>> {
        Ok(self
            .ctx
            .store
            .get_session(&self.ctx.name, &normalize_hash(home_tx_hash))
            .await?)
    }

    pub async fn sessions(&self) -> BridgeResult<Vec<OutboundSigningSession>> {
        Ok(self.ctx.store.list_sessions(&self.ctx.name).await?)
    }

    /// Broadcast once quorum is reached inside this node's window.
    ///
    /// Returns the external tx hash when this call broadcast.
    async fn try_finalize(
        &self,
        session: &mut OutboundSigningSession,
        now: i64,
    ) -> BridgeResult<Option<String>> {
        let ctx = &self.ctx;
        if session.is_broadcast() {
            return Ok(None);
        }
        if !session.has_quorum() {
            debug!(
                chain = %ctx.name,
                home_tx_hash = %session.home_tx_hash,
                have = session.signatures.len(),
                need = session.custodians.m(),
                "Waiting for signatures"
            );
            return Ok(None);
        }
        if !session.window_open(now) {
            debug!(
                chain = %ctx.name,
                home_tx_hash = %session.home_tx_hash,
                waiting_end_time = session.waiting_end_time,
                "Quorum reached, waiting for send window"
            );
            return Ok(None);
        }

        // Another custodian's broadcast may already be on chain
        if let Some(existing) = self
            .tracked_broadcast(&session.home_tx_hash, session.kind())
            .await?
        {
            info!(
                chain = %ctx.name,
                home_tx_hash = %session.home_tx_hash,
                tx_hash = %existing,
                "Outbound tx already broadcast by another custodian"
            );
            session.broadcast_tx_hash = Some(existing);
            self.checkpoint(session).await?;
            return Ok(None);
        }

        let signed = match self.assemble(session) {
            Ok(signed) => signed,
            Err(BridgeError::SignatureInsufficient { have, need }) => {
                warn!(
                    chain = %ctx.name,
                    home_tx_hash = %session.home_tx_hash,
                    have,
                    need,
                    "Signatures insufficient at broadcast, requesting a fresh batch"
                );
                self.resend.refresh_signatures(session).await?;
                match self.assemble(session) {
                    Ok(signed) => signed,
                    Err(BridgeError::SignatureInsufficient { .. }) => {
                        self.checkpoint(session).await?;
                        return Ok(None);
                    }
                    Err(e) => return Err(e),
                }
            }
            Err(e) => return Err(e),
        };

        let kind = session.kind();
        let external_tx_hash = match ctx.reader.broadcast(&signed).await {
            Ok(hash) => hash,
            Err(e) => match (classify_error(&e.to_string()), &signed) {
                (ErrorClass::AlreadyKnown, SignedTx::Utxo { txid, .. }) => txid.clone(),
                _ => {
                    metrics::record_broadcast(&ctx.name, kind.as_str(), false);
                    return Err(e.into());
                }
            },
        };
        metrics::record_broadcast(&ctx.name, kind.as_str(), true);

        let record = self.outbound_record(session, &external_tx_hash);
        with_retry(&self.retry, "save outbound tx", |_| {
            ctx.store.save_pending_tx(&ctx.name, &record)
        })
        .await?;
        ctx.watch_hash(&external_tx_hash).await;
        ctx.queue.push(&external_tx_hash).await;

        session.broadcast_tx_hash = Some(external_tx_hash.clone());
        self.checkpoint(session).await?;

        info!(
            chain = %ctx.name,
            home_tx_hash = %session.home_tx_hash,
            tx_hash = %external_tx_hash,
            kind = %kind,
            signers = record.signers.len(),
            "Outbound tx broadcast"
        );
        Ok(Some(external_tx_hash))
    }

    /// Re-verify every counted signature, then assemble.
    /// Signatures that no longer verify are dropped from the session.
    fn assemble(&self, session: &mut OutboundSigningSession) -> BridgeResult<SignedTx> {
        let family = &self.ctx.family;
        let payload = &session.payload;
        let custodians = &session.custodians;
        session.signatures.retain(|pubkey, signature| {
            custodians.contains(pubkey) && family.verify(payload, signature)
        });
        let signatures: Vec<CustodianSignature> = session.signatures.values().cloned().collect();
        family.assemble(&session.payload, &signatures, &session.custodians)
    }

    fn outbound_record(&self, session: &OutboundSigningSession, external_tx_hash: &str) -> PendingBridgeTx {
        let asset = match &session.request.params {
            OutboundParams::Withdraw { asset, .. } => asset.clone(),
            _ => Asset::Native { decimals: 0 },
        };
        let mut record = PendingBridgeTx::new(external_tx_hash, session.kind(), asset);
        record.home_tx_hash = Some(session.home_tx_hash.clone());
        record.status = TxStatus::Doing;
        record.from = self.ctx.family.custodian_address().to_string();
        match &session.request.params {
            OutboundParams::Withdraw { to, amount, .. } => {
                record.to = to.clone();
                record.amount = *amount;
            }
            OutboundParams::Upgrade { new_contract } => record.to = new_contract.clone(),
            OutboundParams::CustodianChange { .. } => {
                record.to = self.ctx.family.custodian_address().to_string()
            }
        }
        record.signers = session.signatures.keys().cloned().collect();
        record
    }

    fn sign_own(&self, session: &mut OutboundSigningSession) -> BridgeResult<()> {
        let ctx = &self.ctx;
        if session.signatures.contains_key(ctx.signer.pubkey()) {
            return Ok(());
        }
        let signature = ctx.family.sign_one(&session.payload, ctx.signer.secret())?;
        match accept_signature(&ctx.family, session, signature) {
            SignatureCheck::Added | SignatureCheck::Duplicate | SignatureCheck::Closed => Ok(()),
            other => Err(BridgeError::Validation(format!(
                "own signature rejected: {:?}",
                other
            ))),
        }
    }

    /// Outbound tx already stored for this home tx, e.g. seen by the scanner
    async fn tracked_broadcast(
        &self,
        home_tx_hash: &str,
        kind: TxKind,
    ) -> BridgeResult<Option<String>> {
        let ctx = &self.ctx;
        let tracked = ctx
            .store
            .find_pending_by_home_hash(&ctx.name, home_tx_hash)
            .await?;
        Ok(tracked
            .into_iter()
            .find(|r| r.kind == kind && r.status != TxStatus::Failed)
            .map(|r| r.external_tx_hash))
    }

    async fn checkpoint(&self, session: &OutboundSigningSession) -> BridgeResult<()> {
        let ctx = &self.ctx;
        with_retry(&self.retry, "save signing session", |_| {
            ctx.store.save_session(&ctx.name, session)
        })
        .await?;
        Ok(())
    }
}
