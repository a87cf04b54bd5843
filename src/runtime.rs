//! Per-chain task wiring and startup recovery
//!
//! Each enabled chain gets its own context and three tasks: the block
//! scanner, the confirmation task and the signing coordinator. Chains share
//! nothing but the store, the home-ledger client and the node key.

use std::sync::Arc;

use eyre::{eyre, Result, WrapErr};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::address_codec::HomeAddressCodec;
use crate::bounded_cache::BoundedHashCache;
use crate::chain::rpc::JsonRpcChainClient;
use crate::chain::{AccountFamily, ChainFamily, ChainReader, UtxoFamily};
use crate::config::{BridgeTuning, ChainConfig, Config, FamilyKind};
use crate::confirmation::{ConfirmationTask, UnconfirmedQueue};
use crate::context::{ChainContext, ChainStatus, NodeSigner};
use crate::db::BridgeStore;
use crate::error::BridgeResult;
use crate::home::http::HttpHomeLedger;
use crate::home::HomeLedger;
use crate::metrics;
use crate::watchers::BlockScanner;
use crate::writers::SigningCoordinator;

/// What startup recovery put back in memory
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    pub queued: usize,
    pub watched: usize,
}

/// Build the context of one configured chain
pub fn chain_context(
    chain: &ChainConfig,
    reader: Arc<dyn ChainReader>,
    home: Arc<dyn HomeLedger>,
    store: Arc<dyn BridgeStore>,
    codec: HomeAddressCodec,
    signer: NodeSigner,
    tuning: &BridgeTuning,
) -> Result<ChainContext> {
    let family = match chain.family {
        FamilyKind::Account => ChainFamily::Account(
            AccountFamily::new(&chain.multisig_address)
                .wrap_err_with(|| format!("{}: invalid custodian contract", chain.name))?,
        ),
        FamilyKind::Utxo => ChainFamily::Utxo(
            UtxoFamily::new(&chain.multisig_address, chain.network)
                .wrap_err_with(|| format!("{}: invalid custodian address", chain.name))?,
        ),
    };

    Ok(ChainContext {
        name: chain.name.clone(),
        chain_id: chain.chain_id,
        family,
        reader,
        home,
        store,
        queue: UnconfirmedQueue::new(),
        watch: Mutex::new(BoundedHashCache::default()),
        tokens: chain.tokens.clone(),
        codec,
        signer,
        settings: chain.settings.clone(),
        tuning: tuning.clone(),
        status: ChainStatus::default(),
    })
}

/// One external chain and its tasks
#[derive(Clone)]
pub struct ChainRuntime {
    pub ctx: Arc<ChainContext>,
    pub coordinator: Arc<SigningCoordinator>,
}

impl ChainRuntime {
    pub fn new(ctx: ChainContext) -> Self {
        let ctx = Arc::new(ctx);
        let coordinator = Arc::new(SigningCoordinator::new(ctx.clone()));
        Self { ctx, coordinator }
    }

    pub fn name(&self) -> &str {
        &self.ctx.name
    }

    /// Reload the unconfirmed queue and the watch set from the store.
    ///
    /// Records already marked deleted are queued too; they still wait for
    /// their deletion height. Opens the queue's load barrier.
    pub async fn recover(&self) -> Result<RecoveryStats> {
        let ctx = &self.ctx;
        let pending = ctx
            .store
            .list_pending_txs(&ctx.name)
            .await
            .wrap_err("Failed to load pending txs")?;
        let sessions = ctx
            .store
            .list_sessions(&ctx.name)
            .await
            .wrap_err("Failed to load signing sessions")?;

        let mut watched = 0;
        {
            let mut watch = ctx.watch.lock().await;
            let broadcasts = sessions
                .iter()
                .filter_map(|s| s.broadcast_tx_hash.as_deref())
                .chain(
                    pending
                        .iter()
                        .filter(|p| !p.is_inbound())
                        .map(|p| p.external_tx_hash.as_str()),
                );
            for hash in broadcasts {
                if !watch.contains(hash) {
                    watch.insert(hash);
                    watched += 1;
                }
            }
        }

        let queued = ctx
            .queue
            .load(pending.iter().map(|p| p.external_tx_hash.clone()))
            .await;
        metrics::set_queue_depth(&ctx.name, queued);
        metrics::set_open_sessions(&ctx.name, sessions.len());

        info!(
            chain = %ctx.name,
            queued,
            watched,
            sessions = sessions.len(),
            "Recovered pending state"
        );
        Ok(RecoveryStats { queued, watched })
    }

    /// Mark a record for deletion once the home ledger reaches
    /// `deletion_height`. Returns false when no such record is stored.
    pub async fn mark_deleted(
        &self,
        external_tx_hash: &str,
        deletion_height: u64,
    ) -> BridgeResult<bool> {
        let ctx = &self.ctx;
        let Some(mut record) = ctx.store.get_pending_tx(&ctx.name, external_tx_hash).await? else {
            return Ok(false);
        };
        record.marked_deleted = true;
        record.deletion_height = deletion_height;
        ctx.store.save_pending_tx(&ctx.name, &record).await?;
        ctx.queue.push(external_tx_hash).await;
        info!(
            chain = %ctx.name,
            tx_hash = %external_tx_hash,
            deletion_height,
            "Pending tx marked for deletion"
        );
        Ok(true)
    }

    fn spawn(&self, tasks: &mut JoinSet<Result<()>>, shutdown: &watch::Receiver<bool>) {
        let scanner = BlockScanner::new(self.ctx.clone());
        let confirmation = ConfirmationTask::new(self.ctx.clone(), self.coordinator.clone());
        let coordinator = self.coordinator.clone();

        let rx = shutdown.clone();
        tasks.spawn(async move { scanner.run(rx).await });
        let rx = shutdown.clone();
        tasks.spawn(async move { confirmation.run(rx).await });
        let rx = shutdown.clone();
        tasks.spawn(async move { coordinator.run(rx).await });
    }
}

/// All chain runtimes of this node
pub struct BridgeRuntime {
    chains: Vec<ChainRuntime>,
}

impl BridgeRuntime {
    pub fn new(chains: Vec<ChainRuntime>) -> Self {
        Self { chains }
    }

    /// Build a runtime for every enabled chain in `config`
    pub fn from_config(config: &Config, store: Arc<dyn BridgeStore>) -> Result<Self> {
        let signer = NodeSigner::new(config.node.secret_key()?);
        let home: Arc<dyn HomeLedger> = Arc::new(HttpHomeLedger::new(&config.home.rpc_url)?);

        let mut chains = Vec::new();
        for chain in config.enabled_chains() {
            let reader: Arc<dyn ChainReader> =
                Arc::new(JsonRpcChainClient::new(chain.adapter_urls.clone())?);
            let codec = HomeAddressCodec::new(config.home.address_prefix.clone(), config.home.chain_id);
            let ctx = chain_context(
                chain,
                reader,
                home.clone(),
                store.clone(),
                codec,
                signer.clone(),
                &config.tuning,
            )?;
            info!(
                chain = %chain.name,
                chain_id = chain.chain_id,
                family = ctx.family.name(),
                custodian_address = %ctx.family.custodian_address(),
                tokens = chain.tokens.len(),
                "Chain runtime created"
            );
            chains.push(ChainRuntime::new(ctx));
        }

        if chains.is_empty() {
            return Err(eyre!("no enabled chains configured"));
        }
        info!(
            chains = chains.len(),
            pubkey = %signer.pubkey(),
            "Bridge runtime created"
        );
        Ok(Self { chains })
    }

    pub fn chains(&self) -> &[ChainRuntime] {
        &self.chains
    }

    pub fn chain(&self, name: &str) -> Option<&ChainRuntime> {
        self.chains.iter().find(|c| c.name() == name)
    }

    pub fn chain_by_id(&self, chain_id: u16) -> Option<&ChainRuntime> {
        self.chains.iter().find(|c| c.ctx.chain_id == chain_id)
    }

    /// Recover every chain, then run all tasks until shutdown or the first
    /// task failure
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        for chain in &self.chains {
            chain
                .recover()
                .await
                .wrap_err_with(|| format!("{}: startup recovery failed", chain.name()))?;
        }

        let mut tasks = JoinSet::new();
        for chain in &self.chains {
            chain.spawn(&mut tasks, &shutdown);
        }
        info!(tasks = tasks.len(), "Bridge tasks started");

        tokio::select! {
            _ = shutdown.changed() => {
                info!("Shutdown signal received, waiting for running ticks");
                while let Some(joined) = tasks.join_next().await {
                    if let Ok(Err(e)) = joined {
                        warn!(error = %e, "Task stopped with error during shutdown");
                    }
                }
                Ok(())
            }
            maybe_done = tasks.join_next() => {
                tasks.abort_all();
                match maybe_done {
                    Some(Ok(Ok(()))) if *shutdown.borrow() => Ok(()),
                    Some(Ok(Ok(()))) => {
                        error!("A bridge task exited unexpectedly without error");
                        Err(eyre!("bridge task exited unexpectedly"))
                    }
                    Some(Ok(Err(e))) => {
                        error!("A bridge task stopped with error: {:?}", e);
                        Err(e)
                    }
                    Some(Err(e)) => {
                        error!("A bridge task panicked: {:?}", e);
                        Err(eyre!("bridge task panicked: {}", e))
                    }
                    None => Err(eyre!("no bridge tasks were started")),
                }
            }
        }
    }
}
