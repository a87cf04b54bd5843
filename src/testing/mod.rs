//! In-process fakes for integration tests
//!
//! `MockChain` is a scriptable external chain with reorgs and a broadcast
//! log, `MockHomeLedger` records every callback and dedupes credits the way
//! the real ledger does. `NodeBuilder` wires them into a `ChainRuntime`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bitcoin::{Address, Network, OutPoint, TxOut};
use secp256k1::{PublicKey, SecretKey, SECP256K1};

use crate::address_codec::{HomeAddressCodec, DEFAULT_PREFIX};
use crate::chain::utxo::multisig_script;
use crate::chain::{Block, BlockHeader, ChainReader, ChainTx, Receipt, SignedTx, TxLog, Unspent};
use crate::config::{BridgeTuning, ChainConfig, ChainSettings, FamilyKind};
use crate::context::NodeSigner;
use crate::db::memory::MemoryStore;
use crate::error::{BridgeResult, CallbackError, ChainError};
use crate::hash::{keccak256, normalize_hash};
use crate::home::{DepositNotice, FeeNotice, HomeLedger, HomeTx, OutboundConfirmation};
use crate::runtime::{chain_context, ChainRuntime};
use crate::types::{CustodianSet, CustodianSignature, RegisteredToken, TxKind};

/// Custodian contract address used by account-chain tests
pub const ACCOUNT_MULTISIG: &str = "0x5fbdb2315678afecb367f032d93f642f64180aa3";

/// Home-ledger chain id used by tests
pub const HOME_CHAIN_ID: u16 = 9;

// ============================================================================
// Keys and addresses
// ============================================================================

/// Deterministic secret key; `seed` must be non-zero
pub fn secret_key(seed: u8) -> SecretKey {
    SecretKey::from_slice(&[seed; 32]).expect("non-zero seed is a valid key")
}

pub fn pubkey_hex(key: &SecretKey) -> String {
    hex::encode(PublicKey::from_secret_key(SECP256K1, key).serialize())
}

/// `n` custodian keys with seeds 1..=n
pub fn custodian_keys(n: u8) -> Vec<SecretKey> {
    (1..=n).map(secret_key).collect()
}

pub fn custodian_set(keys: &[SecretKey]) -> CustodianSet {
    CustodianSet::new(keys.iter().map(pubkey_hex))
}

pub fn home_codec() -> HomeAddressCodec {
    HomeAddressCodec::new(DEFAULT_PREFIX, HOME_CHAIN_ID)
}

/// A valid home-ledger account address
pub fn home_address(seed: u8) -> String {
    home_codec().encode(1, &[seed; 20])
}

/// P2WSH address of the custodian set on `network`
pub fn utxo_multisig_address(custodians: &CustodianSet, network: Network) -> String {
    let script = multisig_script(custodians).expect("custodian set fits a multisig script");
    Address::p2wsh(&script, network).to_string()
}

/// Fake account-chain tx hash derived from `seed`
pub fn tx_hash(seed: &str) -> String {
    format!("0x{}", hex::encode(keccak256(seed.as_bytes())))
}

// ============================================================================
// MockChain
// ============================================================================

#[derive(Default)]
struct MockChainState {
    blocks: BTreeMap<u64, Block>,
    generation: u64,
    logs: HashMap<String, Vec<TxLog>>,
    reverted: HashSet<String>,
    outputs: HashMap<OutPoint, TxOut>,
    unspent: Vec<Unspent>,
    fee_rate: u64,
    broadcasts: Vec<SignedTx>,
    unmined: Vec<SignedTx>,
    fail_rpc: bool,
    reject_broadcast: Option<String>,
}

pub struct MockChain {
    state: Mutex<MockChainState>,
}

impl Default for MockChain {
    fn default() -> Self {
        Self::new()
    }
}

impl MockChain {
    /// A chain holding only a genesis block at height 0
    pub fn new() -> Self {
        let chain = Self {
            state: Mutex::new(MockChainState {
                fee_rate: 10,
                ..Default::default()
            }),
        };
        chain.push_block(Vec::new());
        chain
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockChainState> {
        self.state.lock().expect("mock chain lock poisoned")
    }

    pub fn tip(&self) -> u64 {
        self.lock().blocks.keys().next_back().copied().unwrap_or(0)
    }

    pub fn header(&self, height: u64) -> Option<BlockHeader> {
        self.lock().blocks.get(&height).map(|b| b.header.clone())
    }

    /// Append a block with `txs` on top of the current tip
    pub fn push_block(&self, txs: Vec<ChainTx>) -> BlockHeader {
        let mut state = self.lock();
        let height = state.blocks.keys().next_back().map_or(0, |h| h + 1);
        let parent_hash = state
            .blocks
            .get(&height.wrapping_sub(1))
            .map(|b| b.header.hash.clone())
            .unwrap_or_default();
        let header = BlockHeader {
            height,
            hash: format!("blk-{}-{}", height, state.generation),
            parent_hash,
            time: 1_700_000_000 + height * 12,
        };
        for tx in &txs {
            if let ChainTx::Utxo(utxo) = tx {
                let txid = utxo.tx.compute_txid();
                for (vout, out) in utxo.tx.output.iter().enumerate() {
                    state.outputs.insert(OutPoint::new(txid, vout as u32), out.clone());
                }
            }
        }
        state.blocks.insert(
            height,
            Block {
                header: header.clone(),
                txs,
            },
        );
        header
    }

    /// Append `count` empty blocks, returning the new tip
    pub fn advance(&self, count: u64) -> u64 {
        for _ in 0..count {
            self.push_block(Vec::new());
        }
        self.tip()
    }

    /// Drop every block from `height` up; later blocks get fresh hashes
    pub fn reorg_from(&self, height: u64) {
        let mut state = self.lock();
        let _ = state.blocks.split_off(&height);
        state.generation += 1;
    }

    /// Extra logs the receipt of `tx_hash` carries
    pub fn add_logs(&self, tx_hash: &str, logs: Vec<TxLog>) {
        self.lock()
            .logs
            .entry(tx_hash.to_lowercase())
            .or_default()
            .extend(logs);
    }

    pub fn set_reverted(&self, tx_hash: &str) {
        self.lock().reverted.insert(tx_hash.to_lowercase());
    }

    /// Register an output spent by a later UTXO transaction
    pub fn add_output(&self, outpoint: OutPoint, out: TxOut) {
        self.lock().outputs.insert(outpoint, out);
    }

    pub fn prevout(&self, outpoint: &OutPoint) -> Option<TxOut> {
        self.lock().outputs.get(outpoint).cloned()
    }

    pub fn set_unspent(&self, unspent: Vec<Unspent>) {
        self.lock().unspent = unspent;
    }

    pub fn set_fee_rate(&self, rate: u64) {
        self.lock().fee_rate = rate;
    }

    pub fn set_fail_rpc(&self, fail: bool) {
        self.lock().fail_rpc = fail;
    }

    pub fn set_reject_broadcast(&self, reason: Option<&str>) {
        self.lock().reject_broadcast = reason.map(str::to_string);
    }

    /// Every accepted broadcast, in order
    pub fn broadcasts(&self) -> Vec<SignedTx> {
        self.lock().broadcasts.clone()
    }

    /// Mine all broadcasts not yet in a block. `logs` supplies the receipt
    /// logs of account-family calls.
    pub fn mine_broadcasts(&self, logs: impl Fn(&SignedTx) -> Vec<TxLog>) -> BlockHeader {
        let unmined = std::mem::take(&mut self.lock().unmined);
        let mut txs = Vec::new();
        for signed in unmined {
            let hash = signed_hash(&signed);
            self.add_logs(&hash, logs(&signed));
            match &signed {
                SignedTx::Account { to, data, .. } => txs.push(ChainTx::Account(crate::chain::AccountTx {
                    hash,
                    from: "0x00000000000000000000000000000000000000aa".to_string(),
                    to: Some(to.clone()),
                    value: 0,
                    input: data.clone(),
                })),
                SignedTx::Utxo { raw, .. } => {
                    let Ok(tx) = bitcoin::consensus::deserialize::<bitcoin::Transaction>(raw) else {
                        continue;
                    };
                    let prevouts = tx
                        .input
                        .iter()
                        .map(|input| self.prevout(&input.previous_output))
                        .collect();
                    txs.push(ChainTx::Utxo(crate::chain::UtxoTx { tx, prevouts }));
                }
            }
        }
        self.push_block(txs)
    }

    fn check_rpc(&self) -> Result<(), ChainError> {
        if self.lock().fail_rpc {
            return Err(ChainError::Rpc("connection refused".to_string()));
        }
        Ok(())
    }
}

fn signed_hash(signed: &SignedTx) -> String {
    match signed {
        SignedTx::Account { data, tx_key, .. } => {
            let mut preimage = tx_key.as_bytes().to_vec();
            preimage.extend_from_slice(data);
            format!("0x{}", hex::encode(keccak256(&preimage)))
        }
        SignedTx::Utxo { txid, .. } => txid.clone(),
    }
}

#[async_trait]
impl ChainReader for MockChain {
    async fn get_tip_height(&self) -> Result<u64, ChainError> {
        self.check_rpc()?;
        Ok(self.tip())
    }

    async fn get_header(&self, height: u64) -> Result<Option<BlockHeader>, ChainError> {
        self.check_rpc()?;
        Ok(self.header(height))
    }

    async fn get_block(&self, height: u64) -> Result<Block, ChainError> {
        self.check_rpc()?;
        self.lock()
            .blocks
            .get(&height)
            .cloned()
            .ok_or_else(|| ChainError::NotFound(format!("block {}", height)))
    }

    async fn get_transaction_receipt(&self, hash: &str) -> Result<Option<Receipt>, ChainError> {
        self.check_rpc()?;
        let state = self.lock();
        let wanted = hash.to_lowercase();
        for block in state.blocks.values() {
            if block.txs.iter().any(|tx| tx.hash().to_lowercase() == wanted) {
                return Ok(Some(Receipt {
                    tx_hash: hash.to_string(),
                    block_height: block.header.height,
                    block_hash: block.header.hash.clone(),
                    success: !state.reverted.contains(&wanted),
                    logs: state.logs.get(&wanted).cloned().unwrap_or_default(),
                }));
            }
        }
        Ok(None)
    }

    async fn estimate_fee_rate(&self) -> Result<u64, ChainError> {
        self.check_rpc()?;
        Ok(self.lock().fee_rate)
    }

    async fn list_unspent(&self, _address: &str) -> Result<Vec<Unspent>, ChainError> {
        self.check_rpc()?;
        Ok(self.lock().unspent.clone())
    }

    async fn broadcast(&self, tx: &SignedTx) -> Result<String, ChainError> {
        self.check_rpc()?;
        let mut state = self.lock();
        if let Some(reason) = &state.reject_broadcast {
            return Err(ChainError::Rejected(reason.clone()));
        }
        let hash = signed_hash(tx);
        // A tx dropped by a reorg can be broadcast again
        let pending = state.unmined.iter().any(|b| signed_hash(b) == hash);
        let mined = state
            .blocks
            .values()
            .any(|block| block.txs.iter().any(|t| t.hash().eq_ignore_ascii_case(&hash)));
        if pending || mined {
            return Err(ChainError::Rejected("already known".to_string()));
        }
        state.broadcasts.push(tx.clone());
        state.unmined.push(tx.clone());
        Ok(hash)
    }
}

// ============================================================================
// MockHomeLedger
// ============================================================================

struct MockHomeState {
    custodians: CustodianSet,
    tip: u64,
    pending_deposits: Vec<DepositNotice>,
    credited: Vec<DepositNotice>,
    outbound: Vec<OutboundConfirmation>,
    fees: Vec<FeeNotice>,
    quorum: HashMap<String, Vec<CustodianSignature>>,
    home_txs: HashMap<String, TxKind>,
    fail_callbacks: bool,
    callback_attempts: u32,
}

pub struct MockHomeLedger {
    state: Mutex<MockHomeState>,
}

impl MockHomeLedger {
    pub fn new(custodians: CustodianSet) -> Self {
        Self {
            state: Mutex::new(MockHomeState {
                custodians,
                tip: 100,
                pending_deposits: Vec::new(),
                credited: Vec::new(),
                outbound: Vec::new(),
                fees: Vec::new(),
                quorum: HashMap::new(),
                home_txs: HashMap::new(),
                fail_callbacks: false,
                callback_attempts: 0,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockHomeState> {
        self.state.lock().expect("mock home lock poisoned")
    }

    pub fn set_custodians(&self, custodians: CustodianSet) {
        self.lock().custodians = custodians;
    }

    pub fn set_tip(&self, tip: u64) {
        self.lock().tip = tip;
    }

    pub fn tip(&self) -> u64 {
        self.lock().tip
    }

    /// Callbacks fail with a non-duplicate error while set
    pub fn set_fail_callbacks(&self, fail: bool) {
        self.lock().fail_callbacks = fail;
    }

    pub fn callback_attempts(&self) -> u32 {
        self.lock().callback_attempts
    }

    /// Make `signature` available to quorum requests for `home_tx_hash`
    pub fn add_quorum_signature(&self, home_tx_hash: &str, signature: CustodianSignature) {
        self.lock()
            .quorum
            .entry(home_tx_hash.to_lowercase())
            .or_default()
            .push(signature);
    }

    /// Register a home-ledger transaction requiring an outbound action
    pub fn add_home_tx(&self, home_tx_hash: &str, kind: TxKind) {
        self.lock()
            .home_txs
            .insert(normalize_hash(home_tx_hash), kind);
    }

    pub fn pending_deposits(&self) -> Vec<DepositNotice> {
        self.lock().pending_deposits.clone()
    }

    pub fn credited(&self) -> Vec<DepositNotice> {
        self.lock().credited.clone()
    }

    pub fn outbound(&self) -> Vec<OutboundConfirmation> {
        self.lock().outbound.clone()
    }

    pub fn fees(&self) -> Vec<FeeNotice> {
        self.lock().fees.clone()
    }

    fn callback(&self) -> Result<std::sync::MutexGuard<'_, MockHomeState>, CallbackError> {
        let mut state = self.lock();
        state.callback_attempts += 1;
        if state.fail_callbacks {
            return Err(CallbackError::Other("home ledger unavailable".to_string()));
        }
        Ok(state)
    }
}

#[async_trait]
impl HomeLedger for MockHomeLedger {
    async fn submit_pending_deposit(&self, notice: &DepositNotice) -> Result<(), CallbackError> {
        self.lock().pending_deposits.push(notice.clone());
        Ok(())
    }

    async fn submit_confirmed_deposit(
        &self,
        notice: &DepositNotice,
    ) -> Result<String, CallbackError> {
        let mut state = self.callback()?;
        if state
            .credited
            .iter()
            .any(|c| c.external_tx_hash == notice.external_tx_hash)
        {
            return Err(CallbackError::Duplicate(notice.external_tx_hash.clone()));
        }
        state.credited.push(notice.clone());
        Ok(hex::encode(keccak256(notice.external_tx_hash.as_bytes())))
    }

    async fn submit_confirmed_outbound(
        &self,
        confirmation: &OutboundConfirmation,
    ) -> Result<(), CallbackError> {
        let mut state = self.callback()?;
        if state
            .outbound
            .iter()
            .any(|c| c.home_tx_hash == confirmation.home_tx_hash && c.kind == confirmation.kind)
        {
            return Err(CallbackError::Duplicate(confirmation.home_tx_hash.clone()));
        }
        state.outbound.push(confirmation.clone());
        Ok(())
    }

    async fn submit_withdrawal_fee(&self, notice: &FeeNotice) -> Result<(), CallbackError> {
        let mut state = self.callback()?;
        if state
            .fees
            .iter()
            .any(|f| f.external_tx_hash == notice.external_tx_hash)
        {
            return Err(CallbackError::Duplicate(notice.external_tx_hash.clone()));
        }
        state.fees.push(notice.clone());
        Ok(())
    }

    async fn get_home_tx(&self, home_tx_hash: &str) -> Result<Option<HomeTx>, CallbackError> {
        let state = self.lock();
        if let Some(kind) = state.home_txs.get(&normalize_hash(home_tx_hash)) {
            return Ok(Some(HomeTx {
                hash: home_tx_hash.to_string(),
                height: state.tip,
                kind: Some(*kind),
            }));
        }
        Ok(state
            .credited
            .iter()
            .find(|c| hex::encode(keccak256(c.external_tx_hash.as_bytes())) == home_tx_hash)
            .map(|_| HomeTx {
                hash: home_tx_hash.to_string(),
                height: state.tip,
                kind: None,
            }))
    }

    async fn get_home_tip_height(&self) -> Result<u64, CallbackError> {
        Ok(self.lock().tip)
    }

    async fn get_current_custodian_set(&self) -> Result<CustodianSet, CallbackError> {
        Ok(self.lock().custodians.clone())
    }

    async fn request_quorum_signatures(
        &self,
        home_tx_hash: &str,
        _chain_id: u16,
    ) -> Result<Vec<CustodianSignature>, CallbackError> {
        Ok(self
            .lock()
            .quorum
            .get(&home_tx_hash.to_lowercase())
            .cloned()
            .unwrap_or_default())
    }
}

// ============================================================================
// Node builder
// ============================================================================

/// A chain runtime wired to in-process fakes
pub struct TestNode {
    pub runtime: ChainRuntime,
    pub chain: Arc<MockChain>,
    pub home: Arc<MockHomeLedger>,
    pub store: Arc<MemoryStore>,
}

pub struct NodeBuilder {
    config: ChainConfig,
    key: SecretKey,
    tuning: BridgeTuning,
    chain: Option<Arc<MockChain>>,
    home: Option<Arc<MockHomeLedger>>,
    store: Option<Arc<MemoryStore>>,
}

impl NodeBuilder {
    /// Account-family node signing with `key`
    pub fn account(key: SecretKey) -> Self {
        Self::with_family(key, FamilyKind::Account, ACCOUNT_MULTISIG.to_string())
    }

    /// UTXO-family node; `multisig` must be the P2WSH address of the
    /// custodian set
    pub fn utxo(key: SecretKey, multisig: String) -> Self {
        let mut builder = Self::with_family(key, FamilyKind::Utxo, multisig);
        builder.config.network = Network::Regtest;
        builder
    }

    fn with_family(key: SecretKey, family: FamilyKind, multisig: String) -> Self {
        let mut settings = ChainSettings::defaults_for(family);
        settings.deposit_confirmations = 2;
        settings.withdraw_confirmations = 2;
        Self {
            config: ChainConfig {
                name: "test".to_string(),
                chain_id: 101,
                family,
                adapter_urls: Vec::new(),
                multisig_address: multisig,
                network: Network::Regtest,
                tokens: Vec::new(),
                settings,
                enabled: true,
            },
            key,
            tuning: BridgeTuning::default(),
            chain: None,
            home: None,
            store: None,
        }
    }

    pub fn chain(mut self, chain: Arc<MockChain>) -> Self {
        self.chain = Some(chain);
        self
    }

    pub fn home(mut self, home: Arc<MockHomeLedger>) -> Self {
        self.home = Some(home);
        self
    }

    pub fn store(mut self, store: Arc<MemoryStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn tokens(mut self, tokens: Vec<RegisteredToken>) -> Self {
        self.config.tokens = tokens;
        self
    }

    pub fn settings(mut self, f: impl FnOnce(&mut ChainSettings)) -> Self {
        f(&mut self.config.settings);
        self
    }

    pub fn tuning(mut self, f: impl FnOnce(&mut BridgeTuning)) -> Self {
        f(&mut self.tuning);
        self
    }

    pub fn build(self) -> BridgeResult<TestNode> {
        let chain = self.chain.unwrap_or_default();
        let home = self
            .home
            .unwrap_or_else(|| Arc::new(MockHomeLedger::new(custodian_set(&[self.key]))));
        let store = self.store.unwrap_or_default();

        let ctx = chain_context(
            &self.config,
            chain.clone(),
            home.clone(),
            store.clone(),
            home_codec(),
            NodeSigner::new(self.key),
            &self.tuning,
        )
        .map_err(|e| crate::error::BridgeError::Config(format!("{:#}", e)))?;

        Ok(TestNode {
            runtime: ChainRuntime::new(ctx),
            chain,
            home,
            store,
        })
    }
}
