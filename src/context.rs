//! Per-chain context shared by the scanner, confirmation task and signing
//! coordinator of one external chain. Nothing in here is shared between chains.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use secp256k1::{PublicKey, SecretKey, SECP256K1};
use tokio::sync::Mutex;

use crate::address_codec::HomeAddressCodec;
use crate::bounded_cache::BoundedHashCache;
use crate::chain::{ChainFamily, ChainReader};
use crate::confirmation::queue::UnconfirmedQueue;
use crate::config::{BridgeTuning, ChainSettings};
use crate::db::BridgeStore;
use crate::home::HomeLedger;
use crate::types::RegisteredToken;

/// This node's custodian key
#[derive(Clone)]
pub struct NodeSigner {
    secret: SecretKey,
    pubkey: String,
}

impl NodeSigner {
    pub fn new(secret: SecretKey) -> Self {
        let pubkey = hex::encode(PublicKey::from_secret_key(SECP256K1, &secret).serialize());
        Self { secret, pubkey }
    }

    pub fn secret(&self) -> &SecretKey {
        &self.secret
    }

    /// Compressed public key, lowercase hex
    pub fn pubkey(&self) -> &str {
        &self.pubkey
    }
}

/// Custom Debug that redacts the secret key.
impl fmt::Debug for NodeSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeSigner")
            .field("secret", &"<redacted>")
            .field("pubkey", &self.pubkey)
            .finish()
    }
}

/// Lock-free status counters read by the status API
#[derive(Debug, Default)]
pub struct ChainStatus {
    last_scanned: AtomicU64,
    is_custodian: AtomicBool,
    /// Set once local headers were dropped after losing custodian status
    headers_purged: AtomicBool,
}

impl ChainStatus {
    pub fn last_scanned(&self) -> u64 {
        self.last_scanned.load(Ordering::Relaxed)
    }

    pub fn set_last_scanned(&self, height: u64) {
        self.last_scanned.store(height, Ordering::Relaxed);
    }

    pub fn is_custodian(&self) -> bool {
        self.is_custodian.load(Ordering::Relaxed)
    }

    pub fn set_custodian(&self, value: bool) {
        self.is_custodian.store(value, Ordering::Relaxed);
        if value {
            self.headers_purged.store(false, Ordering::Relaxed);
        }
    }

    /// Returns true the first time it is called after losing custodian status
    pub fn take_headers_purge(&self) -> bool {
        !self.headers_purged.swap(true, Ordering::Relaxed)
    }
}

pub struct ChainContext {
    pub name: String,
    /// Home-ledger id of this chain
    pub chain_id: u16,
    pub family: ChainFamily,
    pub reader: Arc<dyn ChainReader>,
    pub home: Arc<dyn HomeLedger>,
    pub store: Arc<dyn BridgeStore>,
    pub queue: UnconfirmedQueue,
    /// External tx hashes this node broadcast
    pub watch: Mutex<BoundedHashCache>,
    pub tokens: Vec<RegisteredToken>,
    pub codec: HomeAddressCodec,
    pub signer: NodeSigner,
    pub settings: ChainSettings,
    pub tuning: BridgeTuning,
    pub status: ChainStatus,
}

impl ChainContext {
    pub fn token(&self, contract: &str) -> Option<&RegisteredToken> {
        let contract = contract.to_lowercase();
        self.tokens.iter().find(|t| t.contract == contract)
    }

    pub async fn is_watched(&self, hash: &str) -> bool {
        self.watch.lock().await.contains(hash)
    }

    pub async fn watch_hash(&self, hash: &str) {
        self.watch.lock().await.insert(hash);
    }
}

impl fmt::Debug for ChainContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainContext")
            .field("name", &self.name)
            .field("chain_id", &self.chain_id)
            .field("family", &self.family.name())
            .field("signer", &self.signer)
            .finish_non_exhaustive()
    }
}
