//! External chain adapter contract and chain-family dispatch
//!
//! The RPC wire protocol of each external chain lives outside this crate; the
//! engine depends only on [`ChainReader`]. Everything that must be derived
//! identically by every custodian (payload layout, fee, UTXO selection,
//! signature checks) lives in the family modules behind [`ChainFamily`].

use async_trait::async_trait;
use secp256k1::SecretKey;
use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, BridgeResult, ChainError};
use crate::types::{
    CustodianSet, CustodianSignature, OutboundRequest, PendingBridgeTx, TxKind, TxStatus,
};

pub mod account;
pub mod rpc;
pub mod utxo;

pub use account::AccountFamily;
pub use utxo::UtxoFamily;

/// Header of an external-chain block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub height: u64,
    pub hash: String,
    pub parent_hash: String,
    /// Block timestamp in unix seconds
    pub time: u64,
}

#[derive(Debug, Clone)]
pub struct Block {
    pub header: BlockHeader,
    pub txs: Vec<ChainTx>,
}

/// A transaction as delivered by the adapter, in its family's native shape
#[derive(Debug, Clone)]
pub enum ChainTx {
    Account(AccountTx),
    Utxo(UtxoTx),
}

impl ChainTx {
    pub fn hash(&self) -> String {
        match self {
            ChainTx::Account(tx) => tx.hash.clone(),
            ChainTx::Utxo(tx) => tx.tx.compute_txid().to_string(),
        }
    }
}

/// Account-model transaction (EVM style)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountTx {
    pub hash: String,
    pub from: String,
    pub to: Option<String>,
    pub value: u128,
    pub input: Vec<u8>,
}

/// UTXO-model transaction together with the outputs its inputs spend.
///
/// `prevouts[i]` is the output spent by `tx.input[i]`, `None` when the
/// adapter could not resolve it (coinbase).
#[derive(Debug, Clone)]
pub struct UtxoTx {
    pub tx: bitcoin::Transaction,
    pub prevouts: Vec<Option<bitcoin::TxOut>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxLog {
    pub address: String,
    pub topics: Vec<[u8; 32]>,
    pub data: Vec<u8>,
}

/// Inclusion and execution result of a transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub tx_hash: String,
    pub block_height: u64,
    pub block_hash: String,
    pub success: bool,
    #[serde(default)]
    pub logs: Vec<TxLog>,
}

/// Spendable custodian output (UTXO family)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Unspent {
    pub txid: String,
    pub vout: u32,
    pub value: u64,
}

/// Fully signed outbound transaction ready for broadcast
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum SignedTx {
    /// Call into the custodian contract; the adapter wraps it in a transaction
    /// from the node's fee-paying account.
    Account {
        to: String,
        #[serde(with = "hex_bytes")]
        data: Vec<u8>,
        tx_key: String,
    },
    Utxo {
        txid: String,
        #[serde(with = "hex_bytes")]
        raw: Vec<u8>,
    },
}

/// Read and broadcast access to one external chain
#[async_trait]
pub trait ChainReader: Send + Sync {
    async fn get_tip_height(&self) -> Result<u64, ChainError>;

    async fn get_header(&self, height: u64) -> Result<Option<BlockHeader>, ChainError>;

    async fn get_block(&self, height: u64) -> Result<Block, ChainError>;

    async fn get_transaction_receipt(&self, hash: &str) -> Result<Option<Receipt>, ChainError>;

    /// Fee rate in the chain's smallest unit (sat/vB for UTXO chains, wei/gas otherwise)
    async fn estimate_fee_rate(&self) -> Result<u64, ChainError>;

    /// Unspent outputs of `address`; account chains return an empty list
    async fn list_unspent(&self, address: &str) -> Result<Vec<Unspent>, ChainError>;

    /// Broadcast and return the external transaction hash
    async fn broadcast(&self, tx: &SignedTx) -> Result<String, ChainError>;
}

/// Unsigned outbound payload every custodian derives independently
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum UnsignedPayload {
    Account(account::AccountPayload),
    Utxo(utxo::UtxoPayload),
}

/// Chain state an outbound payload is derived from
#[derive(Debug, Clone, Copy)]
pub struct BuildContext<'a> {
    pub custodians: &'a CustodianSet,
    pub unspent: &'a [Unspent],
    pub fee_rate: u64,
}

/// Chain-family specific multisig logic
#[derive(Debug, Clone)]
pub enum ChainFamily {
    Account(AccountFamily),
    Utxo(UtxoFamily),
}

impl ChainFamily {
    pub fn name(&self) -> &'static str {
        match self {
            ChainFamily::Account(_) => "account",
            ChainFamily::Utxo(_) => "utxo",
        }
    }

    /// Address deposits are sent to and outbound transactions spend from
    pub fn custodian_address(&self) -> &str {
        match self {
            ChainFamily::Account(family) => family.multisig_str(),
            ChainFamily::Utxo(family) => family.multisig_str(),
        }
    }

    /// Whether outbound payloads need a UTXO snapshot
    pub fn needs_unspent(&self) -> bool {
        matches!(self, ChainFamily::Utxo(_))
    }

    pub fn build_unsigned_outbound(
        &self,
        request: &OutboundRequest,
        ctx: &BuildContext<'_>,
    ) -> BridgeResult<UnsignedPayload> {
        match self {
            ChainFamily::Account(family) => family
                .build_payload(request, ctx.custodians)
                .map(UnsignedPayload::Account),
            ChainFamily::Utxo(family) => family.build_payload(request, ctx).map(UnsignedPayload::Utxo),
        }
    }

    pub fn sign_one(
        &self,
        payload: &UnsignedPayload,
        key: &SecretKey,
    ) -> BridgeResult<CustodianSignature> {
        match (self, payload) {
            (ChainFamily::Account(family), UnsignedPayload::Account(p)) => family.sign(p, key),
            (ChainFamily::Utxo(family), UnsignedPayload::Utxo(p)) => family.sign(p, key),
            _ => Err(family_mismatch()),
        }
    }

    /// Check `signature` against the payload and the public key it claims
    pub fn verify(&self, payload: &UnsignedPayload, signature: &CustodianSignature) -> bool {
        match (self, payload) {
            (ChainFamily::Account(family), UnsignedPayload::Account(p)) => {
                family.verify(p, signature)
            }
            (ChainFamily::Utxo(family), UnsignedPayload::Utxo(p)) => family.verify(p, signature),
            _ => false,
        }
    }

    /// Build the final transaction. Callers must pass only verified
    /// signatures of current custodians, at least `custodians.m()` of them.
    pub fn assemble(
        &self,
        payload: &UnsignedPayload,
        signatures: &[CustodianSignature],
        custodians: &CustodianSet,
    ) -> BridgeResult<SignedTx> {
        if signatures.len() < custodians.m() {
            return Err(BridgeError::SignatureInsufficient {
                have: signatures.len(),
                need: custodians.m(),
            });
        }
        match (self, payload) {
            (ChainFamily::Account(family), UnsignedPayload::Account(p)) => {
                family.assemble(p, signatures, custodians)
            }
            (ChainFamily::Utxo(family), UnsignedPayload::Utxo(p)) => {
                family.assemble(p, signatures, custodians)
            }
            _ => Err(family_mismatch()),
        }
    }

    /// Whether a receipt still proves the inbound event recorded in `record`
    pub fn receipt_matches_inbound(&self, record: &PendingBridgeTx, receipt: &Receipt) -> bool {
        if !receipt.success || receipt.block_hash != record.block_hash.clone().unwrap_or_default() {
            return false;
        }
        match self {
            ChainFamily::Account(family) => family.receipt_matches_deposit(record, receipt),
            // Inclusion in the recorded block is the whole proof for UTXO outputs
            ChainFamily::Utxo(_) => true,
        }
    }

    /// Whether a successful receipt shows the outbound action completed
    pub fn receipt_completes(&self, kind: TxKind, receipt: &Receipt) -> bool {
        match self {
            ChainFamily::Account(family) => family.receipt_completes(kind, receipt),
            ChainFamily::Utxo(_) => receipt.success,
        }
    }

    /// Outbound status implied by a receipt; no receipt yet means still in flight
    pub fn outbound_status(&self, kind: TxKind, receipt: Option<&Receipt>) -> TxStatus {
        match (self, receipt) {
            (ChainFamily::Account(family), receipt) => family.outbound_status(kind, receipt),
            (ChainFamily::Utxo(_), None) => TxStatus::Doing,
            (ChainFamily::Utxo(_), Some(r)) if r.success => TxStatus::Completed,
            (ChainFamily::Utxo(_), Some(_)) => TxStatus::Failed,
        }
    }
}

fn family_mismatch() -> BridgeError {
    BridgeError::Payload("payload does not belong to this chain family".to_string())
}

/// Serde helper storing byte vectors as 0x-prefixed hex
pub mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{}", hex::encode(bytes)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s.strip_prefix("0x").unwrap_or(&s)).map_err(serde::de::Error::custom)
    }
}
