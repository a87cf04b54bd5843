//! Common types for bridge operations
//!
//! `PendingBridgeTx` is the central record: created by the classifier or the
//! signing coordinator, mutated by the confirmation task, persisted through
//! the store.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::quorum::byzantine_threshold;

// ============================================================================
// Transaction kind and status
// ============================================================================

/// Bridge event kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxKind {
    Deposit,
    Withdraw,
    CustodianChange,
    Upgrade,
    FeeRecord,
}

impl TxKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxKind::Deposit => "deposit",
            TxKind::Withdraw => "withdraw",
            TxKind::CustodianChange => "custodian_change",
            TxKind::Upgrade => "upgrade",
            TxKind::FeeRecord => "fee_record",
        }
    }

    /// Home-ledger originated actions that custodians sign and broadcast
    pub fn is_outbound(&self) -> bool {
        matches!(
            self,
            TxKind::Withdraw | TxKind::CustodianChange | TxKind::Upgrade
        )
    }

    /// Tag byte written in front of the home tx hash in UTXO data outputs
    pub fn tag(&self) -> u8 {
        match self {
            TxKind::Deposit => 0x01,
            TxKind::Withdraw => 0x02,
            TxKind::CustodianChange => 0x03,
            TxKind::Upgrade => 0x04,
            TxKind::FeeRecord => 0x05,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0x01 => Some(TxKind::Deposit),
            0x02 => Some(TxKind::Withdraw),
            0x03 => Some(TxKind::CustodianChange),
            0x04 => Some(TxKind::Upgrade),
            0x05 => Some(TxKind::FeeRecord),
            _ => None,
        }
    }
}

impl fmt::Display for TxKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TxKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deposit" => Ok(TxKind::Deposit),
            "withdraw" => Ok(TxKind::Withdraw),
            "custodian_change" => Ok(TxKind::CustodianChange),
            "upgrade" => Ok(TxKind::Upgrade),
            "fee_record" => Ok(TxKind::FeeRecord),
            other => Err(format!("unknown tx kind: {}", other)),
        }
    }
}

/// Processing status of an outbound transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxStatus {
    Initial,
    Doing,
    Failed,
    Completed,
}

impl TxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxStatus::Initial => "initial",
            TxStatus::Doing => "doing",
            TxStatus::Failed => "failed",
            TxStatus::Completed => "completed",
        }
    }
}

impl fmt::Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TxStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initial" => Ok(TxStatus::Initial),
            "doing" => Ok(TxStatus::Doing),
            "failed" => Ok(TxStatus::Failed),
            "completed" => Ok(TxStatus::Completed),
            other => Err(format!("unknown tx status: {}", other)),
        }
    }
}

// ============================================================================
// Assets
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Asset {
    Native { decimals: u8 },
    Token { contract: String, decimals: u8 },
}

impl Asset {
    pub fn from_parts(contract: Option<String>, decimals: u8) -> Self {
        match contract {
            Some(contract) => Asset::Token { contract, decimals },
            None => Asset::Native { decimals },
        }
    }

    pub fn decimals(&self) -> u8 {
        match self {
            Asset::Native { decimals } | Asset::Token { decimals, .. } => *decimals,
        }
    }

    pub fn contract(&self) -> Option<&str> {
        match self {
            Asset::Native { .. } => None,
            Asset::Token { contract, .. } => Some(contract),
        }
    }
}

/// Token accepted for deposits on one external chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredToken {
    /// Lowercase contract address
    pub contract: String,
    pub decimals: u8,
    /// Home-ledger asset the token is bound to, if any. Only this contract
    /// may be credited as that asset.
    pub home_asset: Option<String>,
}

// ============================================================================
// Pending bridge transaction
// ============================================================================

/// An in-flight bridge transaction on one external chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingBridgeTx {
    pub external_tx_hash: String,
    /// Linked home-ledger transaction, unknown for fresh deposits
    pub home_tx_hash: Option<String>,
    pub kind: TxKind,
    /// `None` parks the record until the height is known
    pub block_height: Option<u64>,
    pub block_hash: Option<String>,
    /// Block time in unix seconds
    pub tx_time: u64,
    #[serde(with = "decimal_u128")]
    pub amount: u128,
    pub asset: Asset,
    pub from: String,
    pub to: String,
    /// Home-ledger recipient decoded from the deposit memo
    pub memo_address: Option<String>,
    pub status: TxStatus,
    pub validated: bool,
    pub marked_deleted: bool,
    pub deletion_height: u64,
    pub skip_rounds: u32,
    pub error_count: u32,
    /// Revalidation rounds spent on a completed outbound tx
    pub validation_attempts: u32,
    /// Custodians whose signatures were observed on an outbound tx
    pub signers: Vec<String>,
}

impl PendingBridgeTx {
    pub fn new(external_tx_hash: impl Into<String>, kind: TxKind, asset: Asset) -> Self {
        Self {
            external_tx_hash: external_tx_hash.into(),
            home_tx_hash: None,
            kind,
            block_height: None,
            block_hash: None,
            tx_time: 0,
            amount: 0,
            asset,
            from: String::new(),
            to: String::new(),
            memo_address: None,
            status: TxStatus::Initial,
            validated: false,
            marked_deleted: false,
            deletion_height: 0,
            skip_rounds: 0,
            error_count: 0,
            validation_attempts: 0,
            signers: Vec::new(),
        }
    }

    pub fn is_inbound(&self) -> bool {
        !self.kind.is_outbound()
    }

    /// Confirmations at `tip`, zero while the height is unknown
    pub fn confirmations(&self, tip: u64) -> u64 {
        match self.block_height {
            Some(height) if tip >= height => tip - height,
            _ => 0,
        }
    }
}

/// Header kept by the scanner for fork detection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalBlockHeader {
    pub height: u64,
    pub hash: String,
    pub parent_hash: String,
}

// ============================================================================
// Custodian set
// ============================================================================

/// Current virtual-bank membership, as supplied by the home ledger.
///
/// Public keys are compressed secp256k1 keys in lowercase hex. Their order is
/// the home ledger's order and defines every custodian's send order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "CustodianSetWire", into = "CustodianSetWire")]
pub struct CustodianSet {
    pubkeys: Vec<String>,
}

#[derive(Serialize, Deserialize)]
struct CustodianSetWire {
    pubkeys: Vec<String>,
}

impl From<CustodianSetWire> for CustodianSet {
    fn from(wire: CustodianSetWire) -> Self {
        CustodianSet::new(wire.pubkeys)
    }
}

impl From<CustodianSet> for CustodianSetWire {
    fn from(set: CustodianSet) -> Self {
        CustodianSetWire {
            pubkeys: set.pubkeys,
        }
    }
}

impl CustodianSet {
    /// Build a set, normalizing keys and dropping duplicates (first wins)
    pub fn new<I, S>(pubkeys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut seen = BTreeSet::new();
        let pubkeys = pubkeys
            .into_iter()
            .map(|k| normalize_pubkey(k.as_ref()))
            .filter(|k| seen.insert(k.clone()))
            .collect();
        Self { pubkeys }
    }

    pub fn pubkeys(&self) -> &[String] {
        &self.pubkeys
    }

    pub fn n(&self) -> usize {
        self.pubkeys.len()
    }

    /// Byzantine signature threshold
    pub fn m(&self) -> usize {
        byzantine_threshold(self.n())
    }

    pub fn contains(&self, pubkey: &str) -> bool {
        let key = normalize_pubkey(pubkey);
        self.pubkeys.iter().any(|k| *k == key)
    }

    /// 1-based position of `pubkey`, used to stagger broadcast windows
    pub fn send_order(&self, pubkey: &str) -> Option<usize> {
        let key = normalize_pubkey(pubkey);
        self.pubkeys.iter().position(|k| *k == key).map(|i| i + 1)
    }
}

/// Trimmed, lowercase, no `0x`
pub fn normalize_pubkey(pubkey: &str) -> String {
    pubkey.trim().trim_start_matches("0x").to_lowercase()
}

/// One custodian's signature over an outbound payload.
///
/// Account chains carry a single 65-byte recoverable signature; UTXO chains
/// carry one DER signature per input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustodianSignature {
    pub pubkey: String,
    pub parts: Vec<String>,
}

// ============================================================================
// Outbound requests
// ============================================================================

/// Parameters of a home-ledger originated action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutboundParams {
    Withdraw {
        to: String,
        #[serde(with = "decimal_u128")]
        amount: u128,
        asset: Asset,
    },
    CustodianChange {
        /// Compressed public keys joining the set
        adds: Vec<String>,
        /// Compressed public keys leaving the set
        removes: Vec<String>,
    },
    Upgrade {
        new_contract: String,
    },
}

impl OutboundParams {
    pub fn kind(&self) -> TxKind {
        match self {
            OutboundParams::Withdraw { .. } => TxKind::Withdraw,
            OutboundParams::CustodianChange { .. } => TxKind::CustodianChange,
            OutboundParams::Upgrade { .. } => TxKind::Upgrade,
        }
    }
}

/// A home-ledger transaction that requires an external-chain action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundRequest {
    pub home_tx_hash: String,
    pub params: OutboundParams,
    /// Fee rate fixed by the home ledger so every custodian builds the same
    /// UTXO payload; the adapter estimate is used when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fee_rate: Option<u64>,
}

impl OutboundRequest {
    pub fn kind(&self) -> TxKind {
        self.params.kind()
    }
}

/// Serde helper writing `u128` amounts as decimal strings
pub mod decimal_u128 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u128, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u128, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Number(u64),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
            Raw::Number(n) => Ok(n as u128),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trips_through_str_and_tag() {
        for kind in [
            TxKind::Deposit,
            TxKind::Withdraw,
            TxKind::CustodianChange,
            TxKind::Upgrade,
            TxKind::FeeRecord,
        ] {
            assert_eq!(kind.as_str().parse::<TxKind>().unwrap(), kind);
            assert_eq!(TxKind::from_tag(kind.tag()), Some(kind));
        }
        assert!(TxKind::from_tag(0x00).is_none());
    }

    #[test]
    fn test_outbound_kinds() {
        assert!(TxKind::Withdraw.is_outbound());
        assert!(TxKind::CustodianChange.is_outbound());
        assert!(TxKind::Upgrade.is_outbound());
        assert!(!TxKind::Deposit.is_outbound());
        assert!(!TxKind::FeeRecord.is_outbound());
    }

    #[test]
    fn test_status_parse() {
        assert_eq!("doing".parse::<TxStatus>().unwrap(), TxStatus::Doing);
        assert!("done".parse::<TxStatus>().is_err());
    }

    #[test]
    fn test_custodian_set_threshold_and_order() {
        let set = CustodianSet::new(["0xAA", "bb", "cc", "dd", "ee", "aa"]);
        assert_eq!(set.n(), 5);
        assert_eq!(set.m(), 4);
        assert!(set.contains("AA"));
        assert_eq!(set.send_order("aa"), Some(1));
        assert_eq!(set.send_order("ee"), Some(5));
        assert_eq!(set.send_order("ff"), None);
    }

    #[test]
    fn test_custodian_set_serde_normalizes() {
        let set: CustodianSet = serde_json::from_str(r#"{"pubkeys":["0xAB","ab"]}"#).unwrap();
        assert_eq!(set.pubkeys(), ["ab".to_string()]);
    }

    #[test]
    fn test_withdraw_amount_survives_json_value() {
        let params = OutboundParams::Withdraw {
            to: "0xabc".into(),
            amount: u128::MAX,
            asset: Asset::Native { decimals: 18 },
        };
        let value = serde_json::to_value(&params).unwrap();
        let back: OutboundParams = serde_json::from_value(value).unwrap();
        assert_eq!(back, params);
    }

    #[test]
    fn test_confirmations() {
        let mut tx = PendingBridgeTx::new("h", TxKind::Deposit, Asset::Native { decimals: 18 });
        assert_eq!(tx.confirmations(100), 0);
        tx.block_height = Some(90);
        assert_eq!(tx.confirmations(100), 10);
        assert_eq!(tx.confirmations(80), 0);
    }
}
