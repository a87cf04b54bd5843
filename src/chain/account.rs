//! Account-model (EVM style) custodian multisig
//!
//! Outbound actions are calls into the custodian contract carrying a
//! `txKey` (the home tx hash) and the concatenated 65-byte signatures of a
//! custodian quorum. Every custodian signs the same packed digest.

use std::str::FromStr;

use alloy::primitives::{Address, Bytes, B256, U256};
use alloy::sol_types::{SolCall, SolEvent};
use secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use secp256k1::{Message, PublicKey, SecretKey, SECP256K1};
use serde::{Deserialize, Serialize};

use crate::chain::{Receipt, SignedTx, TxLog};
use crate::contracts::{IVirtualBank, IERC20};
use crate::error::{BridgeError, BridgeResult};
use crate::hash::{
    custodian_change_digest, eth_address_from_pubkey, normalize_hash, upgrade_digest,
    withdraw_digest,
};
use crate::types::{
    decimal_u128, CustodianSet, CustodianSignature, OutboundParams, OutboundRequest,
    PendingBridgeTx, TxKind, TxStatus,
};

/// Length of an `r || s || v` signature
const SIGNATURE_LEN: usize = 65;

#[derive(Debug, Clone)]
pub struct AccountFamily {
    multisig: Address,
    multisig_str: String,
}

/// Contract call an outbound payload resolves to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum AccountCall {
    Withdraw {
        to: String,
        #[serde(with = "decimal_u128")]
        amount: u128,
        /// Token contract, `None` for the native asset
        erc20: Option<String>,
    },
    ManagerChange {
        adds: Vec<String>,
        removes: Vec<String>,
        count: u8,
    },
    Upgrade {
        contract: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountPayload {
    pub tx_key: String,
    pub call: AccountCall,
    /// Hex digest custodians sign, kept for logs; verification recomputes it
    pub digest: String,
}

/// A decoded call into the custodian contract
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedCall {
    Outbound {
        kind: TxKind,
        tx_key: String,
        to: Option<String>,
        amount: u128,
        erc20: Option<String>,
    },
    CrossOut {
        memo: String,
        amount: u128,
        erc20: Option<String>,
    },
}

/// A decoded `CrossOutFunds` event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrossOutEvent {
    pub from: String,
    pub memo: String,
    pub amount: u128,
    pub erc20: Option<String>,
}

impl AccountFamily {
    pub fn new(multisig: &str) -> BridgeResult<Self> {
        let address = parse_address(multisig).ok_or_else(|| {
            BridgeError::Config(format!("invalid multisig address: {}", multisig))
        })?;
        Ok(Self {
            multisig: address,
            multisig_str: format_address(&address),
        })
    }

    pub fn multisig(&self) -> Address {
        self.multisig
    }

    pub fn multisig_str(&self) -> &str {
        &self.multisig_str
    }

    pub fn is_multisig(&self, address: &str) -> bool {
        parse_address(address).is_some_and(|a| a == self.multisig)
    }

    pub fn build_payload(
        &self,
        request: &OutboundRequest,
        custodians: &CustodianSet,
    ) -> BridgeResult<AccountPayload> {
        let tx_key = normalize_hash(&request.home_tx_hash);
        let call = match &request.params {
            OutboundParams::Withdraw { to, amount, asset } => {
                let to = parse_address(to)
                    .ok_or_else(|| BridgeError::Payload(format!("invalid recipient: {}", to)))?;
                let erc20 = match asset.contract() {
                    Some(contract) => Some(format_address(&parse_address(contract).ok_or_else(
                        || BridgeError::Payload(format!("invalid token contract: {}", contract)),
                    )?)),
                    None => None,
                };
                AccountCall::Withdraw {
                    to: format_address(&to),
                    amount: *amount,
                    erc20,
                }
            }
            OutboundParams::CustodianChange { adds, removes } => {
                let count = u8::try_from(custodians.n()).map_err(|_| {
                    BridgeError::Payload(format!("custodian count {} exceeds 255", custodians.n()))
                })?;
                AccountCall::ManagerChange {
                    adds: pubkeys_to_addresses(adds)?,
                    removes: pubkeys_to_addresses(removes)?,
                    count,
                }
            }
            OutboundParams::Upgrade { new_contract } => {
                let contract = parse_address(new_contract).ok_or_else(|| {
                    BridgeError::Payload(format!("invalid upgrade contract: {}", new_contract))
                })?;
                AccountCall::Upgrade {
                    contract: format_address(&contract),
                }
            }
        };
        let digest = call_digest(&tx_key, &call)?;
        Ok(AccountPayload {
            tx_key,
            call,
            digest: hex::encode(digest),
        })
    }

    pub fn sign(&self, payload: &AccountPayload, key: &SecretKey) -> BridgeResult<CustodianSignature> {
        let digest = call_digest(&payload.tx_key, &payload.call)?;
        let message = Message::from_digest(digest);
        let signature = SECP256K1.sign_ecdsa_recoverable(&message, key);
        let (recovery_id, compact) = signature.serialize_compact();

        let mut bytes = Vec::with_capacity(SIGNATURE_LEN);
        bytes.extend_from_slice(&compact);
        bytes.push(27 + recovery_id.to_i32() as u8);

        let pubkey = PublicKey::from_secret_key(SECP256K1, key);
        Ok(CustodianSignature {
            pubkey: hex::encode(pubkey.serialize()),
            parts: vec![hex::encode(bytes)],
        })
    }

    pub fn verify(&self, payload: &AccountPayload, signature: &CustodianSignature) -> bool {
        let Ok(digest) = call_digest(&payload.tx_key, &payload.call) else {
            return false;
        };
        let [part] = signature.parts.as_slice() else {
            return false;
        };
        let Some(bytes) = decode_signature(part) else {
            return false;
        };
        let Ok(claimed) = PublicKey::from_str(signature.pubkey.trim_start_matches("0x")) else {
            return false;
        };
        recover(&digest, &bytes).is_some_and(|recovered| recovered == claimed)
    }

    pub fn assemble(
        &self,
        payload: &AccountPayload,
        signatures: &[CustodianSignature],
        custodians: &CustodianSet,
    ) -> BridgeResult<SignedTx> {
        let mut ordered = Vec::with_capacity(signatures.len());
        for signature in signatures {
            let order = custodians.send_order(&signature.pubkey).ok_or_else(|| {
                BridgeError::Payload(format!("signer {} is not a custodian", signature.pubkey))
            })?;
            let bytes = signature
                .parts
                .first()
                .and_then(|p| decode_signature(p))
                .ok_or_else(|| BridgeError::Payload("malformed signature".to_string()))?;
            ordered.push((order, bytes));
        }
        ordered.sort_by_key(|(order, _)| *order);
        let packed: Vec<u8> = ordered.into_iter().flat_map(|(_, bytes)| bytes).collect();
        let signatures = Bytes::from(packed);

        let data = match &payload.call {
            AccountCall::Withdraw { to, amount, erc20 } => IVirtualBank::createOrSignWithdrawCall {
                txKey: payload.tx_key.clone(),
                to: required_address(to)?,
                amount: U256::from(*amount),
                isContractAsset: erc20.is_some(),
                erc20: erc20
                    .as_deref()
                    .map(required_address)
                    .transpose()?
                    .unwrap_or(Address::ZERO),
                signatures,
            }
            .abi_encode(),
            AccountCall::ManagerChange {
                adds,
                removes,
                count,
            } => IVirtualBank::createOrSignManagerChangeCall {
                txKey: payload.tx_key.clone(),
                adds: adds
                    .iter()
                    .map(|a| required_address(a))
                    .collect::<BridgeResult<_>>()?,
                removes: removes
                    .iter()
                    .map(|a| required_address(a))
                    .collect::<BridgeResult<_>>()?,
                count: *count,
                signatures,
            }
            .abi_encode(),
            AccountCall::Upgrade { contract } => IVirtualBank::createOrSignUpgradeCall {
                txKey: payload.tx_key.clone(),
                upgradeContract: required_address(contract)?,
                signatures,
            }
            .abi_encode(),
        };

        Ok(SignedTx::Account {
            to: self.multisig_str.clone(),
            data,
            tx_key: payload.tx_key.clone(),
        })
    }

    /// Decode call data sent to the custodian contract
    pub fn decode_multisig_call(&self, input: &[u8]) -> Option<DecodedCall> {
        let selector: [u8; 4] = input.get(..4)?.try_into().ok()?;
        if selector == IVirtualBank::createOrSignWithdrawCall::SELECTOR {
            let call = IVirtualBank::createOrSignWithdrawCall::abi_decode(input, true).ok()?;
            Some(DecodedCall::Outbound {
                kind: TxKind::Withdraw,
                tx_key: call.txKey,
                to: Some(format_address(&call.to)),
                amount: u128::try_from(call.amount).ok()?,
                erc20: call.isContractAsset.then(|| format_address(&call.erc20)),
            })
        } else if selector == IVirtualBank::createOrSignManagerChangeCall::SELECTOR {
            let call = IVirtualBank::createOrSignManagerChangeCall::abi_decode(input, true).ok()?;
            Some(DecodedCall::Outbound {
                kind: TxKind::CustodianChange,
                tx_key: call.txKey,
                to: None,
                amount: 0,
                erc20: None,
            })
        } else if selector == IVirtualBank::createOrSignUpgradeCall::SELECTOR {
            let call = IVirtualBank::createOrSignUpgradeCall::abi_decode(input, true).ok()?;
            Some(DecodedCall::Outbound {
                kind: TxKind::Upgrade,
                tx_key: call.txKey,
                to: Some(format_address(&call.upgradeContract)),
                amount: 0,
                erc20: None,
            })
        } else if selector == IVirtualBank::crossOutCall::SELECTOR {
            let call = IVirtualBank::crossOutCall::abi_decode(input, true).ok()?;
            Some(DecodedCall::CrossOut {
                memo: call.to,
                amount: u128::try_from(call.amount).ok()?,
                erc20: (call.erc20 != Address::ZERO).then(|| format_address(&call.erc20)),
            })
        } else {
            None
        }
    }

    /// `CrossOutFunds` events emitted by the custodian contract
    pub fn cross_out_events(&self, receipt: &Receipt) -> Vec<CrossOutEvent> {
        receipt
            .logs
            .iter()
            .filter(|log| self.is_multisig(&log.address))
            .filter(|log| {
                log.topics.first() == Some(&IVirtualBank::CrossOutFunds::SIGNATURE_HASH.0)
            })
            .filter_map(|log| {
                let event = IVirtualBank::CrossOutFunds::decode_raw_log(
                    log.topics.iter().map(|t| B256::from(*t)),
                    &log.data,
                    true,
                )
                .ok()?;
                Some(CrossOutEvent {
                    from: format_address(&event.from),
                    memo: event.to,
                    amount: u128::try_from(event.amount).ok()?,
                    erc20: (event.erc20 != Address::ZERO).then(|| format_address(&event.erc20)),
                })
            })
            .collect()
    }

    pub fn receipt_matches_deposit(&self, record: &PendingBridgeTx, receipt: &Receipt) -> bool {
        let events = self.cross_out_events(receipt);
        let expected_erc20 = record.asset.contract().map(str::to_lowercase);
        if events.is_empty() {
            // A plain native transfer with the memo in call data emits nothing
            return expected_erc20.is_none();
        }
        events.iter().any(|event| {
            event.amount == record.amount
                && event.erc20 == expected_erc20
                && record.memo_address.as_deref() == Some(event.memo.as_str())
        })
    }

    pub fn receipt_completes(&self, kind: TxKind, receipt: &Receipt) -> bool {
        let Some(topic) = completion_topic(kind) else {
            return false;
        };
        receipt.success
            && receipt
                .logs
                .iter()
                .any(|log| self.is_multisig(&log.address) && log.topics.first() == Some(&topic))
    }

    /// Outbound status implied by a receipt; no receipt yet means still in flight
    pub fn outbound_status(&self, kind: TxKind, receipt: Option<&Receipt>) -> TxStatus {
        match receipt {
            None => TxStatus::Doing,
            Some(r) if !r.success => TxStatus::Failed,
            Some(r) if self.receipt_completes(kind, r) => TxStatus::Completed,
            Some(_) => TxStatus::Doing,
        }
    }
}

/// Decode an ERC-20 `transfer(to, amount)` call
pub fn decode_token_transfer(input: &[u8]) -> Option<(String, u128)> {
    let call = IERC20::transferCall::abi_decode(input, true).ok()?;
    Some((format_address(&call.to), u128::try_from(call.amount).ok()?))
}

/// Build a completion log for `kind`, as the contract emits it
pub fn completion_log(multisig: &str, kind: TxKind, tx_key: &str) -> Option<TxLog> {
    let data = match kind {
        TxKind::Withdraw => IVirtualBank::TxWithdrawCompleted {
            txKey: tx_key.to_string(),
        }
        .encode_data(),
        TxKind::CustodianChange => IVirtualBank::TxManagerChangeCompleted {
            txKey: tx_key.to_string(),
        }
        .encode_data(),
        TxKind::Upgrade => IVirtualBank::TxUpgradeCompleted {
            txKey: tx_key.to_string(),
        }
        .encode_data(),
        _ => return None,
    };
    Some(TxLog {
        address: multisig.to_lowercase(),
        topics: vec![completion_topic(kind)?],
        data,
    })
}

/// Build a `CrossOutFunds` log, as the contract emits it
pub fn cross_out_log(
    multisig: &str,
    from: &str,
    memo: &str,
    amount: u128,
    erc20: Option<&str>,
) -> Option<TxLog> {
    let event = IVirtualBank::CrossOutFunds {
        from: parse_address(from)?,
        to: memo.to_string(),
        amount: U256::from(amount),
        erc20: match erc20 {
            Some(e) => parse_address(e)?,
            None => Address::ZERO,
        },
    };
    Some(TxLog {
        address: multisig.to_lowercase(),
        topics: vec![IVirtualBank::CrossOutFunds::SIGNATURE_HASH.0],
        data: event.encode_data(),
    })
}

fn completion_topic(kind: TxKind) -> Option<[u8; 32]> {
    match kind {
        TxKind::Withdraw => Some(IVirtualBank::TxWithdrawCompleted::SIGNATURE_HASH.0),
        TxKind::CustodianChange => Some(IVirtualBank::TxManagerChangeCompleted::SIGNATURE_HASH.0),
        TxKind::Upgrade => Some(IVirtualBank::TxUpgradeCompleted::SIGNATURE_HASH.0),
        _ => None,
    }
}

fn call_digest(tx_key: &str, call: &AccountCall) -> BridgeResult<[u8; 32]> {
    Ok(match call {
        AccountCall::Withdraw { to, amount, erc20 } => {
            let erc20_bytes = match erc20 {
                Some(e) => required_address(e)?.into_array(),
                None => [0u8; 20],
            };
            withdraw_digest(
                tx_key,
                &required_address(to)?.into_array(),
                *amount,
                erc20.is_some(),
                &erc20_bytes,
            )
        }
        AccountCall::ManagerChange {
            adds,
            removes,
            count,
        } => {
            let adds: Vec<[u8; 20]> = adds
                .iter()
                .map(|a| required_address(a).map(|a| a.into_array()))
                .collect::<BridgeResult<_>>()?;
            let removes: Vec<[u8; 20]> = removes
                .iter()
                .map(|a| required_address(a).map(|a| a.into_array()))
                .collect::<BridgeResult<_>>()?;
            custodian_change_digest(tx_key, &adds, *count, &removes)
        }
        AccountCall::Upgrade { contract } => {
            upgrade_digest(tx_key, &required_address(contract)?.into_array())
        }
    })
}

fn recover(digest: &[u8; 32], bytes: &[u8]) -> Option<PublicKey> {
    let v = bytes[64];
    let recovery = if v >= 27 { v - 27 } else { v };
    let recovery_id = RecoveryId::from_i32(recovery as i32).ok()?;
    let signature = RecoverableSignature::from_compact(&bytes[..64], recovery_id).ok()?;
    SECP256K1
        .recover_ecdsa(&Message::from_digest(*digest), &signature)
        .ok()
}

fn decode_signature(part: &str) -> Option<Vec<u8>> {
    let bytes = hex::decode(part.trim_start_matches("0x")).ok()?;
    (bytes.len() == SIGNATURE_LEN).then_some(bytes)
}

fn pubkeys_to_addresses(pubkeys: &[String]) -> BridgeResult<Vec<String>> {
    pubkeys
        .iter()
        .map(|k| {
            PublicKey::from_str(k.trim_start_matches("0x"))
                .map(|pk| format_address(&Address::from(eth_address_from_pubkey(&pk))))
                .map_err(|e| BridgeError::Payload(format!("invalid custodian key {}: {}", k, e)))
        })
        .collect()
}

fn required_address(s: &str) -> BridgeResult<Address> {
    parse_address(s).ok_or_else(|| BridgeError::Payload(format!("invalid address: {}", s)))
}

pub fn parse_address(s: &str) -> Option<Address> {
    Address::from_str(s.trim()).ok()
}

/// Lowercase 0x-prefixed hex
pub fn format_address(address: &Address) -> String {
    format!("0x{}", hex::encode(address.as_slice()))
}
