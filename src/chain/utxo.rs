//! UTXO-model (Bitcoin style) custodian multisig
//!
//! Custody is a P2WSH `OP_m <sorted pubkeys> OP_n OP_CHECKMULTISIG` script.
//! Outbound payloads are pure functions of (custodian set, UTXO snapshot,
//! request, fee rate): inputs are picked in a fixed order, outputs are laid
//! out in a fixed order and the fee comes from a size estimate, so every
//! custodian derives byte-identical transactions without talking to the
//! others.

use std::str::FromStr;

use bitcoin::address::NetworkUnchecked;
use bitcoin::blockdata::opcodes::all::OP_CHECKMULTISIG;
use bitcoin::blockdata::script::{Builder, Instruction, PushBytesBuf};
use bitcoin::hashes::Hash;
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::transaction::Version;
use bitcoin::{
    absolute, Address, Amount, Network, OutPoint, Script, ScriptBuf, Sequence, Transaction, TxIn,
    TxOut, Txid, Witness,
};
use secp256k1::ecdsa::Signature;
use secp256k1::{Message, PublicKey, SecretKey, SECP256K1};
use serde::{Deserialize, Serialize};

use crate::chain::{hex_bytes, BuildContext, SignedTx, Unspent};
use crate::error::{BridgeError, BridgeResult};
use crate::hash::{normalize_hash, parse_bytes32};
use crate::types::{CustodianSet, CustodianSignature, OutboundParams, OutboundRequest, TxKind};

/// Outputs below this value are not relayed
pub const DUST_LIMIT: u64 = 546;

/// Largest custodian set a P2WSH CHECKMULTISIG script may carry
pub const MAX_CUSTODIANS: usize = 20;

/// Upper bound of a DER signature plus its sighash byte
const MAX_SIG_WITNESS_LEN: usize = 73;

#[derive(Debug, Clone)]
pub struct UtxoFamily {
    network: Network,
    script_pubkey: ScriptBuf,
    multisig_str: String,
}

/// Unsigned custodian spend shared by every signer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtxoPayload {
    pub kind: TxKind,
    pub home_tx_hash: String,
    /// Consensus-encoded transaction with empty witnesses
    #[serde(with = "hex_bytes")]
    pub unsigned_tx: Vec<u8>,
    /// Spent custodian outputs, in input order
    pub inputs: Vec<Unspent>,
    #[serde(with = "hex_bytes")]
    pub witness_script: Vec<u8>,
    pub fee: u64,
}

/// Result of deterministic input selection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub inputs: Vec<Unspent>,
    pub fee: u64,
    pub change: u64,
}

impl UtxoFamily {
    pub fn new(multisig: &str, network: Network) -> BridgeResult<Self> {
        let address = Address::<NetworkUnchecked>::from_str(multisig)
            .map_err(|e| BridgeError::Config(format!("invalid multisig address {}: {}", multisig, e)))?
            .require_network(network)
            .map_err(|e| BridgeError::Config(format!("multisig address {}: {}", multisig, e)))?;
        Ok(Self {
            network,
            script_pubkey: address.script_pubkey(),
            multisig_str: address.to_string(),
        })
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn multisig_str(&self) -> &str {
        &self.multisig_str
    }

    pub fn script_pubkey(&self) -> &Script {
        &self.script_pubkey
    }

    pub fn is_custodian_script(&self, script: &Script) -> bool {
        script == self.script_pubkey.as_script()
    }

    /// Address string for an output script, when it has a standard form
    pub fn address_of(&self, script: &Script) -> Option<String> {
        Address::from_script(script, self.network)
            .ok()
            .map(|a| a.to_string())
    }

    pub fn build_payload(
        &self,
        request: &OutboundRequest,
        ctx: &BuildContext<'_>,
    ) -> BridgeResult<UtxoPayload> {
        let custodians = ctx.custodians;
        let witness_script = multisig_script(custodians)?;
        if ScriptBuf::new_p2wsh(&witness_script.wscript_hash()) != self.script_pubkey {
            return Err(BridgeError::Payload(
                "custodian set does not match the multisig address".to_string(),
            ));
        }

        let home_tx_hash = normalize_hash(&request.home_tx_hash);
        let data_output = TxOut {
            value: Amount::ZERO,
            script_pubkey: home_binding_script(request.kind(), &home_tx_hash)?,
        };
        let (m, n) = (custodians.m(), custodians.n());

        let (selection, mut outputs, change_script) = match &request.params {
            OutboundParams::Withdraw { to, amount, asset } => {
                if asset.contract().is_some() {
                    return Err(BridgeError::Payload(
                        "token withdrawals are not supported on utxo chains".to_string(),
                    ));
                }
                let value = u64::try_from(*amount).map_err(|_| {
                    BridgeError::Payload(format!("amount {} exceeds u64", amount))
                })?;
                if value < DUST_LIMIT {
                    return Err(BridgeError::Payload(format!(
                        "amount {} is below the dust limit",
                        value
                    )));
                }
                let recipient = TxOut {
                    value: Amount::from_sat(value),
                    script_pubkey: self.recipient_script(to)?,
                };
                let fixed = vec![recipient, data_output];
                let scripts: Vec<usize> = fixed.iter().map(|o| o.script_pubkey.len()).collect();
                let selection =
                    select_inputs(ctx.unspent, value, ctx.fee_rate, &scripts, m, n)?;
                (selection, fixed, self.script_pubkey.clone())
            }
            OutboundParams::CustodianChange { adds, removes } => {
                let next = next_custodian_set(custodians, adds, removes);
                let next_script = multisig_script(&next)?;
                let next_spk = ScriptBuf::new_p2wsh(&next_script.wscript_hash());
                let scripts = [data_output.script_pubkey.len(), next_spk.len()];
                let selection = sweep_inputs(ctx.unspent, ctx.fee_rate, &scripts, m, n)?;
                (selection, vec![data_output], next_spk)
            }
            OutboundParams::Upgrade { .. } => {
                return Err(BridgeError::Payload(
                    "contract upgrades do not apply to utxo chains".to_string(),
                ));
            }
        };

        if selection.change > 0 {
            outputs.push(TxOut {
                value: Amount::from_sat(selection.change),
                script_pubkey: change_script,
            });
        }

        let input = selection
            .inputs
            .iter()
            .map(|u| {
                let txid = Txid::from_str(&u.txid)
                    .map_err(|e| BridgeError::Payload(format!("invalid utxo txid {}: {}", u.txid, e)))?;
                Ok(TxIn {
                    previous_output: OutPoint::new(txid, u.vout),
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence::MAX,
                    witness: Witness::new(),
                })
            })
            .collect::<BridgeResult<Vec<_>>>()?;

        let tx = Transaction {
            version: Version::TWO,
            lock_time: absolute::LockTime::ZERO,
            input,
            output: outputs,
        };

        Ok(UtxoPayload {
            kind: request.kind(),
            home_tx_hash,
            unsigned_tx: bitcoin::consensus::serialize(&tx),
            inputs: selection.inputs,
            witness_script: witness_script.into_bytes(),
            fee: selection.fee,
        })
    }

    pub fn sign(&self, payload: &UtxoPayload, key: &SecretKey) -> BridgeResult<CustodianSignature> {
        let (_, sighashes) = sighashes(payload)?;
        let parts = sighashes
            .iter()
            .map(|digest| {
                let signature = SECP256K1.sign_ecdsa(&Message::from_digest(*digest), key);
                hex::encode(signature.serialize_der())
            })
            .collect();
        let pubkey = PublicKey::from_secret_key(SECP256K1, key);
        Ok(CustodianSignature {
            pubkey: hex::encode(pubkey.serialize()),
            parts,
        })
    }

    /// Every input's signature must verify against the claimed key
    pub fn verify(&self, payload: &UtxoPayload, signature: &CustodianSignature) -> bool {
        let Ok((_, sighashes)) = sighashes(payload) else {
            return false;
        };
        if signature.parts.len() != sighashes.len() || sighashes.is_empty() {
            return false;
        }
        let Ok(pubkey) = PublicKey::from_str(signature.pubkey.trim_start_matches("0x")) else {
            return false;
        };
        let script_key = bitcoin::PublicKey::new(pubkey).to_bytes();
        if !script_contains_key(&payload.witness_script, &script_key) {
            return false;
        }
        signature.parts.iter().zip(&sighashes).all(|(part, digest)| {
            let Some(sig) = hex::decode(part)
                .ok()
                .and_then(|der| Signature::from_der(&der).ok())
            else {
                return false;
            };
            SECP256K1
                .verify_ecdsa(&Message::from_digest(*digest), &sig, &pubkey)
                .is_ok()
        })
    }

    pub fn assemble(
        &self,
        payload: &UtxoPayload,
        signatures: &[CustodianSignature],
        custodians: &CustodianSet,
    ) -> BridgeResult<SignedTx> {
        let (mut tx, _) = sighashes(payload)?;

        // CHECKMULTISIG consumes exactly m signatures in script key order
        let mut ordered: Vec<&CustodianSignature> = signatures
            .iter()
            .filter(|s| custodians.contains(&s.pubkey))
            .collect();
        ordered.sort_by(|a, b| {
            normalize_hash(&a.pubkey).cmp(&normalize_hash(&b.pubkey))
        });
        ordered.dedup_by(|a, b| normalize_hash(&a.pubkey) == normalize_hash(&b.pubkey));
        if ordered.len() < custodians.m() {
            return Err(BridgeError::SignatureInsufficient {
                have: ordered.len(),
                need: custodians.m(),
            });
        }
        ordered.truncate(custodians.m());

        for (index, input) in tx.input.iter_mut().enumerate() {
            let mut witness = Witness::new();
            witness.push(Vec::<u8>::new());
            for signature in &ordered {
                let mut der = signature
                    .parts
                    .get(index)
                    .and_then(|p| hex::decode(p).ok())
                    .ok_or_else(|| BridgeError::Payload("missing input signature".to_string()))?;
                der.push(EcdsaSighashType::All as u8);
                witness.push(der);
            }
            witness.push(&payload.witness_script);
            input.witness = witness;
        }

        Ok(SignedTx::Utxo {
            txid: tx.compute_txid().to_string(),
            raw: bitcoin::consensus::serialize(&tx),
        })
    }

    fn recipient_script(&self, to: &str) -> BridgeResult<ScriptBuf> {
        let address = Address::<NetworkUnchecked>::from_str(to)
            .map_err(|e| BridgeError::Payload(format!("invalid recipient {}: {}", to, e)))?
            .require_network(self.network)
            .map_err(|e| BridgeError::Payload(format!("recipient {}: {}", to, e)))?;
        Ok(address.script_pubkey())
    }
}

/// `OP_m <sorted compressed pubkeys> OP_n OP_CHECKMULTISIG`
pub fn multisig_script(custodians: &CustodianSet) -> BridgeResult<ScriptBuf> {
    let n = custodians.n();
    if n == 0 || n > MAX_CUSTODIANS {
        return Err(BridgeError::Payload(format!(
            "custodian set size {} out of range",
            n
        )));
    }
    let mut keys = custodians
        .pubkeys()
        .iter()
        .map(|k| {
            PublicKey::from_str(k)
                .map(bitcoin::PublicKey::new)
                .map_err(|e| BridgeError::Payload(format!("invalid custodian key {}: {}", k, e)))
        })
        .collect::<BridgeResult<Vec<_>>>()?;
    keys.sort_by_key(|k| k.to_bytes());

    let mut builder = Builder::new().push_int(custodians.m() as i64);
    for key in &keys {
        builder = builder.push_key(key);
    }
    Ok(builder
        .push_int(n as i64)
        .push_opcode(OP_CHECKMULTISIG)
        .into_script())
}

/// Custodian set after applying a membership change, order preserved
pub fn next_custodian_set(current: &CustodianSet, adds: &[String], removes: &[String]) -> CustodianSet {
    let removed = CustodianSet::new(removes);
    CustodianSet::new(
        current
            .pubkeys()
            .iter()
            .filter(|k| !removed.contains(k))
            .chain(adds.iter()),
    )
}

/// Select custodian outputs covering `target` plus fee.
///
/// Candidates are ordered by (value desc, txid, vout) and taken greedily.
/// Change below the dust limit is left to the fee.
pub fn select_inputs(
    unspent: &[Unspent],
    target: u64,
    fee_rate: u64,
    fixed_output_scripts: &[usize],
    m: usize,
    n: usize,
) -> BridgeResult<Selection> {
    let mut selected = Vec::new();
    let mut total: u64 = 0;
    let mut with_change_scripts = fixed_output_scripts.to_vec();
    with_change_scripts.push(P2WSH_SCRIPT_LEN);

    for utxo in ordered_unspent(unspent) {
        total = total.saturating_add(utxo.value);
        selected.push(utxo);

        let fee_without_change =
            fee_for(fee_rate, estimate_vsize(selected.len(), fixed_output_scripts, m, n))?;
        if total < target.saturating_add(fee_without_change) {
            continue;
        }
        let fee_with_change =
            fee_for(fee_rate, estimate_vsize(selected.len(), &with_change_scripts, m, n))?;
        let with_change = target
            .checked_add(fee_with_change)
            .and_then(|v| v.checked_add(DUST_LIMIT))
            .ok_or_else(|| amount_overflow("target plus fee"))?;
        if total >= with_change {
            return Ok(Selection {
                inputs: selected,
                fee: fee_with_change,
                change: total - target - fee_with_change,
            });
        }
        return Ok(Selection {
            inputs: selected,
            fee: total - target,
            change: 0,
        });
    }

    let needed = target
        .checked_add(fee_for(
            fee_rate,
            estimate_vsize(selected.len().max(1), fixed_output_scripts, m, n),
        )?)
        .ok_or_else(|| amount_overflow("target plus fee"))?;
    Err(BridgeError::InsufficientFunds {
        needed,
        available: total,
    })
}

/// Spend every custodian output into a single change output (custodian change)
pub fn sweep_inputs(
    unspent: &[Unspent],
    fee_rate: u64,
    output_scripts: &[usize],
    m: usize,
    n: usize,
) -> BridgeResult<Selection> {
    let inputs = ordered_unspent(unspent);
    let total = inputs
        .iter()
        .try_fold(0u64, |sum, u| sum.checked_add(u.value))
        .ok_or_else(|| amount_overflow("custodian balance"))?;
    let fee = fee_for(fee_rate, estimate_vsize(inputs.len().max(1), output_scripts, m, n))?;
    let needed = fee
        .checked_add(DUST_LIMIT)
        .ok_or_else(|| amount_overflow("fee"))?;
    if inputs.is_empty() || total < needed {
        return Err(BridgeError::InsufficientFunds {
            needed,
            available: total,
        });
    }
    Ok(Selection {
        inputs,
        fee,
        change: total - fee,
    })
}

fn fee_for(fee_rate: u64, vsize: u64) -> BridgeResult<u64> {
    fee_rate
        .checked_mul(vsize)
        .ok_or_else(|| amount_overflow("fee"))
}

fn amount_overflow(what: &str) -> BridgeError {
    BridgeError::Payload(format!("{} overflows u64", what))
}

fn ordered_unspent(unspent: &[Unspent]) -> Vec<Unspent> {
    let mut ordered = unspent.to_vec();
    ordered.sort_by(|a, b| {
        b.value
            .cmp(&a.value)
            .then_with(|| a.txid.cmp(&b.txid))
            .then_with(|| a.vout.cmp(&b.vout))
    });
    ordered.dedup_by(|a, b| a.txid == b.txid && a.vout == b.vout);
    ordered
}

const P2WSH_SCRIPT_LEN: usize = 34;

/// Virtual size of a spend of `inputs` custodian outputs (m-of-n P2WSH)
/// paying to outputs with the given script lengths
pub fn estimate_vsize(inputs: usize, output_scripts: &[usize], m: usize, n: usize) -> u64 {
    // version + locktime + input/output counts
    let mut base = 4 + 4 + varint_len(inputs) + varint_len(output_scripts.len());
    // outpoint + empty script_sig + sequence
    base += inputs * (36 + 1 + 4);
    for script_len in output_scripts {
        base += 8 + varint_len(*script_len) + script_len;
    }

    let witness_script_len = 3 + 34 * n;
    let per_input_witness = varint_len(m + 2)
        + 1
        + m * (1 + MAX_SIG_WITNESS_LEN)
        + varint_len(witness_script_len)
        + witness_script_len;
    // segwit marker and flag
    let weight = base * 4 + 2 + inputs * per_input_witness;
    weight.div_ceil(4) as u64
}

fn varint_len(n: usize) -> usize {
    match n {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        0x10000..=0xffff_ffff => 5,
        _ => 9,
    }
}

fn home_binding_script(kind: TxKind, home_tx_hash: &str) -> BridgeResult<ScriptBuf> {
    let hash = parse_bytes32(home_tx_hash).ok_or_else(|| {
        BridgeError::Payload(format!("home tx hash {} is not 32 bytes", home_tx_hash))
    })?;
    let mut data = Vec::with_capacity(33);
    data.push(kind.tag());
    data.extend_from_slice(&hash);
    let push = PushBytesBuf::try_from(data)
        .map_err(|e| BridgeError::Payload(format!("data output: {}", e)))?;
    Ok(ScriptBuf::new_op_return(push))
}

/// Payload of an `OP_RETURN` output
pub fn op_return_data(script: &Script) -> Option<Vec<u8>> {
    if !script.is_op_return() {
        return None;
    }
    let mut instructions = script.instructions();
    instructions.next();
    match instructions.next() {
        Some(Ok(Instruction::PushBytes(bytes))) => Some(bytes.as_bytes().to_vec()),
        _ => Some(Vec::new()),
    }
}

/// Kind and home tx hash bound into a custodian spend
pub fn home_binding(tx: &Transaction) -> Option<(TxKind, String)> {
    tx.output.iter().find_map(|out| {
        let data = op_return_data(&out.script_pubkey)?;
        if data.len() != 33 {
            return None;
        }
        let kind = TxKind::from_tag(data[0])?;
        Some((kind, hex::encode(&data[1..])))
    })
}

/// UTF-8 memo carried by a deposit's `OP_RETURN` output
pub fn deposit_memo(tx: &Transaction) -> Option<String> {
    tx.output.iter().find_map(|out| {
        let data = op_return_data(&out.script_pubkey)?;
        String::from_utf8(data).ok().filter(|s| !s.is_empty())
    })
}

fn sighashes(payload: &UtxoPayload) -> BridgeResult<(Transaction, Vec<[u8; 32]>)> {
    let tx: Transaction = bitcoin::consensus::deserialize(&payload.unsigned_tx)
        .map_err(|e| BridgeError::Payload(format!("undecodable payload tx: {}", e)))?;
    if tx.input.len() != payload.inputs.len() {
        return Err(BridgeError::Payload(
            "payload inputs do not match transaction".to_string(),
        ));
    }
    let script = Script::from_bytes(&payload.witness_script);
    let mut cache = SighashCache::new(&tx);
    let mut digests = Vec::with_capacity(tx.input.len());
    for (index, utxo) in payload.inputs.iter().enumerate() {
        let sighash = cache
            .p2wsh_signature_hash(
                index,
                script,
                Amount::from_sat(utxo.value),
                EcdsaSighashType::All,
            )
            .map_err(|e| BridgeError::Payload(format!("sighash for input {}: {}", index, e)))?;
        digests.push(sighash.to_byte_array());
    }
    drop(cache);
    Ok((tx, digests))
}

fn script_contains_key(witness_script: &[u8], key: &[u8]) -> bool {
    Script::from_bytes(witness_script)
        .instructions()
        .any(|ins| matches!(ins, Ok(Instruction::PushBytes(bytes)) if bytes.as_bytes() == key))
}
