//! Transaction classifier
//!
//! Decides whether an external-chain transaction is a bridge event. Checks
//! run in a fixed order and the first match wins:
//!
//! 1. a transaction this node broadcast (watch set)
//! 2. a call to the custodian contract with an outbound selector
//! 3. a native transfer to the custodian address
//! 4. a registered token moved to the custodian address
//! 5. anything else is irrelevant
//!
//! UTXO transactions are classified by which side touches the custodian
//! script. Deposits must carry a memo naming the home-ledger recipient;
//! `fee:<home tx hash>` marks an extra withdrawal fee instead.

use tracing::debug;

use crate::chain::account::{decode_token_transfer, DecodedCall};
use crate::chain::utxo::{deposit_memo, home_binding};
use crate::chain::{AccountTx, BlockHeader, ChainFamily, ChainTx, Receipt, UtxoTx};
use crate::context::ChainContext;
use crate::error::ChainError;
use crate::hash::{normalize_hash, parse_bytes32};
use crate::types::{Asset, PendingBridgeTx, TxKind, TxStatus};

/// Memo prefix marking an extra withdrawal fee payment
pub const FEE_MEMO_PREFIX: &str = "fee:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Irrelevant,
    Event(PendingBridgeTx),
    /// Touches the custodian address but must not be credited
    Rejected(String),
}

pub fn native_decimals(family: &ChainFamily) -> u8 {
    match family {
        ChainFamily::Account(_) => 18,
        ChainFamily::Utxo(_) => 8,
    }
}

pub struct Classifier<'a> {
    ctx: &'a ChainContext,
}

impl<'a> Classifier<'a> {
    pub fn new(ctx: &'a ChainContext) -> Self {
        Self { ctx }
    }

    pub async fn classify(
        &self,
        header: &BlockHeader,
        tx: &ChainTx,
    ) -> Result<Classification, ChainError> {
        let hash = tx.hash();

        // Rule 1: our own broadcast, whatever its payload looks like
        if self.ctx.is_watched(&hash).await {
            if let Some(event) = self.own_broadcast(header, tx, &hash).await? {
                return Ok(Classification::Event(event));
            }
        }

        match tx {
            ChainTx::Account(tx) => self.classify_account(header, tx).await,
            ChainTx::Utxo(tx) => Ok(self.classify_utxo(header, tx, &hash)),
        }
    }

    async fn own_broadcast(
        &self,
        header: &BlockHeader,
        tx: &ChainTx,
        hash: &str,
    ) -> Result<Option<PendingBridgeTx>, ChainError> {
        let stored = self
            .ctx
            .store
            .get_pending_tx(&self.ctx.name, hash)
            .await
            .map_err(|e| ChainError::Rpc(format!("store lookup failed: {:#}", e)))?;
        let Some(mut record) = stored.filter(|r| !r.is_inbound()) else {
            return Ok(None);
        };
        let status = match tx {
            ChainTx::Account(_) => {
                let receipt = self.receipt(hash).await?;
                self.ctx.family.outbound_status(record.kind, Some(&receipt))
            }
            ChainTx::Utxo(_) => TxStatus::Completed,
        };
        place_in_block(&mut record, header);
        record.status = status;
        Ok(Some(record))
    }

    async fn classify_account(
        &self,
        header: &BlockHeader,
        tx: &AccountTx,
    ) -> Result<Classification, ChainError> {
        let ChainFamily::Account(family) = &self.ctx.family else {
            return Ok(Classification::Irrelevant);
        };
        let to_custodian = tx.to.as_deref().is_some_and(|to| family.is_multisig(to));
        let token = tx.to.as_deref().and_then(|to| self.ctx.token(to));
        if !to_custodian && token.is_none() {
            return Ok(Classification::Irrelevant);
        }

        let receipt = self.receipt(&tx.hash).await?;
        if !receipt.success {
            debug!(chain = %self.ctx.name, tx_hash = %tx.hash, "Skipping reverted transaction");
            return Ok(Classification::Irrelevant);
        }

        if to_custodian {
            match family.decode_multisig_call(&tx.input) {
                // Rule 2: outbound selector
                Some(DecodedCall::Outbound {
                    kind,
                    tx_key,
                    to,
                    amount,
                    erc20,
                }) => {
                    let asset = match erc20 {
                        Some(contract) => self.token_asset(&contract),
                        None => Asset::Native {
                            decimals: native_decimals(&self.ctx.family),
                        },
                    };
                    let mut record = PendingBridgeTx::new(&tx.hash, kind, asset);
                    record.home_tx_hash = Some(normalize_hash(&tx_key));
                    record.status = family.outbound_status(kind, Some(&receipt));
                    record.from = tx.from.clone();
                    record.to = to.unwrap_or_default();
                    record.amount = amount;
                    place_in_block(&mut record, header);
                    return Ok(Classification::Event(record));
                }
                // Rules 3 and 4 through the deposit entry point
                Some(DecodedCall::CrossOut { memo, amount, erc20 }) => {
                    return Ok(match erc20 {
                        None => self.inbound(header, &tx.hash, &tx.from, family.multisig_str(), tx.value, self.native(), Some(memo)),
                        Some(contract) => {
                            let confirmed = family
                                .cross_out_events(&receipt)
                                .into_iter()
                                .find(|e| e.erc20.as_deref() == Some(contract.as_str()) && e.memo == memo);
                            match confirmed {
                                Some(event) => match self.bound_token(&contract) {
                                    Ok(asset) => self.inbound(header, &tx.hash, &tx.from, family.multisig_str(), event.amount, asset, Some(memo)),
                                    Err(reason) => Classification::Rejected(reason),
                                },
                                None => Classification::Rejected(format!(
                                    "crossOut of {} amount {} without matching event",
                                    contract, amount
                                )),
                            }
                        }
                    });
                }
                None => {}
            }

            // Rule 3: plain native transfer, memo in call data
            if tx.value > 0 {
                let memo = (!tx.input.is_empty())
                    .then(|| String::from_utf8(tx.input.clone()).ok())
                    .flatten();
                return Ok(self.inbound(header, &tx.hash, &tx.from, family.multisig_str(), tx.value, self.native(), memo));
            }
            return Ok(Classification::Irrelevant);
        }

        // Rule 4: registered token transferred straight to the custodian
        if let Some(token) = token {
            if let Some((recipient, amount)) = decode_token_transfer(&tx.input) {
                if family.is_multisig(&recipient) && amount > 0 {
                    return Ok(match self.bound_token(&token.contract) {
                        Ok(asset) => self.inbound(header, &tx.hash, &tx.from, family.multisig_str(), amount, asset, None),
                        Err(reason) => Classification::Rejected(reason),
                    });
                }
            }
        }
        Ok(Classification::Irrelevant)
    }

    fn classify_utxo(&self, header: &BlockHeader, tx: &UtxoTx, hash: &str) -> Classification {
        let ChainFamily::Utxo(family) = &self.ctx.family else {
            return Classification::Irrelevant;
        };

        let spends: Vec<bool> = tx
            .tx
            .input
            .iter()
            .enumerate()
            .map(|(i, _)| {
                tx.prevouts
                    .get(i)
                    .and_then(Option::as_ref)
                    .is_some_and(|out| family.is_custodian_script(&out.script_pubkey))
            })
            .collect();
        let any_custodian_input = spends.iter().any(|s| *s);
        let all_custodian_inputs = !spends.is_empty() && spends.iter().all(|s| *s);
        let paid: u64 = tx
            .tx
            .output
            .iter()
            .filter(|out| family.is_custodian_script(&out.script_pubkey))
            .map(|out| out.value.to_sat())
            .sum();

        if any_custodian_input && !all_custodian_inputs {
            return Classification::Rejected(
                "mixes custodian and foreign inputs".to_string(),
            );
        }

        if all_custodian_inputs {
            let Some((kind, home_tx_hash)) = home_binding(&tx.tx) else {
                return Classification::Rejected("custodian spend without home binding".to_string());
            };
            if !kind.is_outbound() {
                return Classification::Rejected(format!("custodian spend tagged {}", kind));
            }
            let recipient = tx.tx.output.iter().find(|out| {
                !out.script_pubkey.is_op_return() && !family.is_custodian_script(&out.script_pubkey)
            });
            let mut record = PendingBridgeTx::new(hash, kind, self.native());
            record.home_tx_hash = Some(home_tx_hash);
            // Inclusion in a block is completion for a UTXO spend
            record.status = TxStatus::Completed;
            record.from = family.multisig_str().to_string();
            match recipient {
                Some(out) => {
                    record.to = family.address_of(&out.script_pubkey).unwrap_or_default();
                    record.amount = u128::from(out.value.to_sat());
                }
                // Sweep to the next custodian script
                None => record.to = family.multisig_str().to_string(),
            }
            place_in_block(&mut record, header);
            return Classification::Event(record);
        }

        if paid > 0 {
            let from = tx
                .prevouts
                .iter()
                .flatten()
                .find_map(|out| family.address_of(&out.script_pubkey))
                .unwrap_or_default();
            return self.inbound(
                header,
                hash,
                &from,
                family.multisig_str(),
                u128::from(paid),
                self.native(),
                deposit_memo(&tx.tx),
            );
        }

        Classification::Irrelevant
    }

    /// Deposit or fee record, depending on the memo
    #[allow(clippy::too_many_arguments)]
    fn inbound(
        &self,
        header: &BlockHeader,
        hash: &str,
        from: &str,
        to: &str,
        amount: u128,
        asset: Asset,
        memo: Option<String>,
    ) -> Classification {
        if amount == 0 {
            return Classification::Rejected("zero amount".to_string());
        }
        let Some(memo) = memo.filter(|m| !m.trim().is_empty()) else {
            return Classification::Rejected("deposit without memo".to_string());
        };

        let mut record = if let Some(fee_for) = memo.strip_prefix(FEE_MEMO_PREFIX) {
            let Some(home_hash) = parse_bytes32(fee_for.trim()) else {
                return Classification::Rejected(format!("malformed fee memo: {}", memo));
            };
            let mut record = PendingBridgeTx::new(hash, TxKind::FeeRecord, asset);
            record.home_tx_hash = Some(hex::encode(home_hash));
            record
        } else {
            if let Err(e) = self.ctx.codec.decode(&memo) {
                return Classification::Rejected(format!("invalid memo address {}: {}", memo, e));
            }
            PendingBridgeTx::new(hash, TxKind::Deposit, asset)
        };
        // Kept verbatim so revalidation can match it against the event log
        record.memo_address = Some(memo);
        record.from = from.to_string();
        record.to = to.to_string();
        record.amount = amount;
        place_in_block(&mut record, header);
        Classification::Event(record)
    }

    fn native(&self) -> Asset {
        Asset::Native {
            decimals: native_decimals(&self.ctx.family),
        }
    }

    fn token_asset(&self, contract: &str) -> Asset {
        let decimals = self.ctx.token(contract).map_or(18, |t| t.decimals);
        Asset::Token {
            contract: contract.to_lowercase(),
            decimals,
        }
    }

    /// A registered token whose home asset, if bound, is bound to this very
    /// contract
    fn bound_token(&self, contract: &str) -> Result<Asset, String> {
        let contract = contract.to_lowercase();
        let Some(token) = self.ctx.token(&contract) else {
            return Err(format!("unregistered token {}", contract));
        };
        if let Some(home_asset) = &token.home_asset {
            let bound = self
                .ctx
                .tokens
                .iter()
                .find(|t| t.home_asset.as_ref() == Some(home_asset))
                .map(|t| t.contract.as_str());
            if bound != Some(contract.as_str()) {
                return Err(format!(
                    "token {} is not the contract bound to home asset {}",
                    contract, home_asset
                ));
            }
        }
        Ok(Asset::Token {
            contract,
            decimals: token.decimals,
        })
    }

    async fn receipt(&self, hash: &str) -> Result<Receipt, ChainError> {
        self.ctx
            .reader
            .get_transaction_receipt(hash)
            .await?
            .ok_or_else(|| ChainError::NotFound(format!("receipt for {}", hash)))
    }
}

fn place_in_block(record: &mut PendingBridgeTx, header: &BlockHeader) {
    record.block_height = Some(header.height);
    record.block_hash = Some(header.hash.clone());
    record.tx_time = header.time;
}
