//! JSON-RPC client for an external chain adapter sidecar
//!
//! The sidecar owns the chain's native RPC encoding and answers a small set
//! of `adapter_*` methods. Transactions travel in their family shape:
//! account transactions as fields, UTXO transactions as raw consensus bytes
//! plus the outputs their inputs spend.

use std::time::Duration;

use async_trait::async_trait;
use bitcoin::{Amount, ScriptBuf, TxOut};
use eyre::Result;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;

use crate::chain::{
    hex_bytes, AccountTx, Block, BlockHeader, ChainReader, ChainTx, Receipt, SignedTx, TxLog,
    Unspent, UtxoTx,
};
use crate::error::ChainError;
use crate::hash::parse_bytes32;
use crate::rpc_fallback::{JsonRpcTransport, RpcCallError};

const RPC_TIMEOUT: Duration = Duration::from_secs(30);

pub struct JsonRpcChainClient {
    transport: JsonRpcTransport,
}

#[derive(Debug, Deserialize)]
struct WireBlock {
    header: BlockHeader,
    #[serde(default)]
    txs: Vec<WireTx>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
enum WireTx {
    Account {
        hash: String,
        from: String,
        to: Option<String>,
        #[serde(with = "crate::types::decimal_u128")]
        value: u128,
        #[serde(with = "hex_bytes", default)]
        input: Vec<u8>,
    },
    Utxo {
        #[serde(with = "hex_bytes")]
        raw: Vec<u8>,
        #[serde(default)]
        prevouts: Vec<Option<WirePrevout>>,
    },
}

#[derive(Debug, Deserialize)]
struct WirePrevout {
    value: u64,
    #[serde(with = "hex_bytes")]
    script_pubkey: Vec<u8>,
}

#[derive(Debug, Deserialize)]
struct WireReceipt {
    tx_hash: String,
    block_height: u64,
    block_hash: String,
    success: bool,
    #[serde(default)]
    logs: Vec<WireLog>,
}

#[derive(Debug, Deserialize)]
struct WireLog {
    address: String,
    topics: Vec<String>,
    #[serde(with = "hex_bytes", default)]
    data: Vec<u8>,
}

impl JsonRpcChainClient {
    pub fn new(urls: Vec<String>) -> Result<Self> {
        Ok(Self {
            transport: JsonRpcTransport::new(urls, RPC_TIMEOUT)?,
        })
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<Option<T>, ChainError> {
        self.transport
            .call(method, params)
            .await
            .map_err(|e| ChainError::Rpc(format!("{}: {}", method, e)))
    }

    async fn call_required<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T, ChainError> {
        self.call(method, params)
            .await?
            .ok_or_else(|| ChainError::NotFound(format!("{} returned no result", method)))
    }
}

impl TryFrom<WireTx> for ChainTx {
    type Error = ChainError;

    fn try_from(wire: WireTx) -> Result<Self, Self::Error> {
        match wire {
            WireTx::Account {
                hash,
                from,
                to,
                value,
                input,
            } => Ok(ChainTx::Account(AccountTx {
                hash,
                from,
                to,
                value,
                input,
            })),
            WireTx::Utxo { raw, prevouts } => {
                let tx: bitcoin::Transaction = bitcoin::consensus::deserialize(&raw)
                    .map_err(|e| ChainError::Decode(format!("utxo tx: {}", e)))?;
                let mut prevouts: Vec<Option<TxOut>> = prevouts
                    .into_iter()
                    .map(|p| {
                        p.map(|p| TxOut {
                            value: Amount::from_sat(p.value),
                            script_pubkey: ScriptBuf::from_bytes(p.script_pubkey),
                        })
                    })
                    .collect();
                prevouts.resize(tx.input.len(), None);
                Ok(ChainTx::Utxo(UtxoTx { tx, prevouts }))
            }
        }
    }
}

impl TryFrom<WireReceipt> for Receipt {
    type Error = ChainError;

    fn try_from(wire: WireReceipt) -> Result<Self, Self::Error> {
        let logs = wire
            .logs
            .into_iter()
            .map(|log| {
                let topics = log
                    .topics
                    .iter()
                    .map(|t| {
                        parse_bytes32(t)
                            .ok_or_else(|| ChainError::Decode(format!("bad log topic: {}", t)))
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(TxLog {
                    address: log.address.to_lowercase(),
                    topics,
                    data: log.data,
                })
            })
            .collect::<Result<Vec<_>, ChainError>>()?;
        Ok(Receipt {
            tx_hash: wire.tx_hash,
            block_height: wire.block_height,
            block_hash: wire.block_hash,
            success: wire.success,
            logs,
        })
    }
}

#[async_trait]
impl ChainReader for JsonRpcChainClient {
    async fn get_tip_height(&self) -> Result<u64, ChainError> {
        self.call_required("adapter_tipHeight", json!([])).await
    }

    async fn get_header(&self, height: u64) -> Result<Option<BlockHeader>, ChainError> {
        self.call("adapter_header", json!([height])).await
    }

    async fn get_block(&self, height: u64) -> Result<Block, ChainError> {
        let wire: WireBlock = self
            .call("adapter_block", json!([height]))
            .await?
            .ok_or_else(|| ChainError::NotFound(format!("block {}", height)))?;
        let txs = wire
            .txs
            .into_iter()
            .map(ChainTx::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Block {
            header: wire.header,
            txs,
        })
    }

    async fn get_transaction_receipt(&self, hash: &str) -> Result<Option<Receipt>, ChainError> {
        let wire: Option<WireReceipt> = self.call("adapter_receipt", json!([hash])).await?;
        wire.map(Receipt::try_from).transpose()
    }

    async fn estimate_fee_rate(&self) -> Result<u64, ChainError> {
        self.call_required("adapter_feeRate", json!([])).await
    }

    async fn list_unspent(&self, address: &str) -> Result<Vec<Unspent>, ChainError> {
        Ok(self
            .call("adapter_unspent", json!([address]))
            .await?
            .unwrap_or_default())
    }

    async fn broadcast(&self, tx: &SignedTx) -> Result<String, ChainError> {
        match self
            .transport
            .call::<String>("adapter_broadcast", json!([tx]))
            .await
        {
            Ok(Some(hash)) => Ok(hash),
            Ok(None) => Err(ChainError::Rpc("broadcast returned no hash".to_string())),
            Err(RpcCallError::Rpc { code, message }) => {
                Err(ChainError::Rejected(format!("{}: {}", code, message)))
            }
            Err(e) => Err(ChainError::Rpc(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_account_tx() {
        let wire: WireTx = serde_json::from_value(json!({
            "family": "account",
            "hash": "0xaa",
            "from": "0x01",
            "to": "0x02",
            "value": "1000000000000000000000",
            "input": "0x"
        }))
        .unwrap();
        let ChainTx::Account(tx) = ChainTx::try_from(wire).unwrap() else {
            panic!("expected account tx");
        };
        assert_eq!(tx.value, 1_000_000_000_000_000_000_000);
        assert!(tx.input.is_empty());
    }

    #[test]
    fn test_wire_receipt_rejects_bad_topic() {
        let wire: WireReceipt = serde_json::from_value(json!({
            "tx_hash": "0xaa",
            "block_height": 5,
            "block_hash": "0xbb",
            "success": true,
            "logs": [{"address": "0xAB", "topics": ["0x1234"], "data": "0x"}]
        }))
        .unwrap();
        assert!(matches!(Receipt::try_from(wire), Err(ChainError::Decode(_))));
    }

    #[test]
    fn test_client_requires_url() {
        assert!(JsonRpcChainClient::new(vec![]).is_err());
    }
}
