//! JSON-RPC client for the home node's bridge endpoints

use std::time::Duration;

use async_trait::async_trait;
use eyre::Result;
use serde::de::DeserializeOwned;
use serde_json::json;

use crate::error::CallbackError;
use crate::home::{DepositNotice, FeeNotice, HomeLedger, HomeTx, OutboundConfirmation};
use crate::rpc_fallback::{parse_rpc_urls, JsonRpcTransport, RpcCallError};
use crate::types::{CustodianSet, CustodianSignature};

/// JSON-RPC error code the home node uses for already-recorded events
pub const DUPLICATE_ERROR_CODE: i64 = -32010;

const RPC_TIMEOUT: Duration = Duration::from_secs(15);

pub struct HttpHomeLedger {
    transport: JsonRpcTransport,
}

impl HttpHomeLedger {
    pub fn new(rpc_url: &str) -> Result<Self> {
        Ok(Self {
            transport: JsonRpcTransport::new(parse_rpc_urls(rpc_url), RPC_TIMEOUT)?,
        })
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<Option<T>, CallbackError> {
        self.transport
            .call(method, params)
            .await
            .map_err(classify_rpc_error)
    }

    async fn call_required<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T, CallbackError> {
        self.call(method, params)
            .await?
            .ok_or_else(|| CallbackError::Other(format!("{} returned no result", method)))
    }
}

/// Map a JSON-RPC failure onto the duplicate/other split callers act on
pub fn classify_rpc_error(error: RpcCallError) -> CallbackError {
    match error {
        RpcCallError::Rpc { code, message } => {
            let lower = message.to_lowercase();
            if code == DUPLICATE_ERROR_CODE
                || lower.contains("duplicate")
                || lower.contains("already exists")
            {
                CallbackError::Duplicate(message)
            } else {
                CallbackError::Other(format!("{}: {}", code, message))
            }
        }
        RpcCallError::Transport(message) => CallbackError::Other(message),
    }
}

#[async_trait]
impl HomeLedger for HttpHomeLedger {
    async fn submit_pending_deposit(&self, notice: &DepositNotice) -> Result<(), CallbackError> {
        self.call::<serde_json::Value>("bridge_submitPendingDeposit", json!([notice]))
            .await
            .map(|_| ())
    }

    async fn submit_confirmed_deposit(
        &self,
        notice: &DepositNotice,
    ) -> Result<String, CallbackError> {
        self.call_required("bridge_submitConfirmedDeposit", json!([notice]))
            .await
    }

    async fn submit_confirmed_outbound(
        &self,
        confirmation: &OutboundConfirmation,
    ) -> Result<(), CallbackError> {
        self.call::<serde_json::Value>("bridge_submitConfirmedOutbound", json!([confirmation]))
            .await
            .map(|_| ())
    }

    async fn submit_withdrawal_fee(&self, notice: &FeeNotice) -> Result<(), CallbackError> {
        self.call::<serde_json::Value>("bridge_submitWithdrawalFee", json!([notice]))
            .await
            .map(|_| ())
    }

    async fn get_home_tx(&self, home_tx_hash: &str) -> Result<Option<HomeTx>, CallbackError> {
        self.call("bridge_getTx", json!([home_tx_hash])).await
    }

    async fn get_home_tip_height(&self) -> Result<u64, CallbackError> {
        self.call_required("bridge_tipHeight", json!([])).await
    }

    async fn get_current_custodian_set(&self) -> Result<CustodianSet, CallbackError> {
        self.call_required("bridge_custodianSet", json!([])).await
    }

    async fn request_quorum_signatures(
        &self,
        home_tx_hash: &str,
        chain_id: u16,
    ) -> Result<Vec<CustodianSignature>, CallbackError> {
        Ok(self
            .call("bridge_quorumSignatures", json!([home_tx_hash, chain_id]))
            .await?
            .unwrap_or_default())
    }
}
