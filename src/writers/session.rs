//! Outbound signing sessions and per-home-tx locks

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::chain::UnsignedPayload;
use crate::quorum::has_quorum;
use crate::types::{CustodianSet, CustodianSignature, OutboundRequest, TxKind};

/// Signature collection state for one home-ledger transaction.
///
/// Checkpointed to the store on every change so a restart resumes the same
/// payload instead of originating a second outbound transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundSigningSession {
    pub home_tx_hash: String,
    pub request: OutboundRequest,
    pub payload: UnsignedPayload,
    /// Custodian set the payload was built for
    pub custodians: CustodianSet,
    /// Verified signatures keyed by custodian public key
    pub signatures: BTreeMap<String, CustodianSignature>,
    /// This node's 1-based position in the custodian set
    pub send_order: usize,
    /// Unix seconds before which this node does not broadcast
    pub waiting_end_time: i64,
    /// Unix seconds after which a missing quorum hands over to resend
    pub max_waiting_end_time: i64,
    pub broadcast_tx_hash: Option<String>,
    pub created_at: i64,
}

/// Staggered broadcast windows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowPolicy {
    pub slot_secs: i64,
    pub max_window_secs: i64,
}

impl WindowPolicy {
    /// (waiting end, max waiting end) for a session touched at `now`
    pub fn window(&self, now: i64, send_order: usize) -> (i64, i64) {
        let offset = (send_order.saturating_sub(1) as i64) * self.slot_secs;
        let waiting_end = now + offset;
        (waiting_end, (now + self.max_window_secs).max(waiting_end))
    }
}

impl OutboundSigningSession {
    pub fn new(
        request: OutboundRequest,
        payload: UnsignedPayload,
        custodians: CustodianSet,
        send_order: usize,
        now: i64,
        policy: &WindowPolicy,
    ) -> Self {
        let (waiting_end_time, max_waiting_end_time) = policy.window(now, send_order);
        Self {
            home_tx_hash: crate::hash::normalize_hash(&request.home_tx_hash),
            request,
            payload,
            custodians,
            signatures: BTreeMap::new(),
            send_order,
            waiting_end_time,
            max_waiting_end_time,
            broadcast_tx_hash: None,
            created_at: now,
        }
    }

    pub fn kind(&self) -> TxKind {
        self.request.kind()
    }

    pub fn has_quorum(&self) -> bool {
        has_quorum(self.signatures.len(), self.custodians.n())
    }

    pub fn is_broadcast(&self) -> bool {
        self.broadcast_tx_hash.is_some()
    }

    pub fn window_open(&self, now: i64) -> bool {
        now >= self.waiting_end_time
    }

    pub fn expired(&self, now: i64) -> bool {
        now >= self.max_waiting_end_time
    }

    /// Push both windows forward; they never move backwards
    pub fn refresh_window(&mut self, now: i64, policy: &WindowPolicy) {
        let (waiting_end, max_waiting_end) = policy.window(now, self.send_order);
        self.waiting_end_time = self.waiting_end_time.max(waiting_end);
        self.max_waiting_end_time = self.max_waiting_end_time.max(max_waiting_end);
    }

    /// Inputs or nonce binding the payload commits to, for status output
    pub fn required_inputs(&self) -> Vec<String> {
        match &self.payload {
            UnsignedPayload::Account(p) => vec![p.tx_key.clone()],
            UnsignedPayload::Utxo(p) => p
                .inputs
                .iter()
                .map(|u| format!("{}:{}", u.txid, u.vout))
                .collect(),
        }
    }
}

/// One async mutex per home tx hash, so a node never runs two signing
/// attempts for the same home-ledger transaction concurrently.
#[derive(Default)]
pub struct SessionLocks {
    locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, home_tx_hash: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self
                .locks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            // Drop entries nobody holds any more
            locks.retain(|_, l| Arc::strong_count(l) > 1);
            locks
                .entry(home_tx_hash.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::account::{AccountCall, AccountPayload};
    use crate::types::{Asset, OutboundParams};
    use std::time::Duration;

    fn session(send_order: usize) -> OutboundSigningSession {
        let request = OutboundRequest {
            home_tx_hash: "0xAB".into(),
            params: OutboundParams::Withdraw {
                to: "0x01".into(),
                amount: 1,
                asset: Asset::Native { decimals: 18 },
            },
            fee_rate: None,
        };
        let payload = UnsignedPayload::Account(AccountPayload {
            tx_key: "ab".into(),
            call: AccountCall::Upgrade {
                contract: "0x01".into(),
            },
            digest: String::new(),
        });
        OutboundSigningSession::new(
            request,
            payload,
            CustodianSet::new(["aa", "bb", "cc", "dd", "ee"]),
            send_order,
            1_000,
            &WindowPolicy {
                slot_secs: 60,
                max_window_secs: 600,
            },
        )
    }

    #[test]
    fn test_windows_stagger_by_send_order() {
        let first = session(1);
        assert_eq!(first.home_tx_hash, "ab");
        assert!(first.window_open(1_000));
        let third = session(3);
        assert!(!third.window_open(1_119));
        assert!(third.window_open(1_120));
        assert_eq!(third.max_waiting_end_time, 1_600);
    }

    #[test]
    fn test_refresh_is_monotonic() {
        let policy = WindowPolicy {
            slot_secs: 60,
            max_window_secs: 600,
        };
        let mut s = session(2);
        s.refresh_window(500, &policy);
        assert_eq!(s.waiting_end_time, 1_060);
        assert_eq!(s.max_waiting_end_time, 1_600);
        s.refresh_window(2_000, &policy);
        assert_eq!(s.waiting_end_time, 2_060);
        assert_eq!(s.max_waiting_end_time, 2_600);
    }

    #[test]
    fn test_quorum_counts_signatures() {
        let mut s = session(1);
        for key in ["aa", "bb", "cc"] {
            s.signatures.insert(
                key.into(),
                CustodianSignature {
                    pubkey: key.into(),
                    parts: vec![],
                },
            );
        }
        assert!(!s.has_quorum());
        s.signatures.insert(
            "dd".into(),
            CustodianSignature {
                pubkey: "dd".into(),
                parts: vec![],
            },
        );
        assert!(s.has_quorum());
    }

    #[tokio::test]
    async fn test_lock_serializes_same_hash() {
        let locks = Arc::new(SessionLocks::new());
        let guard = locks.lock("ab").await;

        let other = locks.clone();
        let waiter = tokio::spawn(async move {
            let _g = other.lock("ab").await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        // A different hash is not blocked
        let _unrelated = locks.lock("cd").await;

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
