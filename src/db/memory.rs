//! In-memory store for tests and database-less runs

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use eyre::Result;
use tokio::sync::RwLock;

use crate::db::BridgeStore;
use crate::types::{LocalBlockHeader, PendingBridgeTx};
use crate::writers::session::OutboundSigningSession;

#[derive(Default)]
struct ChainState {
    /// Insertion order is kept so listing matches the Postgres ordering
    pending: Vec<PendingBridgeTx>,
    headers: BTreeMap<u64, LocalBlockHeader>,
    sessions: BTreeMap<String, OutboundSigningSession>,
    resends: HashMap<String, u32>,
    completed: HashMap<String, String>,
}

#[derive(Default)]
pub struct MemoryStore {
    chains: RwLock<HashMap<String, ChainState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BridgeStore for MemoryStore {
    async fn save_pending_tx(&self, chain: &str, tx: &PendingBridgeTx) -> Result<()> {
        let mut chains = self.chains.write().await;
        let state = chains.entry(chain.to_string()).or_default();
        match state
            .pending
            .iter_mut()
            .find(|p| p.external_tx_hash == tx.external_tx_hash)
        {
            Some(existing) => *existing = tx.clone(),
            None => state.pending.push(tx.clone()),
        }
        Ok(())
    }

    async fn get_pending_tx(
        &self,
        chain: &str,
        external_tx_hash: &str,
    ) -> Result<Option<PendingBridgeTx>> {
        let chains = self.chains.read().await;
        Ok(chains.get(chain).and_then(|s| {
            s.pending
                .iter()
                .find(|p| p.external_tx_hash == external_tx_hash)
                .cloned()
        }))
    }

    async fn find_pending_by_home_hash(
        &self,
        chain: &str,
        home_tx_hash: &str,
    ) -> Result<Vec<PendingBridgeTx>> {
        let chains = self.chains.read().await;
        Ok(chains
            .get(chain)
            .map(|s| {
                s.pending
                    .iter()
                    .filter(|p| p.home_tx_hash.as_deref() == Some(home_tx_hash))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn delete_pending_tx(&self, chain: &str, external_tx_hash: &str) -> Result<()> {
        let mut chains = self.chains.write().await;
        if let Some(state) = chains.get_mut(chain) {
            state
                .pending
                .retain(|p| p.external_tx_hash != external_tx_hash);
        }
        Ok(())
    }

    async fn list_pending_txs(&self, chain: &str) -> Result<Vec<PendingBridgeTx>> {
        let chains = self.chains.read().await;
        Ok(chains
            .get(chain)
            .map(|s| s.pending.clone())
            .unwrap_or_default())
    }

    async fn latest_header(&self, chain: &str) -> Result<Option<LocalBlockHeader>> {
        let chains = self.chains.read().await;
        Ok(chains
            .get(chain)
            .and_then(|s| s.headers.values().next_back().cloned()))
    }

    async fn get_header(&self, chain: &str, height: u64) -> Result<Option<LocalBlockHeader>> {
        let chains = self.chains.read().await;
        Ok(chains.get(chain).and_then(|s| s.headers.get(&height).cloned()))
    }

    async fn append_header(&self, chain: &str, header: &LocalBlockHeader) -> Result<()> {
        let mut chains = self.chains.write().await;
        chains
            .entry(chain.to_string())
            .or_default()
            .headers
            .insert(header.height, header.clone());
        Ok(())
    }

    async fn delete_header(&self, chain: &str, height: u64) -> Result<()> {
        let mut chains = self.chains.write().await;
        if let Some(state) = chains.get_mut(chain) {
            state.headers.remove(&height);
        }
        Ok(())
    }

    async fn prune_headers(&self, chain: &str, min_height: u64) -> Result<()> {
        let mut chains = self.chains.write().await;
        if let Some(state) = chains.get_mut(chain) {
            state.headers = state.headers.split_off(&min_height);
        }
        Ok(())
    }

    async fn clear_headers(&self, chain: &str) -> Result<()> {
        let mut chains = self.chains.write().await;
        if let Some(state) = chains.get_mut(chain) {
            state.headers.clear();
        }
        Ok(())
    }

    async fn count_headers(&self, chain: &str) -> Result<usize> {
        let chains = self.chains.read().await;
        Ok(chains.get(chain).map(|s| s.headers.len()).unwrap_or(0))
    }

    async fn save_session(&self, chain: &str, session: &OutboundSigningSession) -> Result<()> {
        let mut chains = self.chains.write().await;
        chains
            .entry(chain.to_string())
            .or_default()
            .sessions
            .insert(session.home_tx_hash.clone(), session.clone());
        Ok(())
    }

    async fn get_session(
        &self,
        chain: &str,
        home_tx_hash: &str,
    ) -> Result<Option<OutboundSigningSession>> {
        let chains = self.chains.read().await;
        Ok(chains
            .get(chain)
            .and_then(|s| s.sessions.get(home_tx_hash).cloned()))
    }

    async fn delete_session(&self, chain: &str, home_tx_hash: &str) -> Result<()> {
        let mut chains = self.chains.write().await;
        if let Some(state) = chains.get_mut(chain) {
            state.sessions.remove(home_tx_hash);
        }
        Ok(())
    }

    async fn list_sessions(&self, chain: &str) -> Result<Vec<OutboundSigningSession>> {
        let chains = self.chains.read().await;
        Ok(chains
            .get(chain)
            .map(|s| s.sessions.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn get_resend_count(&self, chain: &str, home_tx_hash: &str) -> Result<u32> {
        let chains = self.chains.read().await;
        Ok(chains
            .get(chain)
            .and_then(|s| s.resends.get(home_tx_hash).copied())
            .unwrap_or(0))
    }

    async fn increment_resend_count(&self, chain: &str, home_tx_hash: &str) -> Result<u32> {
        let mut chains = self.chains.write().await;
        let count = chains
            .entry(chain.to_string())
            .or_default()
            .resends
            .entry(home_tx_hash.to_string())
            .or_insert(0);
        *count += 1;
        Ok(*count)
    }

    async fn mark_outbound_completed(
        &self,
        chain: &str,
        home_tx_hash: &str,
        external_tx_hash: &str,
    ) -> Result<()> {
        let mut chains = self.chains.write().await;
        chains
            .entry(chain.to_string())
            .or_default()
            .completed
            .entry(home_tx_hash.to_string())
            .or_insert_with(|| external_tx_hash.to_string());
        Ok(())
    }

    async fn get_completed_outbound(
        &self,
        chain: &str,
        home_tx_hash: &str,
    ) -> Result<Option<String>> {
        let chains = self.chains.read().await;
        Ok(chains
            .get(chain)
            .and_then(|s| s.completed.get(home_tx_hash).cloned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Asset, TxKind};

    fn header(height: u64) -> LocalBlockHeader {
        LocalBlockHeader {
            height,
            hash: format!("h{}", height),
            parent_hash: format!("h{}", height.saturating_sub(1)),
        }
    }

    #[tokio::test]
    async fn test_pending_upsert_and_lookup() {
        let store = MemoryStore::new();
        let mut tx = PendingBridgeTx::new("0x01", TxKind::Withdraw, Asset::Native { decimals: 18 });
        tx.home_tx_hash = Some("ab".into());
        store.save_pending_tx("eth", &tx).await.unwrap();
        tx.error_count = 2;
        store.save_pending_tx("eth", &tx).await.unwrap();

        assert_eq!(store.list_pending_txs("eth").await.unwrap().len(), 1);
        assert_eq!(
            store.get_pending_tx("eth", "0x01").await.unwrap().unwrap().error_count,
            2
        );
        assert_eq!(store.find_pending_by_home_hash("eth", "ab").await.unwrap().len(), 1);
        // Chains are isolated
        assert!(store.get_pending_tx("btc", "0x01").await.unwrap().is_none());

        store.delete_pending_tx("eth", "0x01").await.unwrap();
        assert!(store.list_pending_txs("eth").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_header_ring() {
        let store = MemoryStore::new();
        for h in 1..=5 {
            store.append_header("eth", &header(h)).await.unwrap();
        }
        assert_eq!(store.latest_header("eth").await.unwrap().unwrap().height, 5);
        store.prune_headers("eth", 3).await.unwrap();
        assert_eq!(store.count_headers("eth").await.unwrap(), 3);
        store.delete_header("eth", 5).await.unwrap();
        assert_eq!(store.latest_header("eth").await.unwrap().unwrap().height, 4);
        store.clear_headers("eth").await.unwrap();
        assert!(store.latest_header("eth").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_resend_counter() {
        let store = MemoryStore::new();
        assert_eq!(store.get_resend_count("eth", "ab").await.unwrap(), 0);
        assert_eq!(store.increment_resend_count("eth", "ab").await.unwrap(), 1);
        assert_eq!(store.increment_resend_count("eth", "ab").await.unwrap(), 2);
        assert_eq!(store.get_resend_count("eth", "ab").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_completed_marker_keeps_first_tx() {
        let store = MemoryStore::new();
        assert!(store.get_completed_outbound("btc", "ab").await.unwrap().is_none());
        store.mark_outbound_completed("btc", "ab", "t1").await.unwrap();
        store.mark_outbound_completed("btc", "ab", "t2").await.unwrap();
        assert_eq!(
            store.get_completed_outbound("btc", "ab").await.unwrap().as_deref(),
            Some("t1")
        );
        assert!(store.get_completed_outbound("eth", "ab").await.unwrap().is_none());
    }
}
