//! Block scanner tests against the in-process mock chain

use vbank_bridge::chain::{AccountTx, ChainTx};
use vbank_bridge::testing::{home_address, secret_key, tx_hash, NodeBuilder, TestNode, ACCOUNT_MULTISIG};
use vbank_bridge::types::TxKind;
use vbank_bridge::watchers::{BlockScanner, ScanOutcome};

fn node() -> TestNode {
    NodeBuilder::account(secret_key(1)).build().unwrap()
}

fn deposit(seed: &str, memo: &str, value: u128) -> ChainTx {
    ChainTx::Account(AccountTx {
        hash: tx_hash(seed),
        from: "0x00000000000000000000000000000000000000b1".to_string(),
        to: Some(ACCOUNT_MULTISIG.to_string()),
        value,
        input: memo.as_bytes().to_vec(),
    })
}

#[tokio::test]
async fn test_seeds_at_remote_tip() {
    let node = node();
    node.chain.advance(5);
    let scanner = BlockScanner::new(node.runtime.ctx.clone());

    assert_eq!(scanner.tick().await.unwrap(), ScanOutcome::Seeded { height: 5 });
    assert_eq!(scanner.tick().await.unwrap(), ScanOutcome::UpToDate);

    node.chain.advance(2);
    assert_eq!(
        scanner.tick().await.unwrap(),
        ScanOutcome::Advanced { height: 7, blocks: 2 }
    );
    assert_eq!(node.runtime.ctx.status.last_scanned(), 7);
}

#[tokio::test]
async fn test_deposit_recorded_and_queued() {
    let node = node();
    node.runtime.recover().await.unwrap();
    let scanner = BlockScanner::new(node.runtime.ctx.clone());
    scanner.tick().await.unwrap();

    node.chain.push_block(vec![deposit("d1", &home_address(7), 1_000)]);
    scanner.tick().await.unwrap();

    let hash = tx_hash("d1");
    let record = node
        .runtime
        .ctx
        .store
        .get_pending_tx("test", &hash)
        .await
        .unwrap()
        .expect("deposit recorded");
    assert_eq!(record.kind, TxKind::Deposit);
    assert_eq!(record.amount, 1_000);
    assert_eq!(record.block_height, Some(1));
    assert_eq!(record.memo_address.as_deref(), Some(home_address(7).as_str()));
    assert!(node.runtime.ctx.queue.contains(&hash).await);

    // Unconfirmed notice is sent once, on first sight
    assert_eq!(node.home.pending_deposits().len(), 1);
}

#[tokio::test]
async fn test_invalid_memo_never_queued() {
    let node = node();
    node.runtime.recover().await.unwrap();
    let scanner = BlockScanner::new(node.runtime.ctx.clone());
    scanner.tick().await.unwrap();

    node.chain.push_block(vec![
        deposit("bad-memo", "not-a-home-address", 10),
        deposit("no-memo", "", 10),
    ]);
    scanner.tick().await.unwrap();

    assert!(node.runtime.ctx.queue.is_empty().await);
    assert!(node
        .runtime
        .ctx
        .store
        .list_pending_txs("test")
        .await
        .unwrap()
        .is_empty());
    assert!(node.home.pending_deposits().is_empty());
}

#[tokio::test]
async fn test_fork_drops_tip_and_rederives() {
    let node = node();
    let scanner = BlockScanner::new(node.runtime.ctx.clone());
    scanner.tick().await.unwrap();

    node.chain.push_block(Vec::new());
    node.chain.push_block(vec![deposit("d1", &home_address(7), 500)]);
    node.chain.push_block(Vec::new());
    assert_eq!(
        scanner.tick().await.unwrap(),
        ScanOutcome::Advanced { height: 3, blocks: 3 }
    );

    // Blocks 2 and 3 are replaced; the deposit lands in the new block 3
    node.chain.reorg_from(2);
    node.chain.push_block(Vec::new());
    node.chain.push_block(vec![deposit("d1", &home_address(7), 500)]);
    node.chain.push_block(Vec::new());

    let store = &node.runtime.ctx.store;
    assert_eq!(scanner.tick().await.unwrap(), ScanOutcome::Forked { height: 3 });
    assert!(store.get_header("test", 3).await.unwrap().is_none());
    assert!(store.get_header("test", 2).await.unwrap().is_some());

    assert_eq!(scanner.tick().await.unwrap(), ScanOutcome::Forked { height: 2 });
    assert_eq!(store.latest_header("test").await.unwrap().unwrap().height, 1);

    assert_eq!(
        scanner.tick().await.unwrap(),
        ScanOutcome::Advanced { height: 4, blocks: 3 }
    );
    for height in 2..=4 {
        let local = store.get_header("test", height).await.unwrap().unwrap();
        assert_eq!(local.hash, node.chain.header(height).unwrap().hash);
    }

    let record = store.get_pending_tx("test", &tx_hash("d1")).await.unwrap().unwrap();
    assert_eq!(record.block_height, Some(3));
    assert_eq!(record.block_hash, node.chain.header(3).map(|h| h.hash));
    assert!(!record.validated);
    // Re-scanning the moved deposit does not announce it twice
    assert_eq!(node.home.pending_deposits().len(), 1);
}

#[tokio::test]
async fn test_header_retention_window() {
    let node = NodeBuilder::account(secret_key(1))
        .settings(|s| s.header_retention = 4)
        .build()
        .unwrap();
    let scanner = BlockScanner::new(node.runtime.ctx.clone());
    scanner.tick().await.unwrap();
    node.chain.advance(10);
    scanner.tick().await.unwrap();

    let store = &node.runtime.ctx.store;
    assert_eq!(store.count_headers("test").await.unwrap(), 4);
    assert_eq!(store.latest_header("test").await.unwrap().unwrap().height, 10);
    assert!(store.get_header("test", 6).await.unwrap().is_none());
}

#[tokio::test]
async fn test_reseeds_when_too_far_behind() {
    let node = NodeBuilder::account(secret_key(1))
        .settings(|s| s.max_catchup_gap = 5)
        .build()
        .unwrap();
    let first = BlockScanner::new(node.runtime.ctx.clone());
    first.tick().await.unwrap();

    // Restarted scanner finds the chain far ahead of local history
    node.chain.advance(20);
    let restarted = BlockScanner::new(node.runtime.ctx.clone());
    assert_eq!(
        restarted.tick().await.unwrap(),
        ScanOutcome::Reseeded { height: 20 }
    );
    assert_eq!(node.runtime.ctx.store.count_headers("test").await.unwrap(), 1);
}

#[tokio::test]
async fn test_non_custodian_purges_headers_and_idles() {
    let node = node();
    let scanner = BlockScanner::new(node.runtime.ctx.clone());
    scanner.tick().await.unwrap();
    node.chain.advance(3);
    scanner.tick().await.unwrap();

    node.home
        .set_custodians(vbank_bridge::testing::custodian_set(&[secret_key(2), secret_key(3)]));
    assert_eq!(scanner.tick().await.unwrap(), ScanOutcome::NotCustodian);
    assert_eq!(node.runtime.ctx.store.count_headers("test").await.unwrap(), 0);
    assert!(!node.runtime.ctx.status.is_custodian());
}

#[tokio::test]
async fn test_transient_rpc_failure_keeps_state() {
    let node = node();
    let scanner = BlockScanner::new(node.runtime.ctx.clone());
    scanner.tick().await.unwrap();
    node.chain.advance(2);

    node.chain.set_fail_rpc(true);
    assert!(scanner.tick().await.is_err());
    assert_eq!(
        node.runtime.ctx.store.latest_header("test").await.unwrap().unwrap().height,
        0
    );

    node.chain.set_fail_rpc(false);
    assert_eq!(
        scanner.tick().await.unwrap(),
        ScanOutcome::Advanced { height: 2, blocks: 2 }
    );
}
