//! Signing coordinator tests: quorum, verification, resend and restart

use std::str::FromStr;
use std::sync::Arc;

use bitcoin::{Address, Amount, Network, OutPoint, TxOut, Txid};
use secp256k1::SecretKey;
use vbank_bridge::chain::account::completion_log;
use vbank_bridge::chain::utxo::multisig_script;
use vbank_bridge::chain::{AccountFamily, ChainFamily, SignedTx, Unspent};
use vbank_bridge::confirmation::ConfirmationTask;
use vbank_bridge::db::BridgeStore;
use vbank_bridge::error::BridgeError;
use vbank_bridge::testing::{
    custodian_keys, custodian_set, pubkey_hex, secret_key, utxo_multisig_address, MockHomeLedger,
    NodeBuilder, TestNode, ACCOUNT_MULTISIG,
};
use vbank_bridge::types::{
    normalize_pubkey, Asset, CustodianSignature, OutboundParams, OutboundRequest, TxKind, TxStatus,
};
use vbank_bridge::watchers::BlockScanner;
use vbank_bridge::writers::{OutboundSigningSession, SignatureCheck};

const NOW: i64 = 1_000;

fn home_hash() -> String {
    "ab".repeat(32)
}

fn withdraw_request() -> OutboundRequest {
    OutboundRequest {
        home_tx_hash: home_hash(),
        params: OutboundParams::Withdraw {
            to: "0x00000000000000000000000000000000000000c3".to_string(),
            amount: 1_000_000,
            asset: Asset::Native { decimals: 18 },
        },
        fee_rate: None,
    }
}

fn family() -> ChainFamily {
    ChainFamily::Account(AccountFamily::new(ACCOUNT_MULTISIG).unwrap())
}

fn sign(session: &OutboundSigningSession, key: &SecretKey) -> CustodianSignature {
    family().sign_one(&session.payload, key).unwrap()
}

/// Home ledger run by `keys` that issued the withdrawal under test
fn home_ledger(keys: &[SecretKey]) -> Arc<MockHomeLedger> {
    let home = Arc::new(MockHomeLedger::new(custodian_set(keys)));
    home.add_home_tx(&home_hash(), TxKind::Withdraw);
    home
}

/// Node holding keys[0] of a five-custodian set
fn five_custodian_node(keys: &[SecretKey]) -> TestNode {
    let home = home_ledger(keys);
    NodeBuilder::account(keys[0])
        .home(home)
        .tuning(|t| t.send_order_slot_secs = 0)
        .build()
        .unwrap()
}

fn completion_logs(signed: &SignedTx) -> Vec<vbank_bridge::chain::TxLog> {
    match signed {
        SignedTx::Account { to, tx_key, .. } => completion_log(to, TxKind::Withdraw, tx_key)
            .into_iter()
            .collect(),
        SignedTx::Utxo { .. } => Vec::new(),
    }
}

#[tokio::test]
async fn test_broadcast_only_at_quorum() {
    let keys = custodian_keys(5);
    let node = five_custodian_node(&keys);
    let coordinator = &node.runtime.coordinator;

    let session = coordinator.submit_at(withdraw_request(), NOW).await.unwrap();
    assert_eq!(session.signatures.len(), 1);
    assert_eq!(session.custodians.m(), 4);

    for key in &keys[1..3] {
        let check = coordinator
            .add_signature_at(&home_hash(), sign(&session, key), NOW)
            .await
            .unwrap();
        assert_eq!(check, SignatureCheck::Added);
    }
    assert!(node.chain.broadcasts().is_empty());

    // Re-offering a counted signature changes nothing
    let check = coordinator
        .add_signature_at(&home_hash(), sign(&session, &keys[1]), NOW)
        .await
        .unwrap();
    assert_eq!(check, SignatureCheck::Duplicate);

    coordinator
        .add_signature_at(&home_hash(), sign(&session, &keys[3]), NOW)
        .await
        .unwrap();
    let broadcasts = node.chain.broadcasts();
    assert_eq!(broadcasts.len(), 1);

    let stored = coordinator.session(&home_hash()).await.unwrap().unwrap();
    let tx_hash = stored.broadcast_tx_hash.clone().unwrap();
    let record = node.store.get_pending_tx("test", &tx_hash).await.unwrap().unwrap();
    assert_eq!(record.kind, TxKind::Withdraw);
    assert_eq!(record.status, TxStatus::Doing);
    assert_eq!(record.home_tx_hash.as_deref(), Some(home_hash().as_str()));
    assert_eq!(record.signers.len(), 4);
    assert!(node.runtime.ctx.is_watched(&tx_hash).await);

    // Late signatures after broadcast are not counted
    let check = coordinator
        .add_signature_at(&home_hash(), sign(&session, &keys[4]), NOW)
        .await
        .unwrap();
    assert_eq!(check, SignatureCheck::Closed);
    assert_eq!(node.chain.broadcasts().len(), 1);
}

#[tokio::test]
async fn test_unverified_signatures_never_count() {
    let keys = custodian_keys(5);
    let node = five_custodian_node(&keys);
    let coordinator = &node.runtime.coordinator;
    let session = coordinator.submit_at(withdraw_request(), NOW).await.unwrap();

    // Valid signature presented under another custodian's key
    let mut forged = sign(&session, &keys[1]);
    forged.pubkey = pubkey_hex(&keys[2]);
    assert_eq!(
        coordinator.add_signature_at(&home_hash(), forged, NOW).await.unwrap(),
        SignatureCheck::Invalid
    );

    let outsider = sign(&session, &secret_key(9));
    assert_eq!(
        coordinator.add_signature_at(&home_hash(), outsider, NOW).await.unwrap(),
        SignatureCheck::NotCustodian
    );

    let stored = coordinator.session(&home_hash()).await.unwrap().unwrap();
    assert_eq!(stored.signatures.len(), 1);
}

#[tokio::test]
async fn test_withdraw_confirmed_end_to_end() {
    let keys = custodian_keys(5);
    let node = five_custodian_node(&keys);
    node.runtime.recover().await.unwrap();
    let scanner = BlockScanner::new(node.runtime.ctx.clone());
    scanner.tick().await.unwrap();

    let coordinator = &node.runtime.coordinator;
    let session = coordinator.submit_at(withdraw_request(), NOW).await.unwrap();
    for key in &keys[1..4] {
        coordinator
            .add_signature_at(&home_hash(), sign(&session, key), NOW)
            .await
            .unwrap();
    }
    assert_eq!(node.chain.broadcasts().len(), 1);

    node.chain.mine_broadcasts(completion_logs);
    node.chain.advance(2);
    scanner.tick().await.unwrap();

    let task = ConfirmationTask::new(node.runtime.ctx.clone(), coordinator.clone());
    task.tick().await.unwrap();

    let confirmed = node.home.outbound();
    assert_eq!(confirmed.len(), 1);
    assert_eq!(confirmed[0].kind, TxKind::Withdraw);
    assert_eq!(confirmed[0].home_tx_hash, home_hash());
    assert_eq!(confirmed[0].signers.len(), 4);
    assert_eq!(confirmed[0].custodian_address, ACCOUNT_MULTISIG);
    assert!(coordinator.session(&home_hash()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_resend_exhaustion_abandons_session() {
    let keys = custodian_keys(5);
    let home = home_ledger(&keys);
    let node = NodeBuilder::account(keys[0])
        .home(home)
        .tuning(|t| {
            t.send_order_slot_secs = 0;
            t.max_waiting_window_secs = 10;
            t.max_resend = 1;
        })
        .build()
        .unwrap();
    let coordinator = &node.runtime.coordinator;
    coordinator.submit_at(withdraw_request(), 0).await.unwrap();

    // First expiry: one resend allowed, windows move forward
    coordinator.tick_at(11).await.unwrap();
    let session = coordinator.session(&home_hash()).await.unwrap().unwrap();
    assert_eq!(session.max_waiting_end_time, 21);
    assert_eq!(session.signatures.len(), 1);

    coordinator.tick_at(22).await.unwrap();
    assert!(coordinator.session(&home_hash()).await.unwrap().is_none());
    assert_eq!(node.store.get_resend_count("test", &home_hash()).await.unwrap(), 2);
    assert!(node.chain.broadcasts().is_empty());
}

#[tokio::test]
async fn test_restart_does_not_broadcast_twice() {
    let keys = custodian_keys(5);
    let node = five_custodian_node(&keys);
    let session = node
        .runtime
        .coordinator
        .submit_at(withdraw_request(), NOW)
        .await
        .unwrap();

    // Other custodians published through the home ledger
    for key in &keys[1..4] {
        node.home.add_quorum_signature(&home_hash(), sign(&session, key));
    }
    node.runtime.coordinator.tick_at(NOW).await.unwrap();
    assert_eq!(node.chain.broadcasts().len(), 1);

    let restarted = NodeBuilder::account(keys[0])
        .chain(node.chain.clone())
        .home(node.home.clone())
        .store(node.store.clone())
        .tuning(|t| t.send_order_slot_secs = 0)
        .build()
        .unwrap();
    let stats = restarted.runtime.recover().await.unwrap();
    assert_eq!(stats.watched, 1);

    let resumed = restarted
        .runtime
        .coordinator
        .submit_at(withdraw_request(), NOW + 5)
        .await
        .unwrap();
    assert_eq!(resumed, node.runtime.coordinator.session(&home_hash()).await.unwrap().unwrap());
    restarted.runtime.coordinator.tick_at(NOW + 5).await.unwrap();
    assert_eq!(node.chain.broadcasts().len(), 1);
}

#[tokio::test]
async fn test_unissued_home_tx_is_never_signed() {
    let keys = custodian_keys(5);
    let node = NodeBuilder::account(keys[0])
        .home(Arc::new(MockHomeLedger::new(custodian_set(&keys))))
        .tuning(|t| t.send_order_slot_secs = 0)
        .build()
        .unwrap();
    let coordinator = &node.runtime.coordinator;

    let err = coordinator.submit_at(withdraw_request(), NOW).await.unwrap_err();
    assert!(matches!(err, BridgeError::Validation(_)));
    assert!(coordinator.session(&home_hash()).await.unwrap().is_none());

    // Issued, but as a different action
    node.home.add_home_tx(&home_hash(), TxKind::Upgrade);
    let err = coordinator.submit_at(withdraw_request(), NOW).await.unwrap_err();
    assert!(matches!(err, BridgeError::Validation(_)));
    assert!(node.chain.broadcasts().is_empty());
}

#[tokio::test]
async fn test_unverifiable_signature_dropped_at_broadcast() {
    let keys = custodian_keys(5);
    let node = five_custodian_node(&keys);
    let coordinator = &node.runtime.coordinator;
    let session = coordinator.submit_at(withdraw_request(), NOW).await.unwrap();
    for key in &keys[1..3] {
        coordinator
            .add_signature_at(&home_hash(), sign(&session, key), NOW)
            .await
            .unwrap();
    }

    // A checkpoint carrying keys[3]'s slot with keys[4]'s signature
    let bogus_key = normalize_pubkey(&pubkey_hex(&keys[3]));
    let bogus = CustodianSignature {
        pubkey: bogus_key.clone(),
        parts: sign(&session, &keys[4]).parts,
    };
    let mut tampered = coordinator.session(&home_hash()).await.unwrap().unwrap();
    tampered.signatures.insert(bogus_key.clone(), bogus.clone());
    node.store.save_session("test", &tampered).await.unwrap();

    // Nothing to refresh from: no broadcast, the bad signature is gone
    coordinator.tick_at(NOW).await.unwrap();
    assert!(node.chain.broadcasts().is_empty());
    let stored = coordinator.session(&home_hash()).await.unwrap().unwrap();
    assert_eq!(stored.signatures.len(), 3);
    assert!(!stored.signatures.contains_key(&bogus_key));

    // The home ledger now holds the real one; the refresh at broadcast finds it
    tampered.signatures.insert(bogus_key.clone(), bogus);
    node.store.save_session("test", &tampered).await.unwrap();
    node.home.add_quorum_signature(&home_hash(), sign(&session, &keys[3]));
    coordinator.tick_at(NOW).await.unwrap();

    assert_eq!(node.chain.broadcasts().len(), 1);
    let stored = coordinator.session(&home_hash()).await.unwrap().unwrap();
    let tx_hash = stored.broadcast_tx_hash.unwrap();
    let record = node.store.get_pending_tx("test", &tx_hash).await.unwrap().unwrap();
    assert_eq!(record.signers.len(), 4);
    assert!(record.signers.contains(&bogus_key));
}

#[tokio::test]
async fn test_utxo_withdraw_end_to_end_and_never_repeated() {
    let keys = custodian_keys(4);
    let set = custodian_set(&keys);
    let multisig = utxo_multisig_address(&set, Network::Regtest);
    let node = NodeBuilder::utxo(keys[0], multisig)
        .home(home_ledger(&keys))
        .tuning(|t| t.send_order_slot_secs = 0)
        .build()
        .unwrap();

    let custodian_spk = Address::p2wsh(&multisig_script(&set).unwrap(), Network::Regtest).script_pubkey();
    let funding = Unspent {
        txid: "11".repeat(32),
        vout: 0,
        value: 200_000,
    };
    node.chain.add_output(
        OutPoint::new(Txid::from_str(&funding.txid).unwrap(), 0),
        TxOut {
            value: Amount::from_sat(funding.value),
            script_pubkey: custodian_spk,
        },
    );
    node.chain.set_unspent(vec![funding]);

    let request = OutboundRequest {
        home_tx_hash: home_hash(),
        params: OutboundParams::Withdraw {
            to: utxo_multisig_address(&custodian_set(&[secret_key(9)]), Network::Regtest),
            amount: 40_000,
            asset: Asset::Native { decimals: 8 },
        },
        fee_rate: Some(2),
    };

    node.runtime.recover().await.unwrap();
    let scanner = BlockScanner::new(node.runtime.ctx.clone());
    scanner.tick().await.unwrap();

    let coordinator = &node.runtime.coordinator;
    let session = coordinator.submit_at(request.clone(), NOW).await.unwrap();
    assert_eq!(session.custodians.m(), 3);
    let family = &node.runtime.ctx.family;
    for key in &keys[1..3] {
        let signature = family.sign_one(&session.payload, key).unwrap();
        coordinator
            .add_signature_at(&home_hash(), signature, NOW)
            .await
            .unwrap();
    }

    let broadcasts = node.chain.broadcasts();
    assert_eq!(broadcasts.len(), 1);
    let SignedTx::Utxo { txid, .. } = &broadcasts[0] else {
        panic!("expected a utxo transaction");
    };

    node.chain.mine_broadcasts(|_| Vec::new());
    node.chain.advance(2);
    scanner.tick().await.unwrap();
    let task = ConfirmationTask::new(node.runtime.ctx.clone(), coordinator.clone());
    task.tick().await.unwrap();

    let confirmed = node.home.outbound();
    assert_eq!(confirmed.len(), 1);
    assert_eq!(&confirmed[0].external_tx_hash, txid);
    assert_eq!(confirmed[0].signers.len(), 3);
    assert_eq!(
        node.store.get_completed_outbound("test", &home_hash()).await.unwrap().as_ref(),
        Some(txid)
    );

    // Fresh funds and a purged record must not lead to a second spend
    node.chain.set_unspent(vec![Unspent {
        txid: "22".repeat(32),
        vout: 1,
        value: 500_000,
    }]);
    node.home.set_tip(1_000);
    task.tick().await.unwrap();
    assert!(node.store.get_pending_tx("test", txid).await.unwrap().is_none());

    let err = coordinator.submit_at(request, NOW + 60).await.unwrap_err();
    assert!(matches!(err, BridgeError::Validation(_)));
    assert!(coordinator.session(&home_hash()).await.unwrap().is_none());
    assert_eq!(node.chain.broadcasts().len(), 1);
}
