//! Classification rules for account and UTXO transactions

use alloy::primitives::{Address as EvmAddress, U256};
use alloy::sol_types::SolCall;
use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash;
use bitcoin::script::PushBytesBuf;
use bitcoin::transaction::Version;
use bitcoin::{Address, Amount, Network, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness};
use vbank_bridge::chain::account::cross_out_log;
use vbank_bridge::chain::utxo::multisig_script;
use vbank_bridge::chain::{AccountTx, ChainTx, UtxoTx};
use vbank_bridge::contracts::{IVirtualBank, IERC20};
use vbank_bridge::testing::{
    custodian_set, home_address, secret_key, tx_hash, utxo_multisig_address, NodeBuilder, TestNode,
    ACCOUNT_MULTISIG,
};
use vbank_bridge::types::{Asset, RegisteredToken, TxKind, TxStatus};
use vbank_bridge::watchers::{Classification, Classifier};

const TOKEN_A: &str = "0x00000000000000000000000000000000000000a1";
const TOKEN_B: &str = "0x00000000000000000000000000000000000000a2";
const SENDER: &str = "0x00000000000000000000000000000000000000b1";

fn token(contract: &str, home_asset: Option<&str>) -> RegisteredToken {
    RegisteredToken {
        contract: contract.to_string(),
        decimals: 6,
        home_asset: home_asset.map(str::to_string),
    }
}

fn account_node() -> TestNode {
    NodeBuilder::account(secret_key(1))
        .tokens(vec![token(TOKEN_A, Some("usdx")), token(TOKEN_B, Some("usdx"))])
        .build()
        .unwrap()
}

/// Mine `tx` and classify it
async fn classify(node: &TestNode, tx: ChainTx) -> Classification {
    let header = node.chain.push_block(vec![tx.clone()]);
    Classifier::new(&node.runtime.ctx)
        .classify(&header, &tx)
        .await
        .unwrap()
}

fn call(seed: &str, to: &str, value: u128, input: Vec<u8>) -> ChainTx {
    ChainTx::Account(AccountTx {
        hash: tx_hash(seed),
        from: SENDER.to_string(),
        to: Some(to.to_string()),
        value,
        input,
    })
}

fn cross_out(memo: &str, amount: u128, erc20: &str) -> Vec<u8> {
    IVirtualBank::crossOutCall {
        to: memo.to_string(),
        amount: U256::from(amount),
        erc20: erc20.parse::<EvmAddress>().unwrap(),
    }
    .abi_encode()
}

fn is_rejected(classification: &Classification) -> bool {
    matches!(classification, Classification::Rejected(_))
}

#[tokio::test]
async fn test_native_deposit_with_memo() {
    let node = account_node();
    let memo = home_address(3);
    let result = classify(&node, call("native", ACCOUNT_MULTISIG, 77, memo.clone().into_bytes())).await;

    let Classification::Event(record) = result else {
        panic!("expected deposit, got {:?}", result);
    };
    assert_eq!(record.kind, TxKind::Deposit);
    assert_eq!(record.amount, 77);
    assert_eq!(record.asset, Asset::Native { decimals: 18 });
    assert_eq!(record.memo_address, Some(memo));
    assert_eq!(record.from, SENDER);
    assert_eq!(record.block_height, Some(1));
}

#[tokio::test]
async fn test_fee_memo_records_fee() {
    let node = account_node();
    let memo = format!("fee:{}", "cd".repeat(32));
    let result = classify(&node, call("fee", ACCOUNT_MULTISIG, 5, memo.into_bytes())).await;

    let Classification::Event(record) = result else {
        panic!("expected fee record, got {:?}", result);
    };
    assert_eq!(record.kind, TxKind::FeeRecord);
    assert_eq!(record.home_tx_hash, Some("cd".repeat(32)));

    let malformed = classify(&node, call("bad-fee", ACCOUNT_MULTISIG, 5, b"fee:xyz".to_vec())).await;
    assert!(is_rejected(&malformed));
}

#[tokio::test]
async fn test_unrelated_and_reverted_txs_ignored() {
    let node = account_node();
    let other = "0x00000000000000000000000000000000000000ff";
    let result = classify(&node, call("other", other, 10, home_address(1).into_bytes())).await;
    assert_eq!(result, Classification::Irrelevant);

    let tx = call("reverted", ACCOUNT_MULTISIG, 10, home_address(1).into_bytes());
    node.chain.set_reverted(&tx.hash());
    assert_eq!(classify(&node, tx).await, Classification::Irrelevant);
}

#[tokio::test]
async fn test_cross_out_bound_token_credited() {
    let node = account_node();
    let memo = home_address(5);
    let tx = call("cross-a", ACCOUNT_MULTISIG, 0, cross_out(&memo, 500, TOKEN_A));
    node.chain.add_logs(
        &tx.hash(),
        vec![cross_out_log(ACCOUNT_MULTISIG, SENDER, &memo, 500, Some(TOKEN_A)).unwrap()],
    );

    let Classification::Event(record) = classify(&node, tx).await else {
        panic!("expected token deposit");
    };
    assert_eq!(record.kind, TxKind::Deposit);
    assert_eq!(record.amount, 500);
    assert_eq!(
        record.asset,
        Asset::Token {
            contract: TOKEN_A.to_string(),
            decimals: 6
        }
    );
}

#[tokio::test]
async fn test_cross_out_rejections() {
    let node = account_node();
    let memo = home_address(5);

    // TOKEN_B claims the home asset already bound to TOKEN_A
    let tx = call("cross-b", ACCOUNT_MULTISIG, 0, cross_out(&memo, 500, TOKEN_B));
    node.chain.add_logs(
        &tx.hash(),
        vec![cross_out_log(ACCOUNT_MULTISIG, SENDER, &memo, 500, Some(TOKEN_B)).unwrap()],
    );
    assert!(is_rejected(&classify(&node, tx).await));

    let unregistered = "0x00000000000000000000000000000000000000a9";
    let tx = call("cross-x", ACCOUNT_MULTISIG, 0, cross_out(&memo, 500, unregistered));
    node.chain.add_logs(
        &tx.hash(),
        vec![cross_out_log(ACCOUNT_MULTISIG, SENDER, &memo, 500, Some(unregistered)).unwrap()],
    );
    assert!(is_rejected(&classify(&node, tx).await));

    // Call data alone proves nothing without the contract's event
    let tx = call("cross-no-log", ACCOUNT_MULTISIG, 0, cross_out(&memo, 500, TOKEN_A));
    assert!(is_rejected(&classify(&node, tx).await));
}

#[tokio::test]
async fn test_plain_token_transfer_needs_memo() {
    let node = account_node();
    let input = IERC20::transferCall {
        to: ACCOUNT_MULTISIG.parse::<EvmAddress>().unwrap(),
        amount: U256::from(900u64),
    }
    .abi_encode();
    let result = classify(&node, call("transfer", TOKEN_A, 0, input)).await;
    assert!(is_rejected(&result));
}

// ============================================================================
// UTXO
// ============================================================================

struct UtxoFixture {
    node: TestNode,
    custodian_script: ScriptBuf,
}

fn utxo_fixture() -> UtxoFixture {
    let key = secret_key(1);
    let set = custodian_set(&[key]);
    let multisig = utxo_multisig_address(&set, Network::Regtest);
    let custodian_script = Address::p2wsh(&multisig_script(&set).unwrap(), Network::Regtest).script_pubkey();
    UtxoFixture {
        node: NodeBuilder::utxo(key, multisig).build().unwrap(),
        custodian_script,
    }
}

fn foreign_script(seed: u8) -> ScriptBuf {
    let mut bytes = vec![0x00, 0x14];
    bytes.extend_from_slice(&[seed; 20]);
    ScriptBuf::from_bytes(bytes)
}

fn op_return(data: Vec<u8>) -> TxOut {
    TxOut {
        value: Amount::ZERO,
        script_pubkey: ScriptBuf::new_op_return(PushBytesBuf::try_from(data).unwrap()),
    }
}

fn utxo_tx(prevouts: Vec<TxOut>, output: Vec<TxOut>) -> ChainTx {
    let input = (0..prevouts.len())
        .map(|i| TxIn {
            previous_output: OutPoint::new(Txid::from_byte_array([i as u8 + 1; 32]), 0),
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        })
        .collect();
    ChainTx::Utxo(UtxoTx {
        tx: Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input,
            output,
        },
        prevouts: prevouts.into_iter().map(Some).collect(),
    })
}

fn out(value: u64, script: &ScriptBuf) -> TxOut {
    TxOut {
        value: Amount::from_sat(value),
        script_pubkey: script.clone(),
    }
}

#[tokio::test]
async fn test_utxo_deposit_with_op_return_memo() {
    let fx = utxo_fixture();
    let memo = home_address(8);
    let tx = utxo_tx(
        vec![out(80_000, &foreign_script(7))],
        vec![
            out(50_000, &fx.custodian_script),
            op_return(memo.clone().into_bytes()),
            out(29_000, &foreign_script(7)),
        ],
    );

    let Classification::Event(record) = classify(&fx.node, tx).await else {
        panic!("expected deposit");
    };
    assert_eq!(record.kind, TxKind::Deposit);
    assert_eq!(record.amount, 50_000);
    assert_eq!(record.asset, Asset::Native { decimals: 8 });
    assert_eq!(record.memo_address, Some(memo));
}

#[tokio::test]
async fn test_utxo_ambiguous_spends_rejected() {
    let fx = utxo_fixture();

    let mixed = utxo_tx(
        vec![out(10_000, &fx.custodian_script), out(10_000, &foreign_script(7))],
        vec![out(19_000, &foreign_script(9))],
    );
    assert!(is_rejected(&classify(&fx.node, mixed).await));

    let unbound = utxo_tx(
        vec![out(10_000, &fx.custodian_script)],
        vec![out(9_000, &foreign_script(9))],
    );
    assert!(is_rejected(&classify(&fx.node, unbound).await));

    let no_memo = utxo_tx(
        vec![out(10_000, &foreign_script(7))],
        vec![out(9_000, &fx.custodian_script)],
    );
    assert!(is_rejected(&classify(&fx.node, no_memo).await));
}

#[tokio::test]
async fn test_utxo_bound_custodian_spend_is_outbound() {
    let fx = utxo_fixture();
    let mut binding = vec![TxKind::Withdraw.tag()];
    binding.extend_from_slice(&[0xee; 32]);
    let tx = utxo_tx(
        vec![out(100_000, &fx.custodian_script)],
        vec![
            out(60_000, &foreign_script(9)),
            op_return(binding),
            out(39_000, &fx.custodian_script),
        ],
    );

    let Classification::Event(record) = classify(&fx.node, tx).await else {
        panic!("expected outbound event");
    };
    assert_eq!(record.kind, TxKind::Withdraw);
    assert_eq!(record.status, TxStatus::Completed);
    assert_eq!(record.home_tx_hash, Some("ee".repeat(32)));
    assert_eq!(record.amount, 60_000);
}
