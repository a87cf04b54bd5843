//! Every custodian must derive byte-identical UTXO payloads from the same
//! request and chain state, whatever order the adapter lists outputs in

use bitcoin::{Network, Transaction};
use proptest::prelude::*;
use vbank_bridge::chain::{BuildContext, Unspent, UtxoFamily};
use vbank_bridge::testing::{custodian_keys, custodian_set, secret_key, utxo_multisig_address};
use vbank_bridge::types::{Asset, OutboundParams, OutboundRequest};

fn unspent_strategy() -> impl Strategy<Value = Vec<Unspent>> {
    prop::collection::vec(
        (any::<[u8; 32]>(), 0u32..4, 1_000u64..5_000_000),
        1..12,
    )
    .prop_map(|entries| {
        entries
            .into_iter()
            .map(|(txid, vout, value)| Unspent {
                txid: hex::encode(txid),
                vout,
                value,
            })
            .collect()
    })
}

fn withdraw(amount: u64, fee_rate: u64) -> OutboundRequest {
    let recipient = utxo_multisig_address(&custodian_set(&[secret_key(9)]), Network::Regtest);
    OutboundRequest {
        home_tx_hash: "12".repeat(32),
        params: OutboundParams::Withdraw {
            to: recipient,
            amount: u128::from(amount),
            asset: Asset::Native { decimals: 8 },
        },
        fee_rate: Some(fee_rate),
    }
}

proptest! {
    #[test]
    fn prop_payload_independent_of_listing_order(
        unspent in unspent_strategy(),
        amount in 1_000u64..3_000_000,
        fee_rate in 1u64..50,
        rotate in 0usize..12,
    ) {
        let set = custodian_set(&custodian_keys(4));
        let multisig = utxo_multisig_address(&set, Network::Regtest);
        let first = UtxoFamily::new(&multisig, Network::Regtest).unwrap();
        let second = UtxoFamily::new(&multisig, Network::Regtest).unwrap();

        let mut shuffled = unspent.clone();
        shuffled.reverse();
        let len = shuffled.len();
        shuffled.rotate_left(rotate % len);

        let request = withdraw(amount, fee_rate);
        let a = first.build_payload(&request, &BuildContext {
            custodians: &set,
            unspent: &unspent,
            fee_rate,
        });
        let b = second.build_payload(&request, &BuildContext {
            custodians: &set,
            unspent: &shuffled,
            fee_rate,
        });

        match (a, b) {
            (Ok(a), Ok(b)) => {
                prop_assert_eq!(&a, &b);

                // Inputs cover outputs plus fee exactly
                let tx: Transaction = bitcoin::consensus::deserialize(&a.unsigned_tx).unwrap();
                let spent: u64 = a.inputs.iter().map(|u| u.value).sum();
                let paid: u64 = tx.output.iter().map(|o| o.value.to_sat()).sum();
                prop_assert_eq!(spent, paid + a.fee);
                prop_assert_eq!(tx.input.len(), a.inputs.len());
            }
            (Err(a), Err(b)) => prop_assert_eq!(a.to_string(), b.to_string()),
            (a, b) => prop_assert!(false, "diverging results: {:?} vs {:?}", a, b),
        }
    }
}
