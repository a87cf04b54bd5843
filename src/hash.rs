//! Hash computation for custodian multisig actions
//!
//! Digests here must match the custodian contract byte for byte: every
//! custodian derives the same digest independently and signs it, and the
//! contract recomputes it before counting signatures.

use secp256k1::PublicKey;
use tiny_keccak::{Hasher, Keccak};

/// Version byte appended to every packed custodian digest
pub const MULTISIG_VERSION: u8 = 3;

/// Compute keccak256 hash of data
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak::v256();
    hasher.update(data);
    let mut output = [0u8; 32];
    hasher.finalize(&mut output);
    output
}

/// Digest for a withdrawal:
/// keccak256(abi.encodePacked(txKey, to, amount, isContractAsset, erc20, VERSION))
pub fn withdraw_digest(
    tx_key: &str,
    to: &[u8; 20],
    amount: u128,
    is_contract_asset: bool,
    erc20: &[u8; 20],
) -> [u8; 32] {
    let mut data = Vec::with_capacity(tx_key.len() + 20 + 32 + 1 + 20 + 1);
    data.extend_from_slice(tx_key.as_bytes());
    data.extend_from_slice(to);
    data.extend_from_slice(&u256_word(amount));
    data.push(is_contract_asset as u8);
    data.extend_from_slice(erc20);
    data.push(MULTISIG_VERSION);
    keccak256(&data)
}

/// Digest for a custodian change:
/// keccak256(abi.encodePacked(txKey, adds, count, removes, VERSION))
pub fn custodian_change_digest(
    tx_key: &str,
    adds: &[[u8; 20]],
    count: u8,
    removes: &[[u8; 20]],
) -> [u8; 32] {
    let mut data = Vec::with_capacity(tx_key.len() + 20 * (adds.len() + removes.len()) + 2);
    data.extend_from_slice(tx_key.as_bytes());
    for add in adds {
        data.extend_from_slice(add);
    }
    data.push(count);
    for remove in removes {
        data.extend_from_slice(remove);
    }
    data.push(MULTISIG_VERSION);
    keccak256(&data)
}

/// Digest for a contract upgrade:
/// keccak256(abi.encodePacked(txKey, upgradeContract, VERSION))
pub fn upgrade_digest(tx_key: &str, upgrade_contract: &[u8; 20]) -> [u8; 32] {
    let mut data = Vec::with_capacity(tx_key.len() + 21);
    data.extend_from_slice(tx_key.as_bytes());
    data.extend_from_slice(upgrade_contract);
    data.push(MULTISIG_VERSION);
    keccak256(&data)
}

/// uint256 big-endian word for a u128 value
pub fn u256_word(value: u128) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[16..].copy_from_slice(&value.to_be_bytes());
    word
}

/// Ethereum-style address of a secp256k1 key: last 20 bytes of
/// keccak256(uncompressed pubkey without the 0x04 prefix)
pub fn eth_address_from_pubkey(pubkey: &PublicKey) -> [u8; 20] {
    let uncompressed = pubkey.serialize_uncompressed();
    let hash = keccak256(&uncompressed[1..]);
    let mut address = [0u8; 20];
    address.copy_from_slice(&hash[12..]);
    address
}

/// Convert bytes32 to hex string with 0x prefix
pub fn bytes32_to_hex(bytes: &[u8; 32]) -> String {
    format!("0x{}", hex::encode(bytes))
}

/// Parse a 32-byte hash given as hex, with or without 0x prefix
pub fn parse_bytes32(hex_str: &str) -> Option<[u8; 32]> {
    let raw = hex_str.strip_prefix("0x").unwrap_or(hex_str);
    let bytes = hex::decode(raw).ok()?;
    bytes.try_into().ok()
}

/// Canonical form of a transaction hash for map keys and comparisons
pub fn normalize_hash(hash: &str) -> String {
    let raw = hash.strip_prefix("0x").unwrap_or(hash);
    raw.to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use secp256k1::{SecretKey, SECP256K1};
    use std::str::FromStr;

    #[test]
    fn test_keccak256_empty() {
        assert_eq!(
            hex::encode(keccak256(b"")),
            "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        );
    }

    #[test]
    fn test_u256_word_layout() {
        let word = u256_word(1_000_000);
        assert!(word[..16].iter().all(|b| *b == 0));
        assert_eq!(&word[16..], &1_000_000u128.to_be_bytes());
    }

    #[test]
    fn test_withdraw_digest_binds_tx_key() {
        let to = [0x11u8; 20];
        let erc20 = [0u8; 20];
        let a = withdraw_digest("aa", &to, 10, false, &erc20);
        let b = withdraw_digest("ab", &to, 10, false, &erc20);
        assert_ne!(a, b);
        assert_eq!(a, withdraw_digest("aa", &to, 10, false, &erc20));
    }

    #[test]
    fn test_eth_address_of_known_key() {
        // Private key 1 maps to the well-known address 0x7e5f...bdf
        let mut sk_bytes = [0u8; 32];
        sk_bytes[31] = 1;
        let sk = SecretKey::from_slice(&sk_bytes).unwrap();
        let pk = PublicKey::from_secret_key(SECP256K1, &sk);
        assert_eq!(
            hex::encode(eth_address_from_pubkey(&pk)),
            "7e5f4552091a69125d5dfcb7b8c2659029395bdf"
        );
        assert!(PublicKey::from_str(&pk.to_string()).is_ok());
    }

    #[test]
    fn test_parse_and_normalize() {
        let h = format!("0x{}", "AB".repeat(32));
        assert_eq!(parse_bytes32(&h), Some([0xab; 32]));
        assert_eq!(parse_bytes32("0x1234"), None);
        assert_eq!(normalize_hash(&h), "ab".repeat(32));
        assert_eq!(bytes32_to_hex(&[0xab; 32]), h.to_lowercase());
    }
}
