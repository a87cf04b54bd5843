//! Home-ledger address encoding
//!
//! ## Address Format
//!
//! ```text
//! <prefix> base58( chain id (2, BE) | address type (1) | hash160 (20) | xor checksum (1) )
//! ```
//!
//! The checksum byte is the XOR of the 23 bytes before it. Deposit memos must
//! decode to an address of the configured home chain.

use thiserror::Error;

pub const DEFAULT_PREFIX: &str = "NERVE";

const BODY_LEN: usize = 24;

/// Standard account address type
pub const ADDRESS_TYPE_DEFAULT: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("missing prefix {0}")]
    Prefix(String),
    #[error("invalid base58: {0}")]
    Base58(String),
    #[error("invalid body length {0}")]
    Length(usize),
    #[error("checksum mismatch")]
    Checksum,
    #[error("address belongs to chain {found}, expected {expected}")]
    Chain { expected: u16, found: u16 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HomeAddress {
    pub chain_id: u16,
    pub address_type: u8,
    pub hash160: [u8; 20],
}

#[derive(Debug, Clone)]
pub struct HomeAddressCodec {
    prefix: String,
    chain_id: u16,
}

impl HomeAddressCodec {
    pub fn new(prefix: impl Into<String>, chain_id: u16) -> Self {
        Self {
            prefix: prefix.into(),
            chain_id,
        }
    }

    pub fn chain_id(&self) -> u16 {
        self.chain_id
    }

    pub fn encode(&self, address_type: u8, hash160: &[u8; 20]) -> String {
        let mut body = Vec::with_capacity(BODY_LEN);
        body.extend_from_slice(&self.chain_id.to_be_bytes());
        body.push(address_type);
        body.extend_from_slice(hash160);
        body.push(xor_checksum(&body));
        format!("{}{}", self.prefix, bs58::encode(body).into_string())
    }

    pub fn decode(&self, address: &str) -> Result<HomeAddress, AddressError> {
        let encoded = address
            .trim()
            .strip_prefix(&self.prefix)
            .ok_or_else(|| AddressError::Prefix(self.prefix.clone()))?;
        let body = bs58::decode(encoded)
            .into_vec()
            .map_err(|e| AddressError::Base58(e.to_string()))?;
        if body.len() != BODY_LEN {
            return Err(AddressError::Length(body.len()));
        }
        if xor_checksum(&body[..BODY_LEN - 1]) != body[BODY_LEN - 1] {
            return Err(AddressError::Checksum);
        }
        let chain_id = u16::from_be_bytes([body[0], body[1]]);
        if chain_id != self.chain_id {
            return Err(AddressError::Chain {
                expected: self.chain_id,
                found: chain_id,
            });
        }
        let mut hash160 = [0u8; 20];
        hash160.copy_from_slice(&body[3..23]);
        Ok(HomeAddress {
            chain_id,
            address_type: body[2],
            hash160,
        })
    }

    pub fn is_valid(&self, address: &str) -> bool {
        self.decode(address).is_ok()
    }
}

fn xor_checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc ^ b)
}
