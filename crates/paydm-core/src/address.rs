//! Deterministic receiving-address issuance from an extended public key.
//!
//! Addresses come from the non-hardened external branch `0/i`. The index
//! space is shared by every script scheme, so switching schemes never derives
//! the same child twice. Only public key material is ever handled here.

use std::fmt;
use std::str::FromStr;

use bitcoin::bip32::{ChildNumber, Xpub};
use bitcoin::secp256k1::Secp256k1;
use bitcoin::{Address, Network, NetworkKind};

use crate::error::AddressError;

const EXTERNAL_BRANCH: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressScheme {
    /// Native segwit v0, pay-to-witness-pubkey-hash
    P2wpkh,
    /// Taproot key-path, no script tree
    P2tr,
}

impl FromStr for AddressScheme {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "p2wpkh" => Ok(AddressScheme::P2wpkh),
            "p2tr" => Ok(AddressScheme::P2tr),
            other => Err(AddressError::UnsupportedScheme(other.to_string())),
        }
    }
}

impl fmt::Display for AddressScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressScheme::P2wpkh => write!(f, "p2wpkh"),
            AddressScheme::P2tr => write!(f, "p2tr"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedAddress {
    pub address: String,
    /// Child index the address was derived at
    pub index: u32,
    /// Index to persist for the next issuance
    pub next_index: u32,
}

/// Derive the address at `0/index` without consuming anything.
pub fn derive_address(xpub: &str, index: u32, scheme: AddressScheme) -> Result<String, AddressError> {
    let xpub = Xpub::from_str(xpub.trim()).map_err(|e| AddressError::InvalidXpub(e.to_string()))?;
    let child =
        ChildNumber::from_normal_idx(index).map_err(|_| AddressError::IndexExhausted(index))?;
    let branch = ChildNumber::from_normal_idx(EXTERNAL_BRANCH)
        .map_err(|e| AddressError::Derivation(e.to_string()))?;

    let secp = Secp256k1::verification_only();
    let derived = xpub
        .derive_pub(&secp, &[branch, child])
        .map_err(|e| AddressError::Derivation(e.to_string()))?;

    // tpub/vpub-style keys yield testnet addresses
    let network = match xpub.network {
        NetworkKind::Main => Network::Bitcoin,
        NetworkKind::Test => Network::Testnet,
    };

    let address = match scheme {
        AddressScheme::P2wpkh => Address::p2wpkh(&derived.to_pub(), network),
        AddressScheme::P2tr => Address::p2tr(&secp, derived.to_x_only_pub(), None, network),
    };
    Ok(address.to_string())
}

/// Derive the address at `current_index` and report the index that follows.
///
/// Nothing is persisted here. The caller stores `next_index` only once this
/// returns `Ok`, so a failure never skips or burns an index.
pub fn issue_next_address(
    xpub: &str,
    current_index: u32,
    scheme: &str,
) -> Result<IssuedAddress, AddressError> {
    let scheme: AddressScheme = scheme.parse()?;
    let next_index = current_index
        .checked_add(1)
        .ok_or(AddressError::IndexExhausted(current_index))?;
    let address = derive_address(xpub, current_index, scheme)?;

    Ok(IssuedAddress {
        address,
        index: current_index,
        next_index,
    })
}
