//! Settings subcommands. Each returns the JSON document the binary prints.

use std::str::FromStr;

use anyhow::{Context, Result};
use nostr_sdk::prelude::*;
use paydm_core::address::derive_address;
use paydm_core::{issue_next_address, AddressScheme, SettingsStorage};
use serde_json::{json, Value};

pub fn show(storage: &SettingsStorage, keys: &Keys) -> Result<Value> {
    let npub = keys
        .public_key()
        .to_bech32()
        .context("Failed to encode npub")?;

    Ok(json!({
        "npub": npub,
        "settings_path": storage.path().display().to_string(),
        "relays": storage.relays(),
        "last_dm_processed": storage.last_dm_processed(),
        "child_index": storage.child_index(),
        "address_scheme": storage.address_scheme(),
        "xpub_configured": storage.bitcoin_xpub().is_some(),
        "campaign_message": storage.campaign_message(),
    }))
}

pub fn add_relay(storage: &mut SettingsStorage, url: &str) -> Result<Value> {
    let url = url.trim();
    RelayUrl::parse(url).with_context(|| format!("Invalid relay URL: {}", url))?;
    let added = storage.add_relay(url)?;
    Ok(json!({ "relay": url, "added": added, "relays": storage.relays() }))
}

pub fn clear_relays(storage: &mut SettingsStorage) -> Result<Value> {
    let removed = storage.relays().len();
    storage.clear_relays()?;
    Ok(json!({ "removed": removed }))
}

/// Rejects keys that cannot derive before anything is saved.
pub fn set_xpub(storage: &mut SettingsStorage, xpub: &str) -> Result<Value> {
    let xpub = xpub.trim();
    derive_address(xpub, 0, AddressScheme::P2wpkh).context("Rejected extended public key")?;
    storage.set_bitcoin_xpub(xpub)?;

    let next = issue_next_address(xpub, storage.child_index(), storage.address_scheme())
        .ok()
        .map(|issued| issued.address);
    Ok(json!({
        "xpub_configured": true,
        "child_index": storage.child_index(),
        "next_address": next,
    }))
}

pub fn set_scheme(storage: &mut SettingsStorage, scheme: &str) -> Result<Value> {
    let scheme = AddressScheme::from_str(scheme)?;
    storage.set_address_scheme(&scheme.to_string())?;
    Ok(json!({ "address_scheme": scheme.to_string() }))
}

pub fn set_campaign_message(storage: &mut SettingsStorage, message: &str) -> Result<Value> {
    if message.trim().is_empty() {
        anyhow::bail!("Campaign message must not be empty");
    }
    storage.set_campaign_message(message)?;
    Ok(json!({ "campaign_message": storage.campaign_message() }))
}

/// Preview of the address the next request would get. Consumes nothing.
pub fn next_address(storage: &SettingsStorage) -> Result<Value> {
    let xpub = storage
        .bitcoin_xpub()
        .context("No bitcoin xpub configured; set one with `paydm set-xpub <xpub>`")?;
    let issued = issue_next_address(xpub, storage.child_index(), storage.address_scheme())?;
    Ok(json!({
        "index": issued.index,
        "address": issued.address,
        "address_scheme": storage.address_scheme(),
    }))
}
