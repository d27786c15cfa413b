use std::time::Duration;

use thiserror::Error;

/// A single event could not be decrypted. Never fatal for a batch.
#[derive(Debug, Error)]
pub enum DecryptError {
    #[error("invalid counterparty public key: {0}")]
    InvalidPublicKey(String),

    #[error("cannot decrypt content: {0}")]
    Cipher(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("unsupported address scheme: {0}")]
    UnsupportedScheme(String),

    #[error("invalid extended public key: {0}")]
    InvalidXpub(String),

    #[error("child index {0} is outside the non-hardened range")]
    IndexExhausted(u32),

    #[error("derivation failed: {0}")]
    Derivation(String),
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read or write settings file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse settings: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid stored key: {0}")]
    Key(String),
}

#[derive(Debug, Error)]
pub enum DispatchError {
    /// No extended public key configured but an address was requested.
    #[error("no bitcoin xpub configured")]
    MissingXpub,

    #[error("failed to encrypt reply: {0}")]
    Encrypt(String),

    #[error("failed to sign reply: {0}")]
    Signing(String),

    #[error("publish rejected by all relays: {0}")]
    Publish(String),

    #[error("timed out publishing reply")]
    Timeout,

    #[error(transparent)]
    State(#[from] SettingsError),
}

/// Relay feed setup failures. Only the first two are configuration problems.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("no relays configured")]
    NoRelays,

    #[error("invalid relay URL {url}: {reason}")]
    InvalidRelayUrl { url: String, reason: String },

    #[error("connection timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("no relays connected after {0:?}")]
    NoRelayConnected(Duration),

    #[error("failed to subscribe: {0}")]
    Subscribe(String),
}
