//! Protocol constants and defaults shared across the agent.

use std::time::Duration;

/// NIP-04 encrypted direct message
pub const KIND_ENCRYPTED_DM: u16 = 4;

/// The only command the agent understands. Matched as a case-insensitive prefix.
pub const ADDRESS_KEYWORD: &str = "address";

/// Appended to the campaign message on every non-address reply.
pub const ADDRESS_INSTRUCTIONS: &str =
    "\n\nIf you'd like to make an onchain donation, just DM me the word: \"address\"";

pub const DEFAULT_CAMPAIGN_MESSAGE: &str = "Thanks for reaching out!";

pub const DEFAULT_ADDRESS_SCHEME: &str = "p2wpkh";

pub const SETTINGS_FILE_NAME: &str = "settings.json";

/// Delay between reconciliation cycles
pub const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Bound on every relay round-trip (connect, subscribe, send)
pub const RELAY_TIMEOUT: Duration = Duration::from_secs(10);

pub const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Publish attempts per reply before giving up
pub const PUBLISH_ATTEMPTS: u32 = 3;

pub const PUBLISH_RETRY_DELAY: Duration = Duration::from_millis(500);

/// First wait after a failed relay connection; doubles up to `CONNECT_RETRY_MAX`
pub const CONNECT_RETRY_INITIAL: Duration = Duration::from_secs(5);

pub const CONNECT_RETRY_MAX: Duration = Duration::from_secs(60);

/// How long the first cycle waits for both subscriptions to reach end of stored events
pub const BACKFILL_TIMEOUT: Duration = Duration::from_secs(15);
