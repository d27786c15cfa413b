//! Durable agent state: identity, relays, resume cursor and derivation index.
//!
//! Everything lives in one pretty-printed JSON file. Every mutation is written
//! through immediately, so the file always reflects the last completed side
//! effect (a published reply or a consumed derivation index).

use std::fs;
use std::path::{Path, PathBuf};

use nostr_sdk::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::constants::{DEFAULT_ADDRESS_SCHEME, DEFAULT_CAMPAIGN_MESSAGE, SETTINGS_FILE_NAME};
use crate::error::SettingsError;

fn default_address_scheme() -> String {
    DEFAULT_ADDRESS_SCHEME.to_string()
}

fn default_campaign_message() -> String {
    DEFAULT_CAMPAIGN_MESSAGE.to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// nsec
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nostr_private_key: Option<String>,

    /// npub
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nostr_public_key: Option<String>,

    #[serde(default)]
    pub relays: Vec<String>,

    /// `created_at` of the most recent request we replied to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_dm_processed: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bitcoin_xpub: Option<String>,

    /// Next unused child index on the `0/*` branch
    #[serde(default)]
    pub child_index: u32,

    #[serde(default = "default_address_scheme")]
    pub address_scheme: String,

    #[serde(default = "default_campaign_message")]
    pub campaign_message: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            nostr_private_key: None,
            nostr_public_key: None,
            relays: Vec::new(),
            last_dm_processed: None,
            bitcoin_xpub: None,
            child_index: 0,
            address_scheme: default_address_scheme(),
            campaign_message: default_campaign_message(),
        }
    }
}

pub struct SettingsStorage {
    path: PathBuf,
    settings: Settings,
}

impl SettingsStorage {
    /// `~/.nostr-paydm/settings.json`
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".nostr-paydm")
            .join(SETTINGS_FILE_NAME)
    }

    /// Load settings from `path`. A missing file yields defaults; nothing is
    /// written until the first mutation.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, SettingsError> {
        let path = path.as_ref().to_path_buf();
        let settings = match fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No settings file, using defaults");
                Settings::default()
            }
            Err(source) => {
                return Err(SettingsError::Io {
                    path: path.display().to_string(),
                    source,
                })
            }
        };
        Ok(Self { path, settings })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Write to a sibling temp file and rename over the original.
    pub fn save(&self) -> Result<(), SettingsError> {
        let io_err = |source| SettingsError::Io {
            path: self.path.display().to_string(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(io_err)?;
            }
        }

        let json = serde_json::to_string_pretty(&self.settings)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(io_err)?;
        fs::rename(&tmp, &self.path).map_err(io_err)?;
        Ok(())
    }

    /// Return the agent identity, generating and persisting one on first run.
    pub fn ensure_identity(&mut self) -> Result<Keys, SettingsError> {
        if let Some(stored) = self.settings.nostr_private_key.as_deref() {
            let secret_key =
                SecretKey::parse(stored).map_err(|e| SettingsError::Key(e.to_string()))?;
            let keys = Keys::new(secret_key);

            let npub = keys
                .public_key()
                .to_bech32()
                .map_err(|e| SettingsError::Key(e.to_string()))?;
            if self.settings.nostr_public_key.as_deref() != Some(npub.as_str()) {
                self.settings.nostr_public_key = Some(npub);
                self.save()?;
            }
            return Ok(keys);
        }

        let keys = Keys::generate();
        let nsec = keys
            .secret_key()
            .to_bech32()
            .map_err(|e| SettingsError::Key(e.to_string()))?;
        let npub = keys
            .public_key()
            .to_bech32()
            .map_err(|e| SettingsError::Key(e.to_string()))?;
        self.settings.nostr_private_key = Some(nsec);
        self.settings.nostr_public_key = Some(npub.clone());
        self.save()?;
        info!(npub = %npub, "Generated new agent identity");
        Ok(keys)
    }

    pub fn relays(&self) -> &[String] {
        &self.settings.relays
    }

    /// Append a relay URL; duplicates are ignored.
    pub fn add_relay(&mut self, relay: &str) -> Result<bool, SettingsError> {
        let relay = relay.trim();
        if self.settings.relays.iter().any(|r| r == relay) {
            return Ok(false);
        }
        self.settings.relays.push(relay.to_string());
        self.save()?;
        Ok(true)
    }

    pub fn clear_relays(&mut self) -> Result<(), SettingsError> {
        self.settings.relays.clear();
        self.save()
    }

    pub fn last_dm_processed(&self) -> Option<u64> {
        self.settings.last_dm_processed
    }

    /// Move the cursor forward to `created_at`. Never moves it back.
    /// Returns whether the stored value changed.
    pub fn advance_last_dm_processed(&mut self, created_at: u64) -> Result<bool, SettingsError> {
        match self.settings.last_dm_processed {
            Some(current) if current >= created_at => Ok(false),
            _ => {
                self.settings.last_dm_processed = Some(created_at);
                self.save()?;
                Ok(true)
            }
        }
    }

    pub fn bitcoin_xpub(&self) -> Option<&str> {
        self.settings.bitcoin_xpub.as_deref()
    }

    pub fn set_bitcoin_xpub(&mut self, xpub: &str) -> Result<(), SettingsError> {
        self.settings.bitcoin_xpub = Some(xpub.trim().to_string());
        self.save()
    }

    pub fn child_index(&self) -> u32 {
        self.settings.child_index
    }

    /// Record that every index below `next_index` is consumed. Never moves back.
    pub fn advance_child_index(&mut self, next_index: u32) -> Result<(), SettingsError> {
        if next_index <= self.settings.child_index {
            return Ok(());
        }
        self.settings.child_index = next_index;
        self.save()
    }

    pub fn address_scheme(&self) -> &str {
        &self.settings.address_scheme
    }

    pub fn set_address_scheme(&mut self, scheme: &str) -> Result<(), SettingsError> {
        self.settings.address_scheme = scheme.trim().to_lowercase();
        self.save()
    }

    pub fn campaign_message(&self) -> &str {
        &self.settings.campaign_message
    }

    pub fn set_campaign_message(&mut self, message: &str) -> Result<(), SettingsError> {
        self.settings.campaign_message = message.to_string();
        self.save()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempdir().unwrap();
        let storage = SettingsStorage::load(dir.path().join("settings.json")).unwrap();

        assert!(storage.relays().is_empty());
        assert_eq!(storage.child_index(), 0);
        assert_eq!(storage.last_dm_processed(), None);
        assert_eq!(storage.address_scheme(), "p2wpkh");
        assert!(!dir.path().join("settings.json").exists());
    }

    #[test]
    fn test_reads_legacy_settings_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(
            &path,
            r#"{
                "relays": ["wss://relay.damus.io"],
                "last_dm_processed": 1675000000,
                "bitcoin_xpub": "xpub123",
                "child_index": 42
            }"#,
        )
        .unwrap();

        let storage = SettingsStorage::load(&path).unwrap();
        assert_eq!(storage.relays(), ["wss://relay.damus.io".to_string()]);
        assert_eq!(storage.last_dm_processed(), Some(1675000000));
        assert_eq!(storage.bitcoin_xpub(), Some("xpub123"));
        assert_eq!(storage.child_index(), 42);
        assert_eq!(storage.campaign_message(), DEFAULT_CAMPAIGN_MESSAGE);
    }

    #[test]
    fn test_mutations_are_persisted() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let mut storage = SettingsStorage::load(&path).unwrap();
        assert!(storage.add_relay("wss://a.example").unwrap());
        assert!(!storage.add_relay("wss://a.example").unwrap());
        storage.add_relay("wss://b.example").unwrap();
        storage.set_bitcoin_xpub(" xpubABC ").unwrap();
        storage.advance_child_index(3).unwrap();
        storage.advance_last_dm_processed(500).unwrap();
        storage.set_address_scheme("P2TR").unwrap();
        storage.set_campaign_message("Fund the thing").unwrap();

        let reloaded = SettingsStorage::load(&path).unwrap();
        assert_eq!(reloaded.settings(), storage.settings());
        assert_eq!(
            reloaded.relays(),
            ["wss://a.example".to_string(), "wss://b.example".to_string()]
        );
        assert_eq!(reloaded.bitcoin_xpub(), Some("xpubABC"));
        assert_eq!(reloaded.address_scheme(), "p2tr");
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_clear_relays() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let mut storage = SettingsStorage::load(&path).unwrap();
        storage.add_relay("wss://a.example").unwrap();
        storage.clear_relays().unwrap();

        assert!(SettingsStorage::load(&path).unwrap().relays().is_empty());
    }

    #[test]
    fn test_cursor_never_regresses() {
        let dir = tempdir().unwrap();
        let mut storage = SettingsStorage::load(dir.path().join("settings.json")).unwrap();

        assert!(storage.advance_last_dm_processed(120).unwrap());
        assert!(!storage.advance_last_dm_processed(95).unwrap());
        assert!(!storage.advance_last_dm_processed(120).unwrap());
        assert_eq!(storage.last_dm_processed(), Some(120));
    }

    #[test]
    fn test_child_index_never_regresses() {
        let dir = tempdir().unwrap();
        let mut storage = SettingsStorage::load(dir.path().join("settings.json")).unwrap();

        storage.advance_child_index(5).unwrap();
        storage.advance_child_index(2).unwrap();
        assert_eq!(storage.child_index(), 5);
    }

    #[test]
    fn test_identity_generated_once() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");

        let mut storage = SettingsStorage::load(&path).unwrap();
        let keys = storage.ensure_identity().unwrap();
        assert!(path.exists());

        let mut reloaded = SettingsStorage::load(&path).unwrap();
        let again = reloaded.ensure_identity().unwrap();
        assert_eq!(again.public_key(), keys.public_key());

        let settings = reloaded.settings();
        assert!(settings.nostr_private_key.as_deref().unwrap().starts_with("nsec1"));
        assert_eq!(
            settings.nostr_public_key.as_deref(),
            Some(keys.public_key().to_bech32().unwrap().as_str())
        );
    }

    #[test]
    fn test_identity_from_stored_nsec_fills_npub() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let keys = Keys::generate();
        let nsec = keys.secret_key().to_bech32().unwrap();
        fs::write(&path, format!(r#"{{"nostr_private_key": "{}"}}"#, nsec)).unwrap();

        let mut storage = SettingsStorage::load(&path).unwrap();
        let loaded = storage.ensure_identity().unwrap();
        assert_eq!(loaded.public_key(), keys.public_key());
        assert!(storage.settings().nostr_public_key.is_some());
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "{ not json").unwrap();

        assert!(matches!(
            SettingsStorage::load(&path),
            Err(SettingsError::Parse(_))
        ));
    }
}
