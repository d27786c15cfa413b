use nostr_sdk::prelude::*;

use crate::error::{DecryptError, DispatchError};
use crate::reconcile::Decryptor;

/// NIP-04 shared-secret encryption with the agent's keys.
#[derive(Debug, Clone)]
pub struct Nip04Cipher {
    keys: Keys,
}

impl Nip04Cipher {
    pub fn new(keys: Keys) -> Self {
        Self { keys }
    }

    pub fn encrypt(&self, plaintext: &str, counterparty: &PublicKey) -> Result<String, DispatchError> {
        nip04::encrypt(self.keys.secret_key(), counterparty, plaintext)
            .map_err(|e| DispatchError::Encrypt(e.to_string()))
    }
}

impl Decryptor for Nip04Cipher {
    fn decrypt(&self, ciphertext: &str, counterparty_hex: &str) -> Result<String, DecryptError> {
        let counterparty = PublicKey::parse(counterparty_hex)
            .map_err(|e| DecryptError::InvalidPublicKey(e.to_string()))?;
        nip04::decrypt(self.keys.secret_key(), &counterparty, ciphertext)
            .map_err(|e| DecryptError::Cipher(e.to_string()))
    }
}
