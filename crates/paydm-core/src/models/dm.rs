//! Direct-message events as the reconciliation engine sees them.
//!
//! A `DmEvent` is either an inbound request (authored by someone else and
//! `p`-tagged to us) or one of our own past replies, whose first `e` tag
//! references the request it answered.

use nostr_sdk::prelude::*;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DmEvent {
    pub id: String,
    /// Author pubkey, hex
    pub author: String,
    /// First `p` tag, hex
    pub recipient: Option<String>,
    pub created_at: u64,
    /// NIP-04 ciphertext
    pub content: String,
    /// First `e` tag, hex
    pub referenced_event_id: Option<String>,
}

impl DmEvent {
    pub fn from_event(event: &Event) -> Self {
        Self {
            id: event.id.to_hex(),
            author: event.pubkey.to_hex(),
            recipient: first_tag_value(event, Alphabet::P),
            created_at: event.created_at.as_u64(),
            content: event.content.clone(),
            referenced_event_id: first_tag_value(event, Alphabet::E),
        }
    }

    pub fn is_authored_by(&self, pubkey_hex: &str) -> bool {
        self.author == pubkey_hex
    }
}

fn first_tag_value(event: &Event, letter: Alphabet) -> Option<String> {
    event
        .tags
        .iter()
        .find(|t| t.kind() == TagKind::SingleLetter(SingleLetterTag::lowercase(letter)))
        .and_then(|t| t.content())
        .map(|s| s.to_string())
}

/// The most recent unanswered request from one sender, already decrypted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    pub sender: String,
    pub event: DmEvent,
    pub cleartext: String,
}

impl PendingRequest {
    pub fn created_at(&self) -> u64 {
        self.event.created_at
    }
}
