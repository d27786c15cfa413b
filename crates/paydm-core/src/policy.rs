//! Maps a decrypted request to the kind of reply it gets.
//!
//! The protocol has exactly one command. Anything that isn't it gets the
//! campaign message.

use crate::constants::{ADDRESS_INSTRUCTIONS, ADDRESS_KEYWORD};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyIntent {
    IssueAddress,
    SendDefaultMessage,
}

pub fn decide_reply(cleartext: &str) -> ReplyIntent {
    if cleartext.trim().to_lowercase().starts_with(ADDRESS_KEYWORD) {
        ReplyIntent::IssueAddress
    } else {
        ReplyIntent::SendDefaultMessage
    }
}

/// Campaign message followed by instructions for requesting an address.
pub fn default_reply_body(campaign_message: &str) -> String {
    format!("{}{}", campaign_message, ADDRESS_INSTRUCTIONS)
}
