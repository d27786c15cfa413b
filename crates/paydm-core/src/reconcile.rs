//! Reduce a raw, replayable DM feed to one unanswered request per sender.
//!
//! The relays are the only record of what has been answered: every reply the
//! agent publishes carries an `e` tag pointing at the request it answers, so
//! the agent's own events (fetched through the `authors = [self]` filter)
//! tell us which requests are already handled.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use tracing::{debug, warn};

use crate::error::DecryptError;
use crate::models::{DmEvent, PendingRequest};

/// Decrypts a DM payload sent by (or to) `counterparty_hex`.
pub trait Decryptor {
    fn decrypt(&self, ciphertext: &str, counterparty_hex: &str) -> Result<String, DecryptError>;
}

/// Shortened key/id for log lines.
pub(crate) fn short(s: &str) -> &str {
    s.get(..8).unwrap_or(s)
}

/// `true` when `candidate` should replace `current` as a sender's latest
/// request. Later `created_at` wins; on a tie the smaller event id wins so the
/// result does not depend on delivery order.
fn supersedes(candidate: &DmEvent, current: &DmEvent) -> bool {
    match candidate.created_at.cmp(&current.created_at) {
        Ordering::Greater => true,
        Ordering::Less => false,
        Ordering::Equal => candidate.id < current.id,
    }
}

pub fn reconcile<I, D>(raw_events: I, self_pubkey: &str, decryptor: &D) -> Vec<PendingRequest>
where
    I: IntoIterator<Item = DmEvent>,
    D: Decryptor + ?Sized,
{
    let mut answered: HashSet<String> = HashSet::new();
    let mut latest: HashMap<String, PendingRequest> = HashMap::new();

    for event in raw_events {
        if event.is_authored_by(self_pubkey) {
            if let Some(referenced) = event.referenced_event_id {
                answered.insert(referenced);
            }
            continue;
        }

        let cleartext = match decryptor.decrypt(&event.content, &event.author) {
            Ok(cleartext) => cleartext,
            Err(e) => {
                // p-tagged to us but encrypted for someone else, or garbage
                warn!(
                    event_id = %event.id,
                    sender = short(&event.author),
                    "Ignoring undecryptable DM: {}",
                    e
                );
                continue;
            }
        };

        let replace = latest
            .get(&event.author)
            .map_or(true, |current| supersedes(&event, &current.event));
        if replace {
            debug!(
                event_id = %event.id,
                sender = short(&event.author),
                created_at = event.created_at,
                "Latest request from sender"
            );
            latest.insert(
                event.author.clone(),
                PendingRequest {
                    sender: event.author.clone(),
                    event,
                    cleartext,
                },
            );
        }
    }

    let mut pending: Vec<PendingRequest> = latest
        .into_values()
        .filter(|request| {
            let done = answered.contains(&request.event.id);
            if done {
                debug!(
                    event_id = %request.event.id,
                    sender = short(&request.sender),
                    "Already responded"
                );
            }
            !done
        })
        .collect();

    pending.sort_by(|a, b| {
        a.event
            .created_at
            .cmp(&b.event.created_at)
            .then_with(|| a.event.id.cmp(&b.event.id))
    });
    pending
}
