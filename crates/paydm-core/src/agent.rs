//! The polling worker: connect, run one reconcile-and-reply cycle per tick,
//! disconnect on the way out no matter how the loop ended.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;

use anyhow::{Context, Result};
use nostr_sdk::prelude::*;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::constants::{BACKFILL_TIMEOUT, CONNECT_RETRY_INITIAL, CONNECT_RETRY_MAX, POLL_INTERVAL};
use crate::dispatch::{ReplyDispatcher, ReplyPublisher};
use crate::models::{DmEvent, PendingRequest};
use crate::nostr::{Nip04Cipher, NostrReplyPublisher, RelayFeed};
use crate::reconcile::{reconcile, short, Decryptor};
use crate::settings::SettingsStorage;

/// What one cycle did, for the log line.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleSummary {
    pub received: usize,
    pub pending: usize,
    pub replied: usize,
    pub failed: usize,
}

/// What this process knows to be answered, carried across cycles.
///
/// A request and our earlier reply to it can arrive in different drains,
/// so request ids referenced by our own events are kept for the whole
/// session. Requests we reply to ourselves are recorded only after a publish
/// succeeded, along with the sender's latest replied timestamp: a slow relay
/// can redeliver that request, or an older one, before our reply echoes back.
#[derive(Debug, Default)]
pub struct SessionLedger {
    answered: HashSet<String>,
    latest_replied: HashMap<String, (u64, String)>,
}

impl SessionLedger {
    fn remember_replies(&mut self, raw: &[DmEvent], self_pubkey: &str) {
        self.answered.extend(
            raw.iter()
                .filter(|event| event.is_authored_by(self_pubkey))
                .filter_map(|event| event.referenced_event_id.clone()),
        );
    }

    fn covers(&self, request: &PendingRequest) -> bool {
        if self.answered.contains(&request.event.id) {
            return true;
        }
        match self.latest_replied.get(&request.sender) {
            Some((created_at, id)) => {
                request.created_at() < *created_at
                    || (request.created_at() == *created_at && request.event.id >= *id)
            }
            None => false,
        }
    }

    fn record(&mut self, request: &PendingRequest) {
        self.answered.insert(request.event.id.clone());
        self.latest_replied.insert(
            request.sender.clone(),
            (request.created_at(), request.event.id.clone()),
        );
    }
}

/// Reconcile one drained batch and reply to whatever is still outstanding.
///
/// Replies go out one at a time so the derivation index advances serially.
/// A failed reply is logged and counted; it never stops the batch.
pub async fn process_batch<D, P>(
    raw: Vec<DmEvent>,
    self_pubkey: &str,
    decryptor: &D,
    dispatcher: &ReplyDispatcher<P>,
    settings: &mut SettingsStorage,
    ledger: &mut SessionLedger,
) -> CycleSummary
where
    D: Decryptor + ?Sized,
    P: ReplyPublisher,
{
    let mut summary = CycleSummary {
        received: raw.len(),
        ..Default::default()
    };
    if raw.is_empty() {
        return summary;
    }

    ledger.remember_replies(&raw, self_pubkey);
    let pending: Vec<PendingRequest> = reconcile(raw, self_pubkey, decryptor)
        .into_iter()
        .filter(|request| {
            let seen = ledger.covers(request);
            if seen {
                debug!(
                    event_id = %request.event.id,
                    sender = short(&request.sender),
                    "Already answered this session"
                );
            }
            !seen
        })
        .collect();
    summary.pending = pending.len();

    for request in &pending {
        match dispatcher.handle(settings, request).await {
            Ok(outcome) => {
                ledger.record(request);
                summary.replied += 1;
                debug!(reply_id = %outcome.reply_event_id, "Reply sent");
            }
            Err(e) => {
                summary.failed += 1;
                error!(
                    event_id = %request.event.id,
                    sender = short(&request.sender),
                    "Failed to reply: {}",
                    e
                );
            }
        }
    }

    summary
}

pub struct PayDmAgent {
    settings: SettingsStorage,
    keys: Keys,
    ledger: SessionLedger,
}

impl PayDmAgent {
    /// Loads (or creates) the agent identity before anything else happens.
    pub fn new(mut settings: SettingsStorage) -> Result<Self> {
        let keys = settings
            .ensure_identity()
            .context("Failed to load agent identity")?;
        Ok(Self {
            settings,
            keys,
            ledger: SessionLedger::default(),
        })
    }

    pub fn public_key(&self) -> PublicKey {
        self.keys.public_key()
    }

    pub fn settings(&self) -> &SettingsStorage {
        &self.settings
    }

    /// Run until Ctrl-C.
    pub async fn run(self) -> Result<()> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Run until `shutdown` resolves. Relay trouble is retried; only bad
    /// configuration ends the run early. Relays are disconnected on every
    /// exit path.
    pub async fn run_until<F>(mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let relays = self.settings.relays().to_vec();
        if relays.is_empty() {
            anyhow::bail!("No relays configured; add one with `paydm add-relay <url>`");
        }
        if self.settings.bitcoin_xpub().is_none() {
            error!("No bitcoin xpub configured; address requests will get the default message");
        }

        let npub = self.keys.public_key().to_bech32().unwrap_or_default();
        info!(
            npub = %npub,
            last_dm_processed = ?self.settings.last_dm_processed(),
            child_index = self.settings.child_index(),
            "Starting agent"
        );

        let mut feed = RelayFeed::new(&self.keys, &relays).await?;
        tokio::pin!(shutdown);

        let result = self.serve(&mut feed, &mut shutdown).await;
        feed.disconnect().await;
        result
    }

    async fn serve<F>(&mut self, feed: &mut RelayFeed, shutdown: &mut Pin<&mut F>) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        if !self.open_with_backoff(feed, shutdown).await? {
            return Ok(());
        }
        let dispatcher = ReplyDispatcher::new(NostrReplyPublisher::new(
            feed.client(),
            self.keys.clone(),
        ));
        self.poll(feed, &dispatcher, shutdown).await;
        Ok(())
    }

    /// `Ok(false)` when shutdown arrived before a connection was made.
    async fn open_with_backoff<F>(
        &self,
        feed: &mut RelayFeed,
        shutdown: &mut Pin<&mut F>,
    ) -> Result<bool>
    where
        F: Future<Output = ()>,
    {
        let mut delay = CONNECT_RETRY_INITIAL;
        loop {
            let attempt = tokio::select! {
                _ = shutdown.as_mut() => {
                    info!("Shutting down");
                    return Ok(false);
                }
                result = feed.open(self.keys.public_key(), self.settings.last_dm_processed()) => result,
            };

            match attempt {
                Ok(()) => return Ok(true),
                Err(e) if e.is_transient() => {
                    warn!(retry_in = ?delay, "Relay connection failed: {}", e);
                    tokio::select! {
                        _ = shutdown.as_mut() => {
                            info!("Shutting down");
                            return Ok(false);
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    delay = (delay * 2).min(CONNECT_RETRY_MAX);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn poll<F>(
        &mut self,
        feed: &mut RelayFeed,
        dispatcher: &ReplyDispatcher<NostrReplyPublisher>,
        shutdown: &mut Pin<&mut F>,
    ) where
        F: Future<Output = ()>,
    {
        let cipher = Nip04Cipher::new(self.keys.clone());
        let self_pubkey = self.keys.public_key().to_hex();

        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let subscribed_at = Instant::now();
        let mut waiting_for_backfill = true;

        loop {
            tokio::select! {
                _ = shutdown.as_mut() => {
                    info!("Shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    // Stored requests and stored replies must both be in hand
                    // before the first cycle, or an answered request looks new.
                    if waiting_for_backfill {
                        if !feed.backfilled() && subscribed_at.elapsed() < BACKFILL_TIMEOUT {
                            debug!("Waiting for stored events");
                            continue;
                        }
                        if !feed.backfilled() {
                            warn!("Stored events still arriving after {:?}, processing anyway", BACKFILL_TIMEOUT);
                        }
                        waiting_for_backfill = false;
                    }

                    let batch = feed.drain();
                    let summary = process_batch(
                        batch,
                        &self_pubkey,
                        &cipher,
                        dispatcher,
                        &mut self.settings,
                        &mut self.ledger,
                    )
                    .await;
                    if summary.received > 0 {
                        info!(
                            received = summary.received,
                            pending = summary.pending,
                            replied = summary.replied,
                            failed = summary.failed,
                            "Cycle complete"
                        );
                    }
                }
            }
        }
    }
}
