//! Relay connection and the buffered DM feed the agent drains every tick.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nostr_sdk::prelude::*;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};

use crate::constants::RELAY_TIMEOUT;
use crate::error::FeedError;
use crate::models::DmEvent;

/// Two subscriptions: DMs addressed to the agent, and DMs the agent authored
/// (its past replies, which say what has already been answered).
///
/// With a cursor both start at `cursor + 1` so the last handled request is
/// not fetched again.
pub fn dm_filters(agent: PublicKey, cursor: Option<u64>) -> Vec<Filter> {
    let mut inbound = Filter::new().kind(Kind::EncryptedDirectMessage).pubkey(agent);
    let mut outbound = Filter::new().kind(Kind::EncryptedDirectMessage).author(agent);

    if let Some(last) = cursor {
        let since = Timestamp::from(last.saturating_add(1));
        inbound = inbound.since(since);
        outbound = outbound.since(since);
    }

    vec![inbound, outbound]
}

/// Subscription ids, fixed so end-of-stored-events can be matched and a
/// retried `open` replaces rather than duplicates a subscription.
const INBOUND_SUBSCRIPTION: &str = "paydm-inbound";
const OUTBOUND_SUBSCRIPTION: &str = "paydm-outbound";

impl FeedError {
    /// Worth another `open` after a backoff.
    pub fn is_transient(&self) -> bool {
        !matches!(self, FeedError::NoRelays | FeedError::InvalidRelayUrl { .. })
    }
}

pub struct RelayFeed {
    client: Client,
    tx: mpsc::UnboundedSender<DmEvent>,
    rx: mpsc::UnboundedReceiver<DmEvent>,
    cancel_tx: watch::Sender<bool>,
    backfilled: Arc<AtomicBool>,
    forwarding: bool,
}

impl RelayFeed {
    /// Register `relays` without connecting. Fails only on configuration.
    pub async fn new(keys: &Keys, relays: &[String]) -> Result<Self, FeedError> {
        if relays.is_empty() {
            return Err(FeedError::NoRelays);
        }

        let client = Client::builder().signer(keys.clone()).build();
        for url in relays {
            client
                .add_relay(url.as_str())
                .await
                .map_err(|e| FeedError::InvalidRelayUrl {
                    url: url.clone(),
                    reason: e.to_string(),
                })?;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let (cancel_tx, _) = watch::channel(false);
        Ok(Self {
            client,
            tx,
            rx,
            cancel_tx,
            backfilled: Arc::new(AtomicBool::new(false)),
            forwarding: false,
        })
    }

    /// Connect, start the notification forwarder and subscribe. Safe to call
    /// again after a failure.
    pub async fn open(&mut self, agent: PublicKey, cursor: Option<u64>) -> Result<(), FeedError> {
        info!("Connecting to relays...");
        let connect_start = Instant::now();
        tokio::time::timeout(RELAY_TIMEOUT, self.client.connect())
            .await
            .map_err(|_| FeedError::ConnectTimeout(RELAY_TIMEOUT))?;
        self.wait_for_connected_relay().await?;
        info!("Relays connected in {:?}", connect_start.elapsed());

        // Listen before subscribing so nothing from the initial backfill is missed
        if !self.forwarding {
            self.spawn_notification_forwarder();
            self.forwarding = true;
        }

        let ids = [INBOUND_SUBSCRIPTION, OUTBOUND_SUBSCRIPTION];
        for (id, filter) in ids.into_iter().zip(dm_filters(agent, cursor)) {
            let filter_json = serde_json::to_string(&filter).unwrap_or_default();
            tokio::time::timeout(
                RELAY_TIMEOUT,
                self.client
                    .subscribe_with_id(SubscriptionId::new(id), filter, None),
            )
            .await
            .map_err(|_| FeedError::Subscribe("timed out".to_string()))?
            .map_err(|e| FeedError::Subscribe(e.to_string()))?;
            debug!(subscription = id, filter = %filter_json, "Subscribed");
        }

        Ok(())
    }

    /// Poll until at least one relay reports connected.
    async fn wait_for_connected_relay(&self) -> Result<(), FeedError> {
        let verify_start = Instant::now();
        let poll_interval = Duration::from_millis(100);

        loop {
            let connected = self
                .client
                .relays()
                .await
                .values()
                .filter(|r| r.status() == nostr_sdk::RelayStatus::Connected)
                .count();
            if connected > 0 {
                debug!(connected, "Relay connection verified");
                return Ok(());
            }
            if verify_start.elapsed() >= RELAY_TIMEOUT {
                return Err(FeedError::NoRelayConnected(RELAY_TIMEOUT));
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    fn spawn_notification_forwarder(&self) {
        let mut notifications = self.client.notifications();
        let mut cancel_rx = self.cancel_tx.subscribe();
        let tx = self.tx.clone();
        let backfilled = Arc::clone(&self.backfilled);

        tokio::spawn(async move {
            let mut stored_done: HashSet<SubscriptionId> = HashSet::new();
            loop {
                tokio::select! {
                    _ = cancel_rx.changed() => {
                        if *cancel_rx.borrow() {
                            debug!("Notification forwarder cancelled");
                            break;
                        }
                    }
                    result = notifications.recv() => {
                        match result {
                            Ok(RelayPoolNotification::Event { relay_url, event, .. }) => {
                                if event.kind != Kind::EncryptedDirectMessage {
                                    continue;
                                }
                                debug!(event_id = %event.id, relay = %relay_url, "Received DM");
                                if tx.send(DmEvent::from_event(&event)).is_err() {
                                    break;
                                }
                            }
                            Ok(RelayPoolNotification::Message { relay_url, message }) => {
                                if let RelayMessage::EndOfStoredEvents(sub_id) = &message {
                                    let sub_id: &SubscriptionId = sub_id;
                                    debug!(subscription = %sub_id, relay = %relay_url, "End of stored events");
                                    if is_own_subscription(sub_id) {
                                        stored_done.insert(sub_id.clone());
                                        if stored_done.len() == 2 {
                                            backfilled.store(true, Ordering::SeqCst);
                                        }
                                    }
                                }
                            }
                            Ok(RelayPoolNotification::Shutdown) => {
                                debug!("Relay pool shut down");
                                break;
                            }
                            Ok(_) => {}
                            Err(RecvError::Lagged(skipped)) => {
                                // Skipped DMs are refetched on restart only while newer than the cursor
                                error!(skipped, "Notification channel lagged, DMs may go unanswered");
                            }
                            Err(RecvError::Closed) => break,
                        }
                    }
                }
            }
        });
    }

    /// Whether both subscriptions have finished replaying stored events.
    pub fn backfilled(&self) -> bool {
        self.backfilled.load(Ordering::SeqCst)
    }

    /// Everything buffered since the last call. Never blocks.
    pub fn drain(&mut self) -> Vec<DmEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    pub async fn disconnect(&self) {
        let _ = self.cancel_tx.send(true);
        self.client.disconnect().await;
        info!("Disconnected from relays");
    }
}

fn is_own_subscription(id: &SubscriptionId) -> bool {
    [INBOUND_SUBSCRIPTION, OUTBOUND_SUBSCRIPTION]
        .into_iter()
        .any(|own| *id == SubscriptionId::new(own))
}
