//! Turns a pending request into exactly one signed, published reply.
//!
//! Ordering of side effects matters for restart safety:
//! 1. derive an address, then persist the advanced index,
//! 2. sign and publish the reply,
//! 3. only then advance the resume cursor.
//!
//! A crash or publish failure after step 1 burns the index. That is the
//! intended trade: an address is never handed out twice.

use std::time::Duration;

use async_trait::async_trait;
use nostr_sdk::Event;
use tracing::{error, info, warn};

use crate::address::{issue_next_address, IssuedAddress};
use crate::constants::{PUBLISH_ATTEMPTS, PUBLISH_RETRY_DELAY};
use crate::error::DispatchError;
use crate::models::PendingRequest;
use crate::policy::{decide_reply, default_reply_body, ReplyIntent};
use crate::reconcile::short;
use crate::settings::SettingsStorage;

/// Cleartext reply to one request, before encryption and signing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundReply {
    /// Recipient pubkey, hex
    pub recipient: String,
    /// Id of the request being answered; becomes the reply's `e` tag
    pub referenced_event_id: String,
    pub body: String,
}

/// Signing and relay publishing, kept apart so a retry resends the same event.
#[async_trait]
pub trait ReplyPublisher: Send + Sync {
    fn sign(&self, reply: &OutboundReply) -> Result<Event, DispatchError>;

    async fn send(&self, event: &Event) -> Result<(), DispatchError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyBody {
    Address { address: String, index: u32 },
    Default,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub reply_event_id: String,
    pub body: ReplyBody,
    pub cursor_advanced: bool,
}

impl DispatchError {
    /// Worth another send attempt with the same signed event.
    pub fn is_transient(&self) -> bool {
        matches!(self, DispatchError::Publish(_) | DispatchError::Timeout)
    }
}

pub struct ReplyDispatcher<P> {
    publisher: P,
    attempts: u32,
    retry_delay: Duration,
}

impl<P: ReplyPublisher> ReplyDispatcher<P> {
    pub fn new(publisher: P) -> Self {
        Self::with_retry(publisher, PUBLISH_ATTEMPTS, PUBLISH_RETRY_DELAY)
    }

    pub fn with_retry(publisher: P, attempts: u32, retry_delay: Duration) -> Self {
        Self {
            publisher,
            attempts: attempts.max(1),
            retry_delay,
        }
    }

    pub fn publisher(&self) -> &P {
        &self.publisher
    }

    pub async fn handle(
        &self,
        settings: &mut SettingsStorage,
        request: &PendingRequest,
    ) -> Result<DispatchOutcome, DispatchError> {
        info!(
            event_id = %request.event.id,
            sender = short(&request.sender),
            "Preparing reply"
        );

        let (body, kind) = match decide_reply(&request.cleartext) {
            ReplyIntent::IssueAddress => match Self::issue_address(settings)? {
                Some(issued) => (
                    issued.address.clone(),
                    ReplyBody::Address {
                        address: issued.address,
                        index: issued.index,
                    },
                ),
                None => (default_reply_body(settings.campaign_message()), ReplyBody::Default),
            },
            ReplyIntent::SendDefaultMessage => {
                (default_reply_body(settings.campaign_message()), ReplyBody::Default)
            }
        };

        let reply = OutboundReply {
            recipient: request.sender.clone(),
            referenced_event_id: request.event.id.clone(),
            body,
        };
        let event = self.publisher.sign(&reply)?;
        let reply_event_id = event.id.to_hex();

        if let Err(e) = self.send_with_retry(&event).await {
            error!(
                event_id = %request.event.id,
                reply_id = %reply_event_id,
                "Reply not published: {}",
                e
            );
            return Err(e);
        }

        // The reply is out: a failed save is logged, not a failed request
        let cursor_advanced = match settings.advance_last_dm_processed(request.created_at()) {
            Ok(advanced) => advanced,
            Err(e) => {
                error!(
                    event_id = %request.event.id,
                    reply_id = %reply_event_id,
                    "Reply published but cursor not persisted: {}",
                    e
                );
                false
            }
        };
        if cursor_advanced {
            info!(last_dm_processed = request.created_at(), "Advanced cursor");
        }

        Ok(DispatchOutcome {
            reply_event_id,
            body: kind,
            cursor_advanced,
        })
    }

    /// Derive the next address and persist the consumed index.
    ///
    /// `Ok(None)` means the request degrades to the default message (no xpub,
    /// unsupported scheme, bad key). A failed save is an error: the reply must
    /// not go out with an address that could be issued again.
    fn issue_address(settings: &mut SettingsStorage) -> Result<Option<IssuedAddress>, DispatchError> {
        let Some(xpub) = settings.bitcoin_xpub().map(str::to_string) else {
            error!("{}; replying with the default message", DispatchError::MissingXpub);
            return Ok(None);
        };

        let issued = match issue_next_address(&xpub, settings.child_index(), settings.address_scheme()) {
            Ok(issued) => issued,
            Err(e) => {
                warn!("Cannot issue address, replying with the default message: {}", e);
                return Ok(None);
            }
        };

        settings.advance_child_index(issued.next_index)?;
        info!(index = issued.index, address = %issued.address, "Issued address");
        Ok(Some(issued))
    }

    async fn send_with_retry(&self, event: &Event) -> Result<(), DispatchError> {
        let mut attempt = 1;
        loop {
            match self.publisher.send(event).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt < self.attempts => {
                    warn!(
                        reply_id = %event.id,
                        attempt,
                        "Publish failed, retrying: {}",
                        e
                    );
                    attempt += 1;
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::DmEvent;
    use crate::nostr::build_reply_event;
    use nostr_sdk::prelude::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tempfile::{tempdir, TempDir};

    pub(crate) const XPUB: &str = "xpub6CatWdiZiodmUeTDp8LT5or8nmbKNcuyvz7WyksVFkKB4RHwCD3XyuvPEbvqAQY3rAPshWcMLoP2fMFMKHPJ4ZeZXYVUhLv1VMrjPC7PW6V";
    pub(crate) const FIRST_ADDRESS: &str = "bc1qcr8te4kr609gcawutmrza0j4xv80jy8z306fyu";
    pub(crate) const SECOND_ADDRESS: &str = "bc1qnjg0jd8228aq7egyzacy8cys3knf9xvrerkf9g";

    /// Signs for real, records what it would have sent, and fails the first
    /// `failures` sends.
    pub(crate) struct RecordingPublisher {
        pub keys: Keys,
        pub sent: Mutex<Vec<Event>>,
        pub send_calls: AtomicU32,
        failures: AtomicU32,
    }

    impl RecordingPublisher {
        pub fn new(keys: Keys) -> Self {
            Self::failing(keys, 0)
        }

        pub fn failing(keys: Keys, failures: u32) -> Self {
            Self {
                keys,
                sent: Mutex::new(Vec::new()),
                send_calls: AtomicU32::new(0),
                failures: AtomicU32::new(failures),
            }
        }

        pub fn sent(&self) -> Vec<Event> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ReplyPublisher for RecordingPublisher {
        fn sign(&self, reply: &OutboundReply) -> Result<Event, DispatchError> {
            build_reply_event(&self.keys, reply)
        }

        async fn send(&self, event: &Event) -> Result<(), DispatchError> {
            self.send_calls.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(DispatchError::Publish("relay said no".to_string()));
            }
            self.sent.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    pub(crate) fn storage_with_xpub(xpub: Option<&str>) -> (TempDir, SettingsStorage) {
        let dir = tempdir().unwrap();
        let mut storage = SettingsStorage::load(dir.path().join("settings.json")).unwrap();
        if let Some(xpub) = xpub {
            storage.set_bitcoin_xpub(xpub).unwrap();
        }
        (dir, storage)
    }

    pub(crate) fn request(sender: &Keys, id: &str, created_at: u64, cleartext: &str) -> PendingRequest {
        PendingRequest {
            sender: sender.public_key().to_hex(),
            event: DmEvent {
                id: id.to_string(),
                author: sender.public_key().to_hex(),
                recipient: None,
                created_at,
                content: String::new(),
                referenced_event_id: None,
            },
            cleartext: cleartext.to_string(),
        }
    }

    pub(crate) fn event_id(n: u8) -> String {
        format!("{:02x}", n).repeat(32)
    }

    fn decrypt_body(recipient: &Keys, event: &Event) -> String {
        nip04::decrypt(recipient.secret_key(), &event.pubkey, &event.content).unwrap()
    }

    fn no_wait(publisher: RecordingPublisher) -> ReplyDispatcher<RecordingPublisher> {
        ReplyDispatcher::with_retry(publisher, 3, Duration::ZERO)
    }

    #[tokio::test]
    async fn test_fresh_state_address_request() {
        let agent = Keys::generate();
        let sender = Keys::generate();
        let (_dir, mut storage) = storage_with_xpub(Some(XPUB));
        let dispatcher = no_wait(RecordingPublisher::new(agent.clone()));
        let e1 = event_id(1);

        let outcome = dispatcher
            .handle(&mut storage, &request(&sender, &e1, 1000, "address"))
            .await
            .unwrap();

        assert_eq!(
            outcome.body,
            ReplyBody::Address {
                address: FIRST_ADDRESS.to_string(),
                index: 0
            }
        );
        assert!(outcome.cursor_advanced);
        assert_eq!(storage.child_index(), 1);
        assert_eq!(storage.last_dm_processed(), Some(1000));

        let reloaded = SettingsStorage::load(storage.path()).unwrap();
        assert_eq!(reloaded.child_index(), 1);
        assert_eq!(reloaded.last_dm_processed(), Some(1000));

        let sent = dispatcher.publisher().sent();
        assert_eq!(sent.len(), 1);
        let reply = DmEvent::from_event(&sent[0]);
        assert_eq!(reply.referenced_event_id.as_deref(), Some(e1.as_str()));
        assert_eq!(reply.recipient, Some(sender.public_key().to_hex()));
        assert_eq!(reply.author, agent.public_key().to_hex());
        assert_eq!(sent[0].kind, Kind::EncryptedDirectMessage);
        assert_eq!(outcome.reply_event_id, sent[0].id.to_hex());
        assert_eq!(decrypt_body(&sender, &sent[0]), FIRST_ADDRESS);
    }

    #[tokio::test]
    async fn test_default_message_does_not_touch_index() {
        let agent = Keys::generate();
        let sender = Keys::generate();
        let (_dir, mut storage) = storage_with_xpub(Some(XPUB));
        storage.set_campaign_message("Help us run the relay.").unwrap();
        let dispatcher = no_wait(RecordingPublisher::new(agent));

        let outcome = dispatcher
            .handle(&mut storage, &request(&sender, &event_id(2), 50, "hello there"))
            .await
            .unwrap();

        assert_eq!(outcome.body, ReplyBody::Default);
        assert_eq!(storage.child_index(), 0);
        assert_eq!(storage.last_dm_processed(), Some(50));

        let body = decrypt_body(&sender, &dispatcher.publisher().sent()[0]);
        assert!(body.starts_with("Help us run the relay."));
        assert!(body.contains("\"address\""));
    }

    #[tokio::test]
    async fn test_missing_xpub_degrades_to_default_message() {
        let sender = Keys::generate();
        let (_dir, mut storage) = storage_with_xpub(None);
        let dispatcher = no_wait(RecordingPublisher::new(Keys::generate()));

        let outcome = dispatcher
            .handle(&mut storage, &request(&sender, &event_id(3), 10, "Address"))
            .await
            .unwrap();

        assert_eq!(outcome.body, ReplyBody::Default);
        assert_eq!(storage.child_index(), 0);
        assert_eq!(dispatcher.publisher().sent().len(), 1);
    }

    #[tokio::test]
    async fn test_unsupported_scheme_degrades_without_consuming_index() {
        let sender = Keys::generate();
        let (_dir, mut storage) = storage_with_xpub(Some(XPUB));
        storage.set_address_scheme("p2pkh").unwrap();
        let dispatcher = no_wait(RecordingPublisher::new(Keys::generate()));

        let outcome = dispatcher
            .handle(&mut storage, &request(&sender, &event_id(4), 10, "address"))
            .await
            .unwrap();
        assert_eq!(outcome.body, ReplyBody::Default);
        assert_eq!(storage.child_index(), 0);

        // Fixing the scheme picks up at the untouched index.
        storage.set_address_scheme("p2wpkh").unwrap();
        let outcome = dispatcher
            .handle(&mut storage, &request(&sender, &event_id(5), 11, "address"))
            .await
            .unwrap();
        assert_eq!(
            outcome.body,
            ReplyBody::Address {
                address: FIRST_ADDRESS.to_string(),
                index: 0
            }
        );
    }

    #[tokio::test]
    async fn test_consecutive_address_requests_advance_index() {
        let (_dir, mut storage) = storage_with_xpub(Some(XPUB));
        let dispatcher = no_wait(RecordingPublisher::new(Keys::generate()));

        let alice = Keys::generate();
        let bob = Keys::generate();
        dispatcher
            .handle(&mut storage, &request(&alice, &event_id(6), 10, "address"))
            .await
            .unwrap();
        let outcome = dispatcher
            .handle(&mut storage, &request(&bob, &event_id(7), 20, "address"))
            .await
            .unwrap();

        assert_eq!(
            outcome.body,
            ReplyBody::Address {
                address: SECOND_ADDRESS.to_string(),
                index: 1
            }
        );
        assert_eq!(storage.child_index(), 2);
    }

    #[tokio::test]
    async fn test_transient_failure_retries_same_event() {
        let sender = Keys::generate();
        let (_dir, mut storage) = storage_with_xpub(Some(XPUB));
        let dispatcher = no_wait(RecordingPublisher::failing(Keys::generate(), 2));

        let outcome = dispatcher
            .handle(&mut storage, &request(&sender, &event_id(8), 300, "address"))
            .await
            .unwrap();

        assert_eq!(dispatcher.publisher().send_calls.load(Ordering::SeqCst), 3);
        assert_eq!(dispatcher.publisher().sent().len(), 1);
        assert_eq!(outcome.reply_event_id, dispatcher.publisher().sent()[0].id.to_hex());
        // One address consumed despite the retries.
        assert_eq!(storage.child_index(), 1);
        assert_eq!(storage.last_dm_processed(), Some(300));
    }

    #[tokio::test]
    async fn test_publish_failure_keeps_index_and_cursor() {
        let sender = Keys::generate();
        let (_dir, mut storage) = storage_with_xpub(Some(XPUB));
        storage.advance_last_dm_processed(100).unwrap();
        let dispatcher = no_wait(RecordingPublisher::failing(Keys::generate(), 10));

        let err = dispatcher
            .handle(&mut storage, &request(&sender, &event_id(9), 200, "address"))
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::Publish(_)));
        assert_eq!(dispatcher.publisher().send_calls.load(Ordering::SeqCst), 3);
        // The address was consumed and is never reissued.
        assert_eq!(storage.child_index(), 1);
        assert_eq!(storage.last_dm_processed(), Some(100));
    }

    #[tokio::test]
    async fn test_older_request_does_not_move_cursor_back() {
        let sender = Keys::generate();
        let (_dir, mut storage) = storage_with_xpub(None);
        storage.advance_last_dm_processed(500).unwrap();
        let dispatcher = no_wait(RecordingPublisher::new(Keys::generate()));

        let outcome = dispatcher
            .handle(&mut storage, &request(&sender, &event_id(10), 400, "hi"))
            .await
            .unwrap();

        assert!(!outcome.cursor_advanced);
        assert_eq!(storage.last_dm_processed(), Some(500));
    }

    #[tokio::test]
    async fn test_cursor_save_failure_still_counts_as_replied() {
        let sender = Keys::generate();
        let (_dir, mut storage) = storage_with_xpub(None);
        // A directory where the settings file belongs makes every save fail.
        std::fs::create_dir_all(storage.path()).unwrap();
        let dispatcher = no_wait(RecordingPublisher::new(Keys::generate()));

        let outcome = dispatcher
            .handle(&mut storage, &request(&sender, &event_id(11), 700, "hi"))
            .await
            .unwrap();

        assert!(!outcome.cursor_advanced);
        assert_eq!(dispatcher.publisher().sent().len(), 1);
        assert_eq!(outcome.reply_event_id, dispatcher.publisher().sent()[0].id.to_hex());
    }

    #[tokio::test]
    async fn test_unsignable_reply_is_not_retried() {
        let sender = Keys::generate();
        let (_dir, mut storage) = storage_with_xpub(None);
        let dispatcher = no_wait(RecordingPublisher::new(Keys::generate()));

        let err = dispatcher
            .handle(&mut storage, &request(&sender, "not-an-event-id", 10, "hi"))
            .await
            .unwrap_err();

        assert!(!err.is_transient());
        assert_eq!(dispatcher.publisher().send_calls.load(Ordering::SeqCst), 0);
        assert_eq!(storage.last_dm_processed(), None);
    }
}
