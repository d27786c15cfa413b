use async_trait::async_trait;
use nostr_sdk::prelude::*;
use tracing::debug;

use crate::constants::SEND_TIMEOUT;
use crate::dispatch::{OutboundReply, ReplyPublisher};
use crate::error::DispatchError;
use crate::nostr::Nip04Cipher;

/// Kind-4 reply: encrypted for the requester, `p`-tagging them and
/// `e`-tagging the request it answers.
pub fn build_reply_event(keys: &Keys, reply: &OutboundReply) -> Result<Event, DispatchError> {
    let recipient = PublicKey::parse(&reply.recipient)
        .map_err(|e| DispatchError::Encrypt(format!("invalid recipient: {}", e)))?;
    let request_id = EventId::parse(&reply.referenced_event_id)
        .map_err(|e| DispatchError::Signing(format!("invalid request id: {}", e)))?;
    let content = Nip04Cipher::new(keys.clone()).encrypt(&reply.body, &recipient)?;

    EventBuilder::new(Kind::EncryptedDirectMessage, content)
        .tag(Tag::public_key(recipient))
        .tag(Tag::event(request_id))
        .sign_with_keys(keys)
        .map_err(|e| DispatchError::Signing(e.to_string()))
}

pub struct NostrReplyPublisher {
    client: Client,
    keys: Keys,
}

impl NostrReplyPublisher {
    pub fn new(client: Client, keys: Keys) -> Self {
        Self { client, keys }
    }
}

#[async_trait]
impl ReplyPublisher for NostrReplyPublisher {
    fn sign(&self, reply: &OutboundReply) -> Result<Event, DispatchError> {
        build_reply_event(&self.keys, reply)
    }

    async fn send(&self, event: &Event) -> Result<(), DispatchError> {
        let output = tokio::time::timeout(SEND_TIMEOUT, self.client.send_event(event))
            .await
            .map_err(|_| DispatchError::Timeout)?
            .map_err(|e| DispatchError::Publish(e.to_string()))?;

        if output.success.is_empty() {
            let reasons: Vec<String> = output
                .failed
                .iter()
                .map(|(relay, reason)| format!("{}: {}", relay, reason))
                .collect();
            return Err(DispatchError::Publish(reasons.join("; ")));
        }

        debug!(
            reply_id = %output.id(),
            accepted = output.success.len(),
            rejected = output.failed.len(),
            "Published reply"
        );
        Ok(())
    }
}
