//! JSON-RPC ↔ event content conversion and gift-wrap sealing (§4.S).

use super::{tag, Event, Tag, UnsignedEvent, KIND_GIFT_WRAP_EPHEMERAL, KIND_GIFT_WRAP_PERSISTENT};
use crate::error::{BridgeError, BridgeResult};
use crate::jsonrpc::JsonRpcMessage;
use crate::signer::Signer;
use serde::{Deserialize, Serialize};

/// Per-transport encryption policy (§4.S).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EncryptionMode {
    Disabled,
    #[default]
    Optional,
    Required,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GiftWrapMode {
    #[default]
    Auto,
    Persistent,
    Ephemeral,
}

/// Default maximum decoded JSON-RPC content size, bytes.
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 256 * 1024;

/// Build an unsigned event template wrapping `msg` as JSON content (§4.S
/// `mcpToEventContent`).
pub fn mcp_to_event_content(
    msg: &JsonRpcMessage,
    pubkey: &str,
    kind: u16,
    tags: Vec<Tag>,
    now: i64,
) -> BridgeResult<UnsignedEvent> {
    let content = msg.to_content()?;
    Ok(UnsignedEvent {
        pubkey: pubkey.to_string(),
        created_at: now,
        kind,
        tags,
        content,
    })
}

/// Validate and parse an event's content as a JSON-RPC message (§4.S
/// `eventContentToMcp`). Rejects malformed JSON-RPC shapes and oversize
/// content.
pub fn event_content_to_mcp(event: &Event, max_bytes: usize) -> BridgeResult<JsonRpcMessage> {
    if event.content.len() > max_bytes {
        return Err(BridgeError::OversizeMessage {
            size: event.content.len(),
            limit: max_bytes,
        });
    }
    JsonRpcMessage::parse(&event.content)
        .map_err(|e| BridgeError::MalformedEvent(e.to_string()))
}

#[derive(Serialize, Deserialize)]
struct InnerEventJson {
    inner: Event,
}

/// Seal `inner` into a gift-wrap outer event addressed to `recipient_pubkey`.
/// The outer `pubkey` is a fresh throwaway key (§4.S), never the sender's
/// real identity — that is the entire point of a gift wrap.
pub async fn encrypt_gift_wrap(
    inner: &Event,
    recipient_pubkey: &str,
    ephemeral: bool,
    now: i64,
) -> BridgeResult<Event> {
    let throwaway = crate::signer::PrivateKeySigner::generate();
    let inner_json = serde_json::to_string(inner)?;
    let sealed = throwaway.nip44_encrypt(recipient_pubkey, &inner_json).await?;

    let kind = if ephemeral {
        KIND_GIFT_WRAP_EPHEMERAL
    } else {
        KIND_GIFT_WRAP_PERSISTENT
    };

    let template = UnsignedEvent {
        pubkey: throwaway.get_public_key(),
        created_at: now,
        kind,
        tags: vec![tag("p", recipient_pubkey)],
        content: sealed,
    };
    throwaway.sign_event(template).await
}

/// Unseal a gift-wrap outer event using `signer` (the recipient's key) and
/// return the inner event.
pub async fn decrypt_gift_wrap(outer: &Event, signer: &dyn Signer) -> BridgeResult<Event> {
    let plaintext = signer.nip44_decrypt(&outer.pubkey, &outer.content).await?;
    serde_json::from_str(&plaintext).map_err(|e| BridgeError::MalformedEvent(e.to_string()))
}

/// Decide whether plaintext/ciphertext is admissible for an inbound message
/// under the transport's encryption policy (§4.S).
pub fn policy_allows_inbound(mode: EncryptionMode, was_encrypted: bool) -> bool {
    match mode {
        EncryptionMode::Disabled => !was_encrypted,
        EncryptionMode::Optional => true,
        EncryptionMode::Required => was_encrypted,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signer::PrivateKeySigner;

    #[test]
    fn encryption_policy_matrix() {
        assert!(policy_allows_inbound(EncryptionMode::Disabled, false));
        assert!(!policy_allows_inbound(EncryptionMode::Disabled, true));
        assert!(policy_allows_inbound(EncryptionMode::Optional, false));
        assert!(policy_allows_inbound(EncryptionMode::Optional, true));
        assert!(!policy_allows_inbound(EncryptionMode::Required, false));
        assert!(policy_allows_inbound(EncryptionMode::Required, true));
    }

    #[tokio::test]
    async fn gift_wrap_round_trips() {
        let sender = PrivateKeySigner::generate();
        let recipient = PrivateKeySigner::generate();

        let inner_template = UnsignedEvent {
            pubkey: sender.get_public_key(),
            created_at: 1_700_000_000,
            kind: super::super::KIND_APPLICATION_MESSAGE,
            tags: vec![],
            content: r#"{"jsonrpc":"2.0","id":1,"method":"initialize"}"#.to_string(),
        };
        let inner = sender.sign_event(inner_template).await.unwrap();

        let outer = encrypt_gift_wrap(&inner, &recipient.get_public_key(), false, 1_700_000_001)
            .await
            .unwrap();
        assert_eq!(outer.kind, KIND_GIFT_WRAP_PERSISTENT);
        assert_ne!(outer.pubkey, sender.get_public_key());

        let unsealed = decrypt_gift_wrap(&outer, &recipient).await.unwrap();
        assert_eq!(unsealed.id, inner.id);
        assert_eq!(unsealed.content, inner.content);
    }

    #[test]
    fn event_content_to_mcp_rejects_oversize() {
        let ev = Event {
            id: "id".into(),
            pubkey: "pk".into(),
            created_at: 0,
            kind: super::super::KIND_APPLICATION_MESSAGE,
            tags: vec![],
            content: "x".repeat(100),
            sig: String::new(),
        };
        let err = event_content_to_mcp(&ev, 10).unwrap_err();
        assert!(matches!(err, BridgeError::OversizeMessage { .. }));
    }
}
