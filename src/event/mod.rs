//! Signed event envelope (§3, §6) and the kind constants the core relies on.
//!
//! The numeric kind values are an external constant fixed by the Nostr
//! ecosystem (§6); they are not invented here, they are the values the
//! `nostr` crate and every relay on the network already agree on.

pub mod codec;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Application-level JSON-RPC message, gift-wrapped or sent in the clear.
pub const KIND_APPLICATION_MESSAGE: u16 = 25_910;
/// Server profile announcement.
pub const KIND_SERVER_ANNOUNCEMENT: u16 = 31_316;
pub const KIND_TOOLS_LIST: u16 = 31_317;
pub const KIND_RESOURCES_LIST: u16 = 31_318;
pub const KIND_RESOURCE_TEMPLATES_LIST: u16 = 31_319;
pub const KIND_PROMPTS_LIST: u16 = 31_320;
/// Persistent gift-wrap (NIP-59 style, kind 1059): long-lived, replayable.
pub const KIND_GIFT_WRAP_PERSISTENT: u16 = 1_059;
/// Ephemeral gift-wrap: short-lived variant servers may advertise support for.
pub const KIND_GIFT_WRAP_EPHEMERAL: u16 = 21_059;
pub const KIND_WALLET_INFO: u16 = 13_194;
pub const KIND_WALLET_REQUEST: u16 = 23_194;
pub const KIND_WALLET_RESPONSE: u16 = 23_195;
pub const KIND_WALLET_NOTIFICATION: u16 = 23_196;
pub const KIND_WALLET_NOTIFICATION_LEGACY: u16 = 23_197;
pub const KIND_ZAP_REQUEST: u16 = 9_734;
pub const KIND_ZAP_RECEIPT: u16 = 9_735;
pub const KIND_DELETION: u16 = 5;

/// All kinds a client/server transport subscribes for (§4.C, §4.V `start()`).
pub const INBOUND_KINDS: [u16; 3] = [
    KIND_APPLICATION_MESSAGE,
    KIND_GIFT_WRAP_PERSISTENT,
    KIND_GIFT_WRAP_EPHEMERAL,
];

pub fn is_gift_wrap_kind(kind: u16) -> bool {
    kind == KIND_GIFT_WRAP_PERSISTENT || kind == KIND_GIFT_WRAP_EPHEMERAL
}

pub fn is_capability_list_kind(kind: u16) -> bool {
    matches!(
        kind,
        KIND_TOOLS_LIST | KIND_RESOURCES_LIST | KIND_RESOURCE_TEMPLATES_LIST | KIND_PROMPTS_LIST
    )
}

/// An ordered tag: first element is the tag name (§3).
pub type Tag = Vec<String>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub pubkey: String,
    pub created_at: i64,
    pub kind: u16,
    pub tags: Vec<Tag>,
    pub content: String,
    pub sig: String,
}

/// An event before signing: everything but `id` and `sig`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnsignedEvent {
    pub pubkey: String,
    pub created_at: i64,
    pub kind: u16,
    pub tags: Vec<Tag>,
    pub content: String,
}

impl UnsignedEvent {
    /// The canonical serialization form events are hashed over:
    /// `[0, pubkey, created_at, kind, tags, content]`, matching NIP-01.
    pub fn canonical_json(&self) -> String {
        let arr = serde_json::json!([
            0,
            self.pubkey,
            self.created_at,
            self.kind,
            self.tags,
            self.content,
        ]);
        // `serde_json` preserves key insertion order for objects, but this is
        // a homogeneous array so no ordering ambiguity arises from map keys.
        arr.to_string()
    }

    pub fn id_hex(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.canonical_json().as_bytes());
        hex::encode(hasher.finalize())
    }
}

impl Event {
    pub fn find_tag<'a>(&'a self, name: &str) -> Option<&'a Tag> {
        self.tags.iter().find(|t| t.first().map(String::as_str) == Some(name))
    }

    pub fn find_tag_value(&self, name: &str) -> Option<&str> {
        self.find_tag(name).and_then(|t| t.get(1)).map(String::as_str)
    }

    /// The `e`-tag target, used throughout for correlation (§3, §4).
    pub fn correlated_event_id(&self) -> Option<&str> {
        self.find_tag_value("e")
    }

    pub fn recipient_pubkey(&self) -> Option<&str> {
        self.find_tag_value("p")
    }

    /// Ordered `pmi` tag values (PMI preference list, §6).
    pub fn pmi_preferences(&self) -> Vec<String> {
        self.tags
            .iter()
            .filter(|t| t.first().map(String::as_str) == Some("pmi"))
            .filter_map(|t| t.get(1).cloned())
            .collect()
    }
}

pub fn tag(name: &str, value: impl Into<String>) -> Tag {
    vec![name.to_string(), value.into()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gift_wrap_kinds_are_classified() {
        assert!(is_gift_wrap_kind(KIND_GIFT_WRAP_PERSISTENT));
        assert!(is_gift_wrap_kind(KIND_GIFT_WRAP_EPHEMERAL));
        assert!(!is_gift_wrap_kind(KIND_APPLICATION_MESSAGE));
    }

    #[test]
    fn capability_list_kinds_are_classified() {
        assert!(is_capability_list_kind(KIND_TOOLS_LIST));
        assert!(!is_capability_list_kind(KIND_WALLET_REQUEST));
    }

    #[test]
    fn unsigned_event_id_is_deterministic() {
        let ev = UnsignedEvent {
            pubkey: "aa".repeat(32),
            created_at: 1_700_000_000,
            kind: KIND_APPLICATION_MESSAGE,
            tags: vec![tag("p", "bb".repeat(32))],
            content: "{}".to_string(),
        };
        let id1 = ev.id_hex();
        let id2 = ev.id_hex();
        assert_eq!(id1, id2);
        assert_eq!(id1.len(), 64);
    }

    #[test]
    fn find_tag_reads_correlation_and_recipient() {
        let ev = Event {
            id: "id".into(),
            pubkey: "pk".into(),
            created_at: 0,
            kind: KIND_APPLICATION_MESSAGE,
            tags: vec![tag("p", "server"), tag("e", "req-1"), tag("pmi", "A"), tag("pmi", "B")],
            content: String::new(),
            sig: String::new(),
        };
        assert_eq!(ev.recipient_pubkey(), Some("server"));
        assert_eq!(ev.correlated_event_id(), Some("req-1"));
        assert_eq!(ev.pmi_preferences(), vec!["A".to_string(), "B".to_string()]);
    }
}
