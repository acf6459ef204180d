//! Nostr event model, canonical hashing, and kind classification.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Kind number reserved for NIP-42 authentication events.
pub const AUTH_KIND: u32 = 22242;

/// Simple tag wrapper preserving tag fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tag(pub Vec<String>);

impl Tag {
    /// Tag name, i.e. the first field.
    pub fn name(&self) -> Option<&str> {
        self.0.first().map(|s| s.as_str())
    }

    /// Tag value, i.e. the second field.
    pub fn value(&self) -> Option<&str> {
        self.0.get(1).map(|s| s.as_str())
    }
}

/// Core Nostr event persisted in the store and served to clients.
///
/// Field order matches the wire shape clients expect.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Event identifier (hex of SHA-256 over the canonical serialization).
    pub id: String,
    /// Author public key (x-only, hex).
    pub pubkey: String,
    /// Unix timestamp of creation.
    pub created_at: i64,
    /// Kind number, e.g. `1` or `30023`.
    pub kind: u32,
    /// Arbitrary tags.
    pub tags: Vec<Tag>,
    /// Event content body.
    pub content: String,
    /// Schnorr signature over the event hash.
    pub sig: String,
}

/// Storage class derived from an event's kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindClass {
    /// Append and keep all copies.
    Regular,
    /// Keep only the latest per `(pubkey, kind)`.
    Replaceable,
    /// Broadcast only, never stored.
    Ephemeral,
    /// Keep only the latest per `(pubkey, kind, d-tag)`.
    ParamReplaceable,
    /// Kind 22242, consumed by the session and never stored.
    Auth,
}

impl KindClass {
    /// Classify a kind number. Unknown kinds are treated as regular.
    pub fn of(kind: u32) -> Self {
        match kind {
            AUTH_KIND => KindClass::Auth,
            0 | 3 => KindClass::Replaceable,
            10_000..=19_999 => KindClass::Replaceable,
            20_000..=29_999 => KindClass::Ephemeral,
            30_000..=39_999 => KindClass::ParamReplaceable,
            _ => KindClass::Regular,
        }
    }
}

impl Event {
    /// Storage class of this event.
    pub fn class(&self) -> KindClass {
        KindClass::of(self.kind)
    }

    /// Value of the first `d` tag, or the empty string if absent.
    pub fn d_tag(&self) -> &str {
        self.tags
            .iter()
            .find(|t| t.name() == Some("d"))
            .and_then(|t| t.value())
            .unwrap_or("")
    }

    /// Whether this event replaces `other` under replace-by-latest rules:
    /// higher `created_at` wins, ties go to the lexicographically greater id.
    pub fn supersedes(&self, other: &Event) -> bool {
        self.created_at > other.created_at
            || (self.created_at == other.created_at && self.id > other.id)
    }
}

/// Recompute the Nostr event hash from its fields.
///
/// The canonical form is the JSON array `[0, pubkey, created_at, kind, tags,
/// content]` as emitted by serde_json's compact encoder: no insignificant
/// whitespace, integers without a decimal point, `/` unescaped, non-ASCII
/// passed through as UTF-8.
pub fn event_hash(ev: &Event) -> Result<[u8; 32], serde_json::Error> {
    let arr = serde_json::json!([0, ev.pubkey, ev.created_at, ev.kind, ev.tags, ev.content]);
    let data = serde_json::to_vec(&arr)?;
    let hash = Sha256::digest(&data);
    Ok(hash.into())
}
