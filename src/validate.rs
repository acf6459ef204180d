//! Event validation: required fields, canonical id hash, Schnorr signature.

use secp256k1::{schnorr::Signature, Message, Secp256k1, XOnlyPublicKey};
use serde_json::Value;
use thiserror::Error;

use crate::event::{event_hash, Event, Tag};

/// Why a submitted event was rejected.
///
/// The `Display` text of these variants is what clients see after the
/// `invalid: ` prefix in `OK` replies.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("missing field '{0}'")]
    MissingField(&'static str),
    #[error("malformed field '{0}'")]
    MalformedField(&'static str),
    #[error("computed event id does not match")]
    IdMismatch,
    #[error("bad signature")]
    BadSignature,
}

/// Parse and fully validate a raw event object.
///
/// Checks field presence and types, the id hash invariant, and the Schnorr
/// signature, in that order. Pure: no relay policy is applied here.
pub fn validate(raw: &Value) -> Result<Event, ValidationError> {
    let obj = raw
        .as_object()
        .ok_or(ValidationError::MalformedField("event"))?;

    let id = require_str(obj, "id")?;
    let pubkey = require_str(obj, "pubkey")?;
    let sig = require_str(obj, "sig")?;
    let created_at = obj
        .get("created_at")
        .ok_or(ValidationError::MissingField("created_at"))?
        .as_i64()
        .ok_or(ValidationError::MalformedField("created_at"))?;
    let kind = obj
        .get("kind")
        .ok_or(ValidationError::MissingField("kind"))?
        .as_u64()
        .filter(|k| *k <= 65_535)
        .ok_or(ValidationError::MalformedField("kind"))? as u32;
    let content = require_str(obj, "content")?;
    let tags = parse_tags(
        obj.get("tags")
            .ok_or(ValidationError::MissingField("tags"))?,
    )?;

    decode_hex(id, 32, "id")?;
    decode_hex(pubkey, 32, "pubkey")?;
    decode_hex(sig, 64, "sig")?;

    let ev = Event {
        id: id.to_string(),
        pubkey: pubkey.to_string(),
        created_at,
        kind,
        tags,
        content: content.to_string(),
        sig: sig.to_string(),
    };
    verify_event(&ev)?;
    Ok(ev)
}

/// Verify an already-shaped event's id hash and Schnorr signature.
pub fn verify_event(ev: &Event) -> Result<(), ValidationError> {
    let hash = event_hash(ev).map_err(|_| ValidationError::MalformedField("content"))?;
    if hex::encode(hash) != ev.id {
        return Err(ValidationError::IdMismatch);
    }
    let sig_bytes = decode_hex(&ev.sig, 64, "sig")?;
    let pk_bytes = decode_hex(&ev.pubkey, 32, "pubkey")?;
    let sig =
        Signature::from_slice(&sig_bytes).map_err(|_| ValidationError::MalformedField("sig"))?;
    let pk = XOnlyPublicKey::from_slice(&pk_bytes)
        .map_err(|_| ValidationError::MalformedField("pubkey"))?;
    let msg =
        Message::from_digest_slice(&hash).map_err(|_| ValidationError::MalformedField("id"))?;
    let secp = Secp256k1::verification_only();
    secp.verify_schnorr(&sig, &msg, &pk)
        .map_err(|_| ValidationError::BadSignature)
}

fn require_str<'a>(
    obj: &'a serde_json::Map<String, Value>,
    field: &'static str,
) -> Result<&'a str, ValidationError> {
    obj.get(field)
        .ok_or(ValidationError::MissingField(field))?
        .as_str()
        .ok_or(ValidationError::MalformedField(field))
}

fn parse_tags(raw: &Value) -> Result<Vec<Tag>, ValidationError> {
    let outer = raw
        .as_array()
        .ok_or(ValidationError::MalformedField("tags"))?;
    let mut tags = Vec::with_capacity(outer.len());
    for inner in outer {
        let fields = inner
            .as_array()
            .ok_or(ValidationError::MalformedField("tags"))?
            .iter()
            .map(|v| {
                v.as_str()
                    .map(|s| s.to_string())
                    .ok_or(ValidationError::MalformedField("tags"))
            })
            .collect::<Result<Vec<_>, _>>()?;
        tags.push(Tag(fields));
    }
    Ok(tags)
}

fn decode_hex(s: &str, len: usize, field: &'static str) -> Result<Vec<u8>, ValidationError> {
    let bytes = hex::decode(s).map_err(|_| ValidationError::MalformedField(field))?;
    if bytes.len() != len {
        return Err(ValidationError::MalformedField(field));
    }
    Ok(bytes)
}
