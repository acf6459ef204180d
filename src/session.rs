//! Per-connection protocol state machine.
//!
//! One `Session` exists per WebSocket connection and is driven only by its
//! owning task: inbound frames and live-delivery mailbox items are handed to
//! it in sequence, so the state here needs no locking.

use std::{collections::HashMap, sync::Arc};

use rand::RngCore;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, trace};

use crate::{
    broadcast::{Broadcaster, Mailboxes},
    config::PolicyHandle,
    event::{Event, KindClass},
    filter::{self, Filter},
    index::{ConnId, SubscriptionIndex},
    store::Store,
    validate,
};

/// Relay-to-client message shapes (NIP-01 / NIP-42).
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum RelayMessage {
    Event((&'static str, String, Event)),
    Ok((&'static str, String, bool, String)),
    Eose((&'static str, String)),
    Notice((&'static str, String)),
    Auth((&'static str, String)),
}

impl RelayMessage {
    pub fn event(sub_id: impl Into<String>, ev: Event) -> Self {
        RelayMessage::Event(("EVENT", sub_id.into(), ev))
    }

    pub fn ok(event_id: impl Into<String>, accepted: bool, message: impl Into<String>) -> Self {
        RelayMessage::Ok(("OK", event_id.into(), accepted, message.into()))
    }

    pub fn eose(sub_id: impl Into<String>) -> Self {
        RelayMessage::Eose(("EOSE", sub_id.into()))
    }

    pub fn notice(message: impl Into<String>) -> Self {
        RelayMessage::Notice(("NOTICE", message.into()))
    }

    pub fn auth(challenge: impl Into<String>) -> Self {
        RelayMessage::Auth(("AUTH", challenge.into()))
    }

    fn json(&self) -> String {
        serde_json::to_string(self).expect("relay message serializes")
    }
}

/// State machine for one client connection.
pub struct Session {
    conn_id: ConnId,
    store: Store,
    index: Arc<SubscriptionIndex>,
    mailboxes: Arc<Mailboxes>,
    broadcaster: Broadcaster,
    policy: PolicyHandle,
    outbound: mpsc::Sender<String>,
    subscriptions: HashMap<String, Vec<Filter>>,
    challenge: Option<String>,
    authed_pubkey: Option<String>,
}

impl Session {
    pub fn new(
        conn_id: ConnId,
        store: Store,
        index: Arc<SubscriptionIndex>,
        mailboxes: Arc<Mailboxes>,
        broadcaster: Broadcaster,
        policy: PolicyHandle,
        outbound: mpsc::Sender<String>,
    ) -> Self {
        Session {
            conn_id,
            store,
            index,
            mailboxes,
            broadcaster,
            policy,
            outbound,
            subscriptions: HashMap::new(),
            challenge: None,
            authed_pubkey: None,
        }
    }

    /// Dispatch one inbound text frame.
    pub async fn handle_frame(&mut self, text: &str) {
        trace!(conn = self.conn_id, frame = text, "received");
        let Ok(value) = serde_json::from_str::<Value>(text) else {
            return self.invalid().await;
        };
        let Some(arr) = value.as_array() else {
            return self.invalid().await;
        };
        match arr.first().and_then(|v| v.as_str()) {
            Some("EVENT") if arr.len() >= 2 => self.handle_event(&arr[1]).await,
            Some("REQ") if arr.len() >= 3 => self.handle_req(&arr[1], &arr[2..]).await,
            Some("CLOSE") if arr.len() >= 2 => self.handle_close(&arr[1]).await,
            Some("AUTH") if arr.len() >= 2 => self.handle_auth(&arr[1]).await,
            _ => self.invalid().await,
        }
    }

    /// Re-match a broadcast event against the local subscription table and
    /// emit it on every matching subscription. The author-group index is
    /// coarse, so this check is what enforces the full filters.
    pub async fn handle_live(&self, ev: &Arc<Event>) {
        for (sub_id, filters) in &self.subscriptions {
            if filter::match_any(filters, ev) {
                self.send(RelayMessage::event(sub_id.clone(), (**ev).clone()))
                    .await;
            }
        }
    }

    /// Release everything this connection holds outside its own task.
    /// Idempotent; also runs from `Drop` so a panicking handler still
    /// cleans up.
    pub fn teardown(&self) {
        self.mailboxes.leave(self.conn_id);
        self.index.unregister_all(self.conn_id);
    }

    async fn handle_event(&mut self, raw: &Value) {
        let ev = match validate::validate(raw) {
            Ok(ev) => ev,
            Err(e) => {
                let id = raw
                    .get("id")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                debug!(conn = self.conn_id, %e, "rejected event");
                return self.send(RelayMessage::ok(id, false, format!("invalid: {e}"))).await;
            }
        };
        let policy = self.policy.snapshot();
        if policy.auth_required && self.authed_pubkey.is_none() {
            return self.issue_challenge().await;
        }
        if !policy.allows(&ev.pubkey) {
            return self
                .send(RelayMessage::ok(ev.id, false, "blocked: not authorized"))
                .await;
        }
        match ev.class() {
            KindClass::Auth => {
                self.send(RelayMessage::ok(ev.id, false, "AUTH events are not stored"))
                    .await;
            }
            KindClass::Ephemeral => {
                let id = ev.id.clone();
                self.send(RelayMessage::ok(id, true, "")).await;
                self.broadcaster.publish(Arc::new(ev), self.conn_id);
            }
            _ => match self.store.put(&ev) {
                Ok(()) => {
                    let id = ev.id.clone();
                    self.send(RelayMessage::ok(id, true, "")).await;
                    self.broadcaster.publish(Arc::new(ev), self.conn_id);
                }
                Err(e) => {
                    error!(conn = self.conn_id, event = %ev.id, %e, "store put failed");
                    self.send(RelayMessage::ok(ev.id, false, "Something went wrong"))
                        .await;
                }
            },
        }
    }

    async fn handle_req(&mut self, sub_value: &Value, filter_values: &[Value]) {
        let Some(sub_id) = sub_value.as_str().filter(|s| !s.is_empty()) else {
            return self.invalid().await;
        };
        let policy = self.policy.snapshot();
        if policy.auth_required && self.authed_pubkey.is_none() {
            return self.issue_challenge().await;
        }
        let mut filters = Vec::with_capacity(filter_values.len());
        for value in filter_values {
            match Filter::from_value(value) {
                Some(f) => filters.push(f),
                None => return self.invalid().await,
            }
        }
        if !filters.iter().all(|f| f.has_authors()) {
            return self
                .send(RelayMessage::notice(
                    "rejected: this relay requires an 'authors' filter for all subscriptions",
                ))
                .await;
        }
        debug!(conn = self.conn_id, sub_id, filters = filters.len(), "subscribe");
        // Register before the historical query: a concurrent broadcast can
        // only land in the mailbox, which is drained between frames, so
        // replay and EOSE always go out first.
        self.index.register(self.conn_id, sub_id, &filters);
        self.subscriptions
            .insert(sub_id.to_string(), filters.clone());
        for ev in self.store.query(&filters) {
            self.send(RelayMessage::event(sub_id, ev)).await;
        }
        self.send(RelayMessage::eose(sub_id)).await;
    }

    async fn handle_close(&mut self, sub_value: &Value) {
        let Some(sub_id) = sub_value.as_str() else {
            return self.invalid().await;
        };
        self.subscriptions.remove(sub_id);
        self.index.unregister(self.conn_id, sub_id);
        debug!(conn = self.conn_id, sub_id, "unsubscribe");
        self.send(RelayMessage::notice(format!("Closed sub_id: `{sub_id}`")))
            .await;
    }

    async fn handle_auth(&mut self, raw: &Value) {
        let reply_id = raw
            .get("id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        if let Ok(ev) = validate::validate(raw) {
            if self.accept_auth(&ev) {
                debug!(conn = self.conn_id, pubkey = %ev.pubkey, "authenticated");
                self.authed_pubkey = Some(ev.pubkey);
                self.challenge = None;
                return self.send(RelayMessage::ok(reply_id, true, "")).await;
            }
        }
        self.send(RelayMessage::ok(
            reply_id,
            false,
            "invalid: auth event validation failed",
        ))
        .await;
    }

    /// NIP-42 acceptance: right kind, allow-listed author, echo of the
    /// outstanding challenge, and a relay tag.
    fn accept_auth(&self, ev: &Event) -> bool {
        if ev.class() != KindClass::Auth {
            return false;
        }
        if !self.policy.snapshot().allows(&ev.pubkey) {
            return false;
        }
        let Some(challenge) = self.challenge.as_deref() else {
            return false;
        };
        let echoed = ev
            .tags
            .iter()
            .any(|t| t.name() == Some("challenge") && t.value() == Some(challenge));
        let has_relay = ev
            .tags
            .iter()
            .any(|t| t.name() == Some("relay") && t.value().is_some());
        echoed && has_relay
    }

    /// Issue a fresh 16-byte challenge, replacing any outstanding one.
    async fn issue_challenge(&mut self) {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        let challenge = hex::encode(bytes);
        self.challenge = Some(challenge.clone());
        self.send(RelayMessage::auth(challenge)).await;
    }

    async fn invalid(&self) {
        self.send(RelayMessage::notice("Invalid message")).await;
    }

    async fn send(&self, msg: RelayMessage) {
        // a closed outbound queue means the socket is going away; the read
        // loop observes that on its own
        let _ = self.outbound.send(msg.json()).await;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.teardown();
    }
}
