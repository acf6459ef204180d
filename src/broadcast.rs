//! Event fan-out: a single broadcast queue feeding per-session mailboxes.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::trace;

use crate::{event::Event, index::{ConnId, SubscriptionIndex}};

/// Live-delivery mailbox capacity per session. Overflow drops the event for
/// that session rather than slowing the broadcast queue.
const MAILBOX_CAP: usize = 64;

/// Registry of live session mailboxes, keyed by connection id.
#[derive(Default)]
pub struct Mailboxes {
    senders: DashMap<ConnId, mpsc::Sender<Arc<Event>>>,
    next_id: AtomicU64,
}

impl Mailboxes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a connection id and its mailbox.
    pub fn join(&self) -> (ConnId, mpsc::Receiver<Arc<Event>>) {
        let conn = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(MAILBOX_CAP);
        self.senders.insert(conn, tx);
        (conn, rx)
    }

    /// Remove a session's mailbox; deliveries to it become drops.
    pub fn leave(&self, conn: ConnId) {
        self.senders.remove(&conn);
    }

    /// Best-effort, non-blocking delivery. Full or departed mailboxes drop
    /// the event silently.
    fn deliver(&self, conn: ConnId, ev: &Arc<Event>) {
        if let Some(tx) = self.senders.get(&conn) {
            if tx.try_send(Arc::clone(ev)).is_err() {
                trace!(conn, event = %ev.id, "mailbox full or closing, dropped");
            }
        }
    }
}

/// Handle onto the fan-out queue.
#[derive(Clone)]
pub struct Broadcaster {
    queue: mpsc::UnboundedSender<(Arc<Event>, ConnId)>,
}

impl Broadcaster {
    /// Spawn the fan-out task. Events published here are matched against the
    /// subscription index and handed to every candidate mailbox except the
    /// publisher's own.
    pub fn spawn(index: Arc<SubscriptionIndex>, mailboxes: Arc<Mailboxes>) -> Self {
        let (queue, mut rx) = mpsc::unbounded_channel::<(Arc<Event>, ConnId)>();
        tokio::spawn(async move {
            while let Some((ev, origin)) = rx.recv().await {
                for conn in index.candidates(&ev.pubkey) {
                    if conn == origin {
                        continue;
                    }
                    mailboxes.deliver(conn, &ev);
                }
            }
        });
        Broadcaster { queue }
    }

    /// Enqueue an accepted event for fan-out. Never blocks the caller.
    pub fn publish(&self, ev: Arc<Event>, origin: ConnId) {
        let _ = self.queue.send((ev, origin));
    }
}
