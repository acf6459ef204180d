//! WebSocket endpoint speaking the relay protocol.

use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::{
    broadcast::{Broadcaster, Mailboxes},
    config::PolicyHandle,
    index::SubscriptionIndex,
    session::Session,
    store::Store,
};

/// Outbound frame queue depth per connection.
const OUTBOUND_CAP: usize = 256;
/// Delay before the first keep-alive ping.
const PING_INITIAL: Duration = Duration::from_secs(30);
/// Interval between subsequent pings.
const PING_INTERVAL: Duration = Duration::from_secs(50);

/// Shared handles every connection needs.
#[derive(Clone)]
pub struct RelayState {
    pub store: Store,
    pub index: Arc<SubscriptionIndex>,
    pub mailboxes: Arc<Mailboxes>,
    pub broadcaster: Broadcaster,
    pub policy: PolicyHandle,
}

impl RelayState {
    /// Wire up the shared pieces and start the fan-out task.
    pub fn new(store: Store, policy: PolicyHandle) -> Self {
        let index = Arc::new(SubscriptionIndex::new());
        let mailboxes = Arc::new(Mailboxes::new());
        let broadcaster = Broadcaster::spawn(Arc::clone(&index), Arc::clone(&mailboxes));
        RelayState {
            store,
            index,
            mailboxes,
            broadcaster,
            policy,
        }
    }
}

/// Start the WebSocket server.
pub async fn serve_ws(
    addr: SocketAddr,
    state: RelayState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let app = Router::new().route("/", get(handler)).with_state(state);
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Handle the HTTP upgrade and spawn the connection processor.
async fn handler(ws: WebSocketUpgrade, State(state): State<RelayState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| async move { process(socket, state).await })
}

/// Drive one connection: inbound frames and live deliveries feed the
/// session; a writer task owns the sink so slow sockets never stall the
/// broadcast path.
async fn process(socket: WebSocket, state: RelayState) {
    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<String>(OUTBOUND_CAP);
    let (conn_id, mut mailbox) = state.mailboxes.join();
    let mut session = Session::new(
        conn_id,
        state.store.clone(),
        Arc::clone(&state.index),
        Arc::clone(&state.mailboxes),
        state.broadcaster.clone(),
        state.policy.clone(),
        out_tx,
    );
    info!(conn_id, "connection open");

    let writer = tokio::spawn(async move {
        let mut ping = tokio::time::interval_at(
            tokio::time::Instant::now() + PING_INITIAL,
            PING_INTERVAL,
        );
        loop {
            tokio::select! {
                frame = out_rx.recv() => match frame {
                    Some(text) => {
                        if sink.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = ping.tick() => {
                    if sink.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // The mailbox is polled only between inbound frames, so a REQ's replay
    // and EOSE are queued before any live event for it.
    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => session.handle_frame(&text).await,
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(conn_id, "socket error: {e}");
                    break;
                }
            },
            delivery = mailbox.recv() => match delivery {
                Some(ev) => session.handle_live(&ev).await,
                None => break,
            },
        }
    }

    drop(session);
    writer.abort();
    info!(conn_id, "connection closed");
}
