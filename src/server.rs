//! HTTP endpoints for health checks and the relay information document.

use anyhow::Result;
use axum::{extract::State, http::header, routing::get, Json, Router};
use serde::{Deserialize, Serialize};
use std::{future::Future, net::SocketAddr};

use crate::config::PolicyHandle;

#[derive(Serialize, Deserialize)]
struct Health {
    status: String,
}

/// Start an HTTP server exposing `/healthz` and the relay info document.
pub async fn serve_http(
    addr: SocketAddr,
    policy: PolicyHandle,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let app = Router::new()
        .route("/", get(relay_info))
        .route("/healthz", get(healthz))
        .with_state(policy);
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Health check endpoint.
async fn healthz() -> Json<Health> {
    Json(Health {
        status: "ok".to_string(),
    })
}

#[derive(Serialize, Deserialize)]
struct RelayInfoDoc {
    name: String,
    description: String,
    pubkey: String,
    contact: String,
    software: String,
    version: String,
    supported_nips: Vec<u32>,
}

/// NIP-11 relay information document, served from the current policy.
async fn relay_info(State(policy): State<PolicyHandle>) -> impl axum::response::IntoResponse {
    let snapshot = policy.snapshot();
    (
        [(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")],
        Json(RelayInfoDoc {
            name: snapshot.info.name.clone(),
            description: snapshot.info.description.clone(),
            pubkey: snapshot.info.pubkey.clone(),
            contact: snapshot.info.contact.clone(),
            software: "strond".into(),
            version: env!("CARGO_PKG_VERSION").into(),
            supported_nips: vec![1, 11, 42],
        }),
    )
}
