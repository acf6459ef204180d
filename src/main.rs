mod broadcast;
mod config;
mod event;
mod filter;
mod index;
mod server;
mod session;
mod store;
mod validate;
mod ws;

use std::net::SocketAddr;

use clap::{Parser, Subcommand};
use tracing::{info, warn};

use config::{PolicyHandle, Settings};
use event::KindClass;
use store::Store;

/// Command line interface entry point.
#[derive(Parser)]
#[command(
    name = "strond",
    author,
    version,
    about = "Authenticated Nostr relay with live subscriptions"
)]
struct Cli {
    /// Path to the `.env` configuration file.
    #[arg(long, default_value = ".env")]
    env: String,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Supported CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Launch the WebSocket relay and the HTTP info endpoint.
    Serve,
    /// Validate and store one or more event files.
    Ingest {
        /// Paths to JSON event files to ingest.
        #[arg(required = true)]
        files: Vec<String>,
    },
    /// Re-verify a random sample of stored events.
    Verify {
        #[arg(long, default_value_t = 1000)]
        sample: usize,
    },
    /// Rewrite the event journal keeping only live events.
    Compact,
}

/// Execute the selected CLI subcommand.
async fn run(cli: Cli) -> anyhow::Result<()> {
    let cfg = Settings::from_env(&cli.env)?;
    let store = Store::open(cfg.store_root.clone())?;
    match cli.command {
        Commands::Serve => {
            let http_addr: SocketAddr = cfg.bind_http.parse()?;
            let ws_addr: SocketAddr = cfg.bind_ws.parse()?;
            let policy = PolicyHandle::new(cfg.policy());
            let state = ws::RelayState::new(store, policy.clone());
            spawn_policy_reload(cli.env.clone(), policy.clone());
            info!(%http_addr, %ws_addr, "starting relay");
            tokio::try_join!(
                server::serve_http(http_addr, policy, std::future::pending()),
                ws::serve_ws(ws_addr, state, std::future::pending())
            )?;
        }
        Commands::Ingest { files } => {
            for f in files {
                let data = std::fs::read_to_string(&f)?;
                let raw: serde_json::Value = serde_json::from_str(&data)?;
                let ev = validate::validate(&raw)
                    .map_err(|e| anyhow::anyhow!("{f}: invalid event: {e}"))?;
                match ev.class() {
                    KindClass::Ephemeral | KindClass::Auth => {
                        warn!(file = %f, kind = ev.kind, "kind is not storable, skipped");
                    }
                    _ => store.put(&ev)?,
                }
            }
            info!(live = store.len(), "ingest complete");
        }
        Commands::Verify { sample } => {
            let checked = store.verify_sample(sample)?;
            info!(checked, "verification passed");
        }
        Commands::Compact => {
            store.compact()?;
        }
    }
    Ok(())
}

/// Re-read the `.env` file and publish a fresh relay policy on SIGHUP.
fn spawn_policy_reload(env_path: String, policy: PolicyHandle) {
    tokio::spawn(async move {
        let mut hangup =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("cannot install SIGHUP handler: {e}");
                    return;
                }
            };
        while hangup.recv().await.is_some() {
            match Settings::from_env(&env_path) {
                Ok(cfg) => {
                    policy.publish(cfg.policy());
                    info!("relay policy reloaded");
                }
                Err(e) => warn!("policy reload failed: {e}"),
            }
        }
    });
}

#[cfg(not(test))]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("strond=info")),
        )
        .init();
    run(Cli::parse()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{event_hash, Event};
    use secp256k1::{Keypair, Message, Secp256k1};
    use std::{fs, sync::Mutex, time::Duration};
    use tempfile::TempDir;
    use tokio::{net::TcpListener, task};

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const VARS: &[&str] = &[
        "STORE_ROOT",
        "BIND_HTTP",
        "BIND_WS",
        "AUTH_REQUIRED",
        "ALLOWED_PUBKEYS",
        "INFO_NAME",
        "INFO_DESCRIPTION",
        "INFO_PUBKEY",
        "INFO_CONTACT",
    ];

    fn clear_vars() {
        for v in VARS {
            std::env::remove_var(v);
        }
    }

    fn write_env(dir: &TempDir, http_port: u16, ws_port: u16) -> String {
        let env_path = dir.path().join(".env");
        let content = format!(
            "STORE_ROOT={}\nBIND_HTTP=127.0.0.1:{}\nBIND_WS=127.0.0.1:{}\n",
            dir.path().to_str().unwrap(),
            http_port,
            ws_port
        );
        fs::write(&env_path, content).unwrap();
        env_path.to_str().unwrap().into()
    }

    fn signed_event() -> Event {
        let secp = Secp256k1::new();
        let kp = Keypair::from_seckey_slice(&secp, &[1u8; 32]).unwrap();
        let mut ev = Event {
            id: String::new(),
            pubkey: hex::encode(kp.x_only_public_key().0.serialize()),
            created_at: 1,
            kind: 1,
            tags: vec![],
            content: String::new(),
            sig: String::new(),
        };
        let hash = event_hash(&ev).unwrap();
        ev.id = hex::encode(hash);
        let msg = Message::from_digest_slice(&hash).unwrap();
        ev.sig = hex::encode(secp.sign_schnorr_no_aux_rand(&msg, &kp).as_ref());
        ev
    }

    #[tokio::test]
    async fn run_ingest_verify_compact() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_vars();
        let dir = TempDir::new().unwrap();
        let env_file = write_env(&dir, 0, 0);

        let ev = signed_event();
        let ev_path = dir.path().join("ev.json");
        fs::write(&ev_path, serde_json::to_string(&ev).unwrap()).unwrap();
        run(Cli {
            env: env_file.clone(),
            command: Commands::Ingest {
                files: vec![ev_path.to_str().unwrap().into()],
            },
        })
        .await
        .unwrap();

        run(Cli {
            env: env_file.clone(),
            command: Commands::Verify { sample: 10 },
        })
        .await
        .unwrap();

        run(Cli {
            env: env_file.clone(),
            command: Commands::Compact,
        })
        .await
        .unwrap();
        let journal = fs::read_to_string(dir.path().join("log/events.ndjson")).unwrap();
        assert_eq!(journal.lines().count(), 1);

        // a tampered event does not get in
        let mut bad = ev.clone();
        bad.id.replace_range(0..2, if &bad.id[0..2] == "ff" { "00" } else { "ff" });
        let bad_path = dir.path().join("bad.json");
        fs::write(&bad_path, serde_json::to_string(&bad).unwrap()).unwrap();
        let err = run(Cli {
            env: env_file,
            command: Commands::Ingest {
                files: vec![bad_path.to_str().unwrap().into()],
            },
        })
        .await
        .unwrap_err();
        assert!(err.to_string().contains("invalid event"));
    }

    #[tokio::test]
    async fn run_serve_starts_http_and_ws() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_vars();
        let dir = TempDir::new().unwrap();
        let http_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let http_port = http_listener.local_addr().unwrap().port();
        drop(http_listener);
        let ws_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let ws_port = ws_listener.local_addr().unwrap().port();
        drop(ws_listener);
        let env_file = write_env(&dir, http_port, ws_port);

        let handle = task::spawn(run(Cli {
            env: env_file,
            command: Commands::Serve,
        }));
        tokio::time::sleep(Duration::from_millis(200)).await;
        let url = format!("http://127.0.0.1:{}/healthz", http_port);
        let resp = reqwest::get(url).await.unwrap();
        assert!(resp.status().is_success());
        handle.abort();
    }
}
