//! Configuration loading from `.env` files and runtime relay policy.

use std::{
    collections::HashSet,
    env,
    path::PathBuf,
    sync::{Arc, RwLock},
};

use anyhow::{Context, Result};
use serde::Serialize;

/// Runtime settings derived from environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Root directory for the event journal.
    pub store_root: PathBuf,
    /// HTTP bind address, e.g. `127.0.0.1:7777`.
    pub bind_http: String,
    /// WebSocket bind address, e.g. `127.0.0.1:7778`.
    pub bind_ws: String,
    /// Require NIP-42 authentication before EVENT and REQ.
    pub auth_required: bool,
    /// Pubkeys allowed to publish and subscribe; empty means unrestricted.
    pub allowed_pubkeys: Vec<String>,
    /// Advertised relay name.
    pub info_name: String,
    /// Advertised relay description.
    pub info_description: String,
    /// Operator pubkey (hex).
    pub info_pubkey: String,
    /// Operator contact URI.
    pub info_contact: String,
}

impl Settings {
    /// Load settings from the specified `.env` file.
    pub fn from_env(path: &str) -> Result<Self> {
        dotenvy::from_filename(path).context("reading env file")?;
        let store_root = PathBuf::from(env::var("STORE_ROOT")?);
        let bind_http = env::var("BIND_HTTP")?;
        let bind_ws = env::var("BIND_WS")?;
        let auth_required = env::var("AUTH_REQUIRED").unwrap_or_else(|_| "0".into()) == "1";
        let allowed_pubkeys = csv_strings(env::var("ALLOWED_PUBKEYS").unwrap_or_default());
        Ok(Self {
            store_root,
            bind_http,
            bind_ws,
            auth_required,
            allowed_pubkeys,
            info_name: env::var("INFO_NAME").unwrap_or_default(),
            info_description: env::var("INFO_DESCRIPTION").unwrap_or_default(),
            info_pubkey: env::var("INFO_PUBKEY").unwrap_or_default(),
            info_contact: env::var("INFO_CONTACT").unwrap_or_default(),
        })
    }

    /// The initial relay policy value.
    pub fn policy(&self) -> RelayPolicy {
        RelayPolicy {
            auth_required: self.auth_required,
            allowed_pubkeys: self.allowed_pubkeys.iter().cloned().collect(),
            info: RelayInfo {
                name: self.info_name.clone(),
                description: self.info_description.clone(),
                pubkey: self.info_pubkey.clone(),
                contact: self.info_contact.clone(),
            },
        }
    }
}

/// Advertised relay information (NIP-11 fields).
#[derive(Debug, Clone, Default, Serialize)]
pub struct RelayInfo {
    pub name: String,
    pub description: String,
    pub pubkey: String,
    pub contact: String,
}

/// Relay policy consulted on every protocol decision.
#[derive(Debug, Clone, Default)]
pub struct RelayPolicy {
    pub auth_required: bool,
    pub allowed_pubkeys: HashSet<String>,
    pub info: RelayInfo,
}

impl RelayPolicy {
    /// Whether `pubkey` may publish or authenticate under the allow-list.
    pub fn allows(&self, pubkey: &str) -> bool {
        self.allowed_pubkeys.is_empty() || self.allowed_pubkeys.contains(pubkey)
    }
}

/// Single-writer, many-reader cell holding the current policy.
///
/// Readers take an `Arc` snapshot so a concurrent update never tears a
/// decision; writers publish a whole new value.
#[derive(Clone, Default)]
pub struct PolicyHandle(Arc<RwLock<Arc<RelayPolicy>>>);

impl PolicyHandle {
    pub fn new(policy: RelayPolicy) -> Self {
        PolicyHandle(Arc::new(RwLock::new(Arc::new(policy))))
    }

    /// Snapshot of the current policy.
    pub fn snapshot(&self) -> Arc<RelayPolicy> {
        match self.0.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Publish a new policy; visible to the next snapshot.
    pub fn publish(&self, policy: RelayPolicy) {
        let next = Arc::new(policy);
        match self.0.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }
}

/// Split a comma-separated string into trimmed string values.
pub fn csv_strings(input: impl AsRef<str>) -> Vec<String> {
    let s = input.as_ref();
    s.split(',')
        .filter_map(|s| {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{fs, sync::Mutex};
    use tempfile::tempdir;

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
            env::remove_var(v);
        }
    }

    #[test]
    fn loads_env() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_vars();
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(
            &env_path,
            concat!(
                "STORE_ROOT=/tmp\n",
                "BIND_HTTP=127.0.0.1:8080\n",
                "BIND_WS=127.0.0.1:8081\n",
                "AUTH_REQUIRED=1\n",
                "ALLOWED_PUBKEYS=\"aa, bb\"\n",
                "INFO_NAME=\"test relay\"\n",
                "INFO_DESCRIPTION=testing\n",
                "INFO_PUBKEY=cc\n",
                "INFO_CONTACT=mailto:op@example.com\n"
            ),
        )
        .unwrap();
        let cfg = Settings::from_env(env_path.to_str().unwrap()).unwrap();
        assert_eq!(cfg.store_root, PathBuf::from("/tmp"));
        assert_eq!(cfg.bind_http, "127.0.0.1:8080");
        assert_eq!(cfg.bind_ws, "127.0.0.1:8081");
        assert!(cfg.auth_required);
        assert_eq!(cfg.allowed_pubkeys, vec!["aa", "bb"]);
        assert_eq!(cfg.info_name, "test relay");
        assert_eq!(cfg.info_contact, "mailto:op@example.com");
    }

    #[test]
    fn defaults_when_optional_absent() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_vars();
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(
            &env_path,
            concat!(
                "STORE_ROOT=/tmp\n",
                "BIND_HTTP=127.0.0.1:8080\n",
                "BIND_WS=127.0.0.1:8081\n"
            ),
        )
        .unwrap();
        let cfg = Settings::from_env(env_path.to_str().unwrap()).unwrap();
        assert!(!cfg.auth_required);
        assert!(cfg.allowed_pubkeys.is_empty());
        assert!(cfg.info_name.is_empty());
    }

    #[test]
    fn missing_required_fields_error() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_vars();
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(
            &env_path,
            concat!("BIND_HTTP=127.0.0.1:8080\n", "BIND_WS=127.0.0.1:8081\n"),
        )
        .unwrap();
        assert!(Settings::from_env(env_path.to_str().unwrap()).is_err());
    }

    #[test]
    fn empty_allow_list_allows_everyone() {
        let policy = RelayPolicy::default();
        assert!(policy.allows("anyone"));
        let restricted = RelayPolicy {
            allowed_pubkeys: ["aa".to_string()].into_iter().collect(),
            ..Default::default()
        };
        assert!(restricted.allows("aa"));
        assert!(!restricted.allows("bb"));
    }

    #[test]
    fn policy_updates_are_visible_to_next_snapshot() {
        let handle = PolicyHandle::new(RelayPolicy::default());
        let before = handle.snapshot();
        assert!(!before.auth_required);
        handle.publish(RelayPolicy {
            auth_required: true,
            ..Default::default()
        });
        assert!(handle.snapshot().auth_required);
        // the old snapshot is an unchanged consistent view
        assert!(!before.auth_required);
    }

    #[test]
    fn csv_helper() {
        assert_eq!(csv_strings("a, b , ,c"), vec!["a", "b", "c"]);
        assert!(csv_strings("").is_empty());
    }
}
