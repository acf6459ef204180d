//! In-memory indexed event store with an append-only ndjson journal.
//!
//! All mutation goes through a single lock, so puts are atomic with respect
//! to concurrent queries. Accepted events are appended to
//! `<root>/log/events.ndjson` before the in-memory state changes; replaying
//! the journal through the same kind-policy puts reproduces the store.

use std::{
    collections::{HashMap, HashSet},
    fs,
    io::{BufRead, BufReader, Write},
    path::PathBuf,
    sync::{Arc, Mutex},
};

use rand::{seq::SliceRandom, thread_rng};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    event::{Event, KindClass},
    filter::Filter,
    validate::{verify_event, ValidationError},
};

/// Failures surfaced by store transactions.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("journal io: {0}")]
    Io(#[from] std::io::Error),
    #[error("journal encoding: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("event {0} failed verification: {1}")]
    Corrupt(String, ValidationError),
}

/// Shared handle to the event store.
#[derive(Clone)]
pub struct Store {
    inner: Arc<Mutex<Inner>>,
}

struct Inner {
    root: PathBuf,
    journal: fs::File,
    by_id: HashMap<String, Event>,
    by_author: HashMap<String, HashSet<String>>,
    replaceable: HashMap<(String, u32), String>,
    parameterized: HashMap<(String, u32, String), String>,
}

impl Store {
    /// Open a store rooted at `root`, replaying any existing journal.
    pub fn open(root: PathBuf) -> Result<Self, StoreError> {
        fs::create_dir_all(root.join("log"))?;
        let path = journal_path(&root);
        let mut inner = Inner {
            root,
            journal: open_append(&path)?,
            by_id: HashMap::new(),
            by_author: HashMap::new(),
            replaceable: HashMap::new(),
            parameterized: HashMap::new(),
        };
        if path.exists() {
            let reader = BufReader::new(fs::File::open(&path)?);
            let mut replayed = 0usize;
            for line in reader.lines() {
                let line = line?;
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<Event>(&line) {
                    Ok(ev) => {
                        inner.apply(&ev);
                        replayed += 1;
                    }
                    Err(e) => warn!("skipping unreadable journal line: {e}"),
                }
            }
            if replayed > 0 {
                debug!(replayed, live = inner.by_id.len(), "journal replayed");
            }
        }
        Ok(Store {
            inner: Arc::new(Mutex::new(inner)),
        })
    }

    /// Store an event according to its kind class. Ephemeral and
    /// authentication kinds are never persisted and pass through as no-ops.
    pub fn put(&self, ev: &Event) -> Result<(), StoreError> {
        match ev.class() {
            KindClass::Regular => self.put_regular(ev),
            KindClass::Replaceable => self.put_replaceable(ev),
            KindClass::ParamReplaceable => self.put_parameterized(ev),
            KindClass::Ephemeral | KindClass::Auth => Ok(()),
        }
    }

    /// Insert a regular event; a duplicate id is an accepting no-op.
    pub fn put_regular(&self, ev: &Event) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if inner.by_id.contains_key(&ev.id) {
            return Ok(());
        }
        inner.append_journal(ev)?;
        inner.insert(ev.clone());
        Ok(())
    }

    /// Keep only the latest event per `(pubkey, kind)`.
    pub fn put_replaceable(&self, ev: &Event) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let key = (ev.pubkey.clone(), ev.kind);
        if let Some(old_id) = inner.replaceable.get(&key) {
            if !ev.supersedes(&inner.by_id[old_id]) {
                return Ok(());
            }
        }
        // newer than the incumbent, or first of its key
        inner.append_journal(ev)?;
        if let Some(old_id) = inner.replaceable.remove(&key) {
            inner.remove(&old_id);
        }
        inner.replaceable.insert(key, ev.id.clone());
        inner.insert(ev.clone());
        Ok(())
    }

    /// Keep only the latest event per `(pubkey, kind, d-tag)`.
    pub fn put_parameterized(&self, ev: &Event) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let key = (ev.pubkey.clone(), ev.kind, ev.d_tag().to_string());
        if let Some(old_id) = inner.parameterized.get(&key) {
            if !ev.supersedes(&inner.by_id[old_id]) {
                return Ok(());
            }
        }
        inner.append_journal(ev)?;
        if let Some(old_id) = inner.parameterized.remove(&key) {
            inner.remove(&old_id);
        }
        inner.parameterized.insert(key, ev.id.clone());
        inner.insert(ev.clone());
        Ok(())
    }

    /// Collect events matching any filter, deduplicated by id, sorted by
    /// `(created_at desc, id desc)`, truncated to the smallest `limit`
    /// present across the filter list.
    pub fn query(&self, filters: &[Filter]) -> Vec<Event> {
        let inner = self.lock();
        let mut hits: HashMap<&str, &Event> = HashMap::new();
        for filter in filters {
            for ev in inner.candidates(filter) {
                if filter.matches(ev) {
                    hits.insert(ev.id.as_str(), ev);
                }
            }
        }
        let mut events: Vec<Event> = hits.into_values().cloned().collect();
        events.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        if let Some(limit) = filters.iter().filter_map(|f| f.limit).min() {
            events.truncate(limit);
        }
        events
    }

    /// Number of live events.
    pub fn len(&self) -> usize {
        self.lock().by_id.len()
    }

    /// Re-verify id hashes and signatures for a random sample of stored
    /// events; returns how many were checked.
    pub fn verify_sample(&self, sample: usize) -> Result<usize, StoreError> {
        let events: Vec<Event> = {
            let inner = self.lock();
            let mut all: Vec<Event> = inner.by_id.values().cloned().collect();
            all.shuffle(&mut thread_rng());
            all.truncate(sample);
            all
        };
        for ev in &events {
            verify_event(ev).map_err(|e| StoreError::Corrupt(ev.id.clone(), e))?;
        }
        Ok(events.len())
    }

    /// Rewrite the journal keeping only live events, atomically.
    pub fn compact(&self) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let log_dir = inner.root.join("log");
        let tmp = tempfile::NamedTempFile::new_in(&log_dir)?;
        {
            let mut w = tmp.as_file();
            let mut events: Vec<&Event> = inner.by_id.values().collect();
            events.sort_by(|a, b| {
                a.created_at
                    .cmp(&b.created_at)
                    .then_with(|| a.id.cmp(&b.id))
            });
            for ev in events {
                serde_json::to_writer(&mut w, ev)?;
                w.write_all(b"\n")?;
            }
        }
        let path = journal_path(&inner.root);
        tmp.persist(&path).map_err(|e| e.error)?;
        inner.journal = open_append(&path)?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // a poisoned lock means a panic mid-transaction; propagating the
        // poison here would take every session down with it
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Inner {
    /// Apply an event to in-memory state under the kind policy, without
    /// touching the journal. Used for replay.
    fn apply(&mut self, ev: &Event) {
        match ev.class() {
            KindClass::Regular => {
                if !self.by_id.contains_key(&ev.id) {
                    self.insert(ev.clone());
                }
            }
            KindClass::Replaceable => {
                let key = (ev.pubkey.clone(), ev.kind);
                if let Some(old_id) = self.replaceable.get(&key) {
                    if !ev.supersedes(&self.by_id[old_id]) {
                        return;
                    }
                }
                if let Some(old_id) = self.replaceable.remove(&key) {
                    self.remove(&old_id);
                }
                self.replaceable.insert(key, ev.id.clone());
                self.insert(ev.clone());
            }
            KindClass::ParamReplaceable => {
                let key = (ev.pubkey.clone(), ev.kind, ev.d_tag().to_string());
                if let Some(old_id) = self.parameterized.get(&key) {
                    if !ev.supersedes(&self.by_id[old_id]) {
                        return;
                    }
                }
                if let Some(old_id) = self.parameterized.remove(&key) {
                    self.remove(&old_id);
                }
                self.parameterized.insert(key, ev.id.clone());
                self.insert(ev.clone());
            }
            KindClass::Ephemeral | KindClass::Auth => {}
        }
    }

    fn insert(&mut self, ev: Event) {
        self.by_author
            .entry(ev.pubkey.clone())
            .or_default()
            .insert(ev.id.clone());
        self.by_id.insert(ev.id.clone(), ev);
    }

    fn remove(&mut self, id: &str) {
        if let Some(ev) = self.by_id.remove(id) {
            if let Some(ids) = self.by_author.get_mut(&ev.pubkey) {
                ids.remove(id);
                if ids.is_empty() {
                    self.by_author.remove(&ev.pubkey);
                }
            }
        }
    }

    /// Candidate events for one filter: id lookups first, then the
    /// author-restricted set, falling back to a full scan only when the
    /// filter names neither.
    fn candidates(&self, filter: &Filter) -> Vec<&Event> {
        if let Some(ids) = &filter.ids {
            return ids.iter().filter_map(|id| self.by_id.get(id)).collect();
        }
        if let Some(authors) = &filter.authors {
            return authors
                .iter()
                .filter_map(|a| self.by_author.get(a))
                .flatten()
                .filter_map(|id| self.by_id.get(id))
                .collect();
        }
        self.by_id.values().collect()
    }

    /// Append the event to the journal, retrying once on a write failure.
    fn append_journal(&mut self, ev: &Event) -> Result<(), StoreError> {
        let mut line = serde_json::to_vec(ev)?;
        line.push(b'\n');
        if let Err(first) = self.journal.write_all(&line) {
            warn!("journal append failed, retrying once: {first}");
            self.journal = open_append(&journal_path(&self.root))?;
            self.journal.write_all(&line)?;
        }
        Ok(())
    }
}

fn journal_path(root: &std::path::Path) -> PathBuf {
    root.join("log/events.ndjson")
}

fn open_append(path: &std::path::Path) -> Result<fs::File, StoreError> {
    Ok(fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?)
}
