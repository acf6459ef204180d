//! Author-group subscription index.
//!
//! Answers "which connections may care about events from this author?" in
//! O(1). Membership is refcounted per `(connection, author)` so a connection
//! holding several subscriptions on the same author joins the group once and
//! leaves only when its last such subscription goes away.

use std::collections::{BTreeSet, HashSet};

use dashmap::DashMap;

use crate::filter::Filter;

/// Opaque per-connection handle, unique for the process lifetime.
pub type ConnId = u64;

/// Concurrent author -> connection-group index.
#[derive(Default)]
pub struct SubscriptionIndex {
    /// Authors each `(conn, sub_id)` registered for.
    sub_authors: DashMap<(ConnId, String), Vec<String>>,
    /// How many of a connection's subscriptions mention an author.
    refcounts: DashMap<(ConnId, String), usize>,
    /// The group queried at broadcast time.
    members: DashMap<String, HashSet<ConnId>>,
}

impl SubscriptionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscription's authors, replacing any prior registration
    /// under the same `(conn, sub_id)`.
    pub fn register(&self, conn: ConnId, sub_id: &str, filters: &[Filter]) {
        self.unregister(conn, sub_id);
        let authors: BTreeSet<String> = filters
            .iter()
            .filter_map(|f| f.authors.as_ref())
            .flatten()
            .cloned()
            .collect();
        for author in &authors {
            let mut count = self
                .refcounts
                .entry((conn, author.clone()))
                .or_insert(0);
            *count += 1;
            if *count == 1 {
                self.members
                    .entry(author.clone())
                    .or_default()
                    .insert(conn);
            }
        }
        self.sub_authors
            .insert((conn, sub_id.to_string()), authors.into_iter().collect());
    }

    /// Drop one subscription's registration. Unknown ids are a no-op.
    pub fn unregister(&self, conn: ConnId, sub_id: &str) {
        let Some((_, authors)) = self.sub_authors.remove(&(conn, sub_id.to_string())) else {
            return;
        };
        for author in authors {
            let emptied = match self.refcounts.get_mut(&(conn, author.clone())) {
                Some(mut count) => {
                    *count -= 1;
                    *count == 0
                }
                None => false,
            };
            if emptied {
                self.refcounts.remove(&(conn, author.clone()));
                if let Some(mut group) = self.members.get_mut(&author) {
                    group.remove(&conn);
                }
                self.members.remove_if(&author, |_, group| group.is_empty());
            }
        }
    }

    /// Drop every registration owned by `conn`. Safe to call repeatedly and
    /// during teardown.
    pub fn unregister_all(&self, conn: ConnId) {
        let subs: Vec<String> = self
            .sub_authors
            .iter()
            .filter(|entry| entry.key().0 == conn)
            .map(|entry| entry.key().1.clone())
            .collect();
        for sub_id in subs {
            self.unregister(conn, &sub_id);
        }
    }

    /// Snapshot of the connections subscribed to `author`.
    pub fn candidates(&self, author: &str) -> Vec<ConnId> {
        self.members
            .get(author)
            .map(|group| group.iter().copied().collect())
            .unwrap_or_default()
    }

    #[cfg(test)]
    fn refcount(&self, conn: ConnId, author: &str) -> usize {
        self.refcounts
            .get(&(conn, author.to_string()))
            .map(|c| *c)
            .unwrap_or(0)
    }

    #[cfg(test)]
    fn is_empty_for(&self, conn: ConnId) -> bool {
        !self.sub_authors.iter().any(|e| e.key().0 == conn)
            && !self.refcounts.iter().any(|e| e.key().0 == conn)
            && !self.members.iter().any(|e| e.value().contains(&conn))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn authors(list: &[&str]) -> Filter {
        Filter {
            authors: Some(list.iter().map(|s| s.to_string()).collect()),
            ..Default::default()
        }
    }

    #[test]
    fn register_joins_author_groups() {
        let index = SubscriptionIndex::new();
        index.register(1, "sub", &[authors(&["a", "b"]), authors(&["b", "c"])]);
        assert_eq!(index.candidates("a"), vec![1]);
        assert_eq!(index.candidates("c"), vec![1]);
        // duplicate author across filters counts once per subscription
        assert_eq!(index.refcount(1, "b"), 1);
        assert!(index.candidates("d").is_empty());
    }

    #[test]
    fn overlapping_subscriptions_refcount() {
        let index = SubscriptionIndex::new();
        index.register(1, "s1", &[authors(&["a"])]);
        index.register(1, "s2", &[authors(&["a", "b"])]);
        assert_eq!(index.refcount(1, "a"), 2);
        index.unregister(1, "s1");
        // still a member through s2
        assert_eq!(index.candidates("a"), vec![1]);
        index.unregister(1, "s2");
        assert!(index.candidates("a").is_empty());
        assert!(index.is_empty_for(1));
    }

    #[test]
    fn reregister_replaces_author_set() {
        let index = SubscriptionIndex::new();
        index.register(1, "sub", &[authors(&["a"])]);
        index.register(1, "sub", &[authors(&["b"])]);
        assert!(index.candidates("a").is_empty());
        assert_eq!(index.candidates("b"), vec![1]);
        assert_eq!(index.refcount(1, "a"), 0);
    }

    #[test]
    fn groups_track_multiple_connections() {
        let index = SubscriptionIndex::new();
        index.register(1, "s", &[authors(&["a"])]);
        index.register(2, "s", &[authors(&["a"])]);
        let mut group = index.candidates("a");
        group.sort();
        assert_eq!(group, vec![1, 2]);
        index.unregister_all(1);
        assert_eq!(index.candidates("a"), vec![2]);
    }

    #[test]
    fn unregister_all_is_idempotent() {
        let index = SubscriptionIndex::new();
        index.register(1, "s1", &[authors(&["a"])]);
        index.register(1, "s2", &[authors(&["a", "b"])]);
        index.unregister_all(1);
        index.unregister_all(1);
        index.unregister(1, "s1");
        assert!(index.is_empty_for(1));
    }

    #[test]
    fn unknown_unregister_is_noop() {
        let index = SubscriptionIndex::new();
        index.unregister(9, "missing");
        assert!(index.is_empty_for(9));
    }

    #[test]
    fn concurrent_churn_settles_clean() {
        use std::sync::Arc;

        let index = Arc::new(SubscriptionIndex::new());
        let mut handles = vec![];
        for conn in 0..8u64 {
            let index = Arc::clone(&index);
            handles.push(std::thread::spawn(move || {
                for round in 0..200 {
                    let sub = format!("s{}", round % 3);
                    index.register(conn, &sub, &[authors(&["a", "b"])]);
                    if round % 2 == 0 {
                        index.unregister(conn, &sub);
                    }
                }
                index.unregister_all(conn);
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        for conn in 0..8u64 {
            assert!(index.is_empty_for(conn), "conn {conn} left residue");
        }
        assert!(index.candidates("a").is_empty());
        assert!(index.candidates("b").is_empty());
    }
}
