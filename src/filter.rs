//! Subscription filters: parsing from REQ frames and per-event matching.

use serde_json::Value;

use crate::event::Event;

/// Restrictions a subscription places on the events it wants.
///
/// Absent fields do not constrain. A filter matches an event only when every
/// present field matches.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    pub ids: Option<Vec<String>>,
    pub authors: Option<Vec<String>>,
    pub kinds: Option<Vec<u32>>,
    pub since: Option<i64>,
    pub until: Option<i64>,
    pub limit: Option<usize>,
    /// Single-letter `#X` tag filters: `(letter, accepted values)`.
    pub tags: Vec<(char, Vec<String>)>,
}

impl Filter {
    /// Build a `Filter` from a Nostr filter JSON object.
    ///
    /// Returns `None` when the value is not an object; unrecognized keys are
    /// ignored.
    pub fn from_value(val: &Value) -> Option<Self> {
        let obj = val.as_object()?;
        let ids = obj.get("ids").and_then(string_array);
        let authors = obj.get("authors").and_then(string_array);
        let kinds = obj.get("kinds").and_then(|v| v.as_array()).map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_u64().map(|u| u as u32))
                .collect()
        });
        let since = obj.get("since").and_then(|v| v.as_i64());
        let until = obj.get("until").and_then(|v| v.as_i64());
        let limit = obj
            .get("limit")
            .and_then(|v| v.as_u64())
            .map(|v| v as usize);
        // only `#` keys with a single letter after the hash are tag filters
        let mut tags = vec![];
        for (key, value) in obj {
            let mut chars = key.strip_prefix('#').unwrap_or("").chars();
            if let (Some(letter), None) = (chars.next(), chars.next()) {
                if let Some(values) = string_array(value) {
                    tags.push((letter, values));
                }
            }
        }
        Some(Filter {
            ids,
            authors,
            kinds,
            since,
            until,
            limit,
            tags,
        })
    }

    /// Whether this subscription names at least one author, as relay policy
    /// requires.
    pub fn has_authors(&self) -> bool {
        self.authors.as_ref().is_some_and(|a| !a.is_empty())
    }

    /// Whether `ev` satisfies every present field of this filter.
    pub fn matches(&self, ev: &Event) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.iter().any(|id| id == &ev.id) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.iter().any(|a| a == &ev.pubkey) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&ev.kind) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if ev.created_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if ev.created_at > until {
                return false;
            }
        }
        for (letter, values) in &self.tags {
            let mut buf = [0u8; 4];
            let name: &str = letter.encode_utf8(&mut buf);
            let hit = ev.tags.iter().any(|t| {
                t.name() == Some(name) && t.value().is_some_and(|v| values.iter().any(|w| w == v))
            });
            if !hit {
                return false;
            }
        }
        true
    }
}

/// Whether any filter in the list matches `ev` (logical OR).
pub fn match_any(filters: &[Filter], ev: &Event) -> bool {
    filters.iter().any(|f| f.matches(ev))
}

fn string_array(val: &Value) -> Option<Vec<String>> {
    val.as_array().map(|arr| {
        arr.iter()
            .filter_map(|v| v.as_str().map(|s| s.to_string()))
            .collect()
    })
}
