//! Subscription filters and event matching.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::event::Event;

/// Declarative subset of events requested by a subscription.
///
/// A missing field matches everything; a field present but empty matches
/// nothing. `search` is opaque to the relay core and handed to the storage
/// backend, so live matching ignores it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    /// Hex id prefixes.
    pub ids: Option<Vec<String>>,
    /// Hex pubkey prefixes.
    pub authors: Option<Vec<String>>,
    /// Exact kind numbers.
    pub kinds: Option<Vec<u32>>,
    /// Tag constraints keyed by name, parsed from the `#<letter>` fields.
    pub tags: BTreeMap<String, Vec<String>>,
    /// Inclusive lower bound on `created_at`.
    pub since: Option<u64>,
    /// Inclusive upper bound on `created_at`.
    pub until: Option<u64>,
    /// Maximum number of stored events to return.
    pub limit: Option<usize>,
    /// Backend-specific full-text query.
    pub search: Option<String>,
}

impl Filter {
    /// Parse a filter from its JSON object form, or `None` if `val` is not an object.
    pub fn from_value(val: &Value) -> Option<Self> {
        let obj = val.as_object()?;
        let ids = obj.get("ids").and_then(|v| v.as_array()).map(string_vec);
        let authors = obj.get("authors").and_then(|v| v.as_array()).map(string_vec);
        let kinds = obj.get("kinds").and_then(|v| v.as_array()).map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_u64().map(|u| u as u32))
                .collect()
        });
        let mut tags = BTreeMap::new();
        for (key, v) in obj {
            if let Some(name) = key.strip_prefix('#') {
                if name.is_empty() {
                    continue;
                }
                let values = v.as_array().map(string_vec).unwrap_or_default();
                tags.insert(name.to_string(), values);
            }
        }
        let since = obj.get("since").and_then(|v| v.as_u64());
        let until = obj.get("until").and_then(|v| v.as_u64());
        let limit = obj
            .get("limit")
            .and_then(|v| v.as_u64())
            .map(|v| v as usize);
        let search = obj
            .get("search")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        Some(Filter {
            ids,
            authors,
            kinds,
            tags,
            since,
            until,
            limit,
            search,
        })
    }

    /// Whether `ev` satisfies every constraint present on this filter.
    pub fn matches(&self, ev: &Event) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.iter().any(|prefix| ev.id.starts_with(prefix)) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.iter().any(|prefix| ev.pubkey.starts_with(prefix)) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&ev.kind) {
                return false;
            }
        }
        for (name, values) in &self.tags {
            let found = ev
                .tag_values(name)
                .any(|v| values.iter().any(|want| want == v));
            if !found {
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
        true
    }
}

/// Collect the string elements of a JSON array.
fn string_vec(arr: &Vec<Value>) -> Vec<String> {
    arr.iter()
        .filter_map(|v| v.as_str().map(|s| s.to_string()))
        .collect()
}
