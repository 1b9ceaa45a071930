//! Storage contract and the in-memory reference backend.

use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::event::{Event, KIND_RECOMMEND_SERVER};
use crate::filter::Filter;

/// Why a save was not performed.
#[derive(Debug, Error)]
pub enum SaveError {
    /// The event is already present; reported to the client as a success.
    #[error("duplicate: already have this event")]
    Duplicate,
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Pluggable storage backend.
///
/// Replaceable and parameterized-replaceable supersession is the store's
/// responsibility: `save_event` deletes superseded rows before insert, scoped
/// by (pubkey, kind), (pubkey, content) for kind 2, or (pubkey, kind, `d`).
/// The query stream is lazy and bounded; the relay core drains it fully so
/// the store can release resources, and stops feeding when the receiver is
/// dropped.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Called once before the server starts.
    fn init(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Persist an event, superseding replaceable predecessors.
    async fn save_event(&self, event: &Event) -> Result<(), SaveError>;

    /// Remove an event by id.
    async fn delete_event(&self, id: &str) -> anyhow::Result<()>;

    /// Stream stored events matching `filter`.
    async fn query_events(&self, filter: &Filter) -> anyhow::Result<mpsc::Receiver<Event>>;

    /// Whether `count_events` is usable (enables COUNT and NIP-45).
    fn supports_count(&self) -> bool {
        false
    }

    /// Count stored events matching `filter`.
    async fn count_events(&self, _filter: &Filter) -> anyhow::Result<u64> {
        anyhow::bail!("counting not supported")
    }

    /// Hook invoked right before an event is persisted.
    async fn before_save(&self, _event: &Event) {}

    /// Hook invoked right after an event is persisted.
    async fn after_save(&self, _event: &Event) {}

    /// Hook invoked right before a deletion request removes an event.
    async fn before_delete(&self, _id: &str, _pubkey: &str) {}

    /// Hook invoked right after a deletion request removed an event.
    async fn after_delete(&self, _id: &str, _pubkey: &str) {}
}

/// In-memory store keeping events in a mutex-guarded vector.
///
/// Intended for tests and trivial relays; everything lives in process memory
/// and is gone on restart. `search` is matched as a case-insensitive
/// substring of the content.
#[derive(Default)]
pub struct MemoryStore {
    events: Mutex<Vec<Event>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored events.
    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    /// Whether the store holds no events.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of events matching `filter`, newest first, capped at `limit`.
    fn matching(&self, filter: &Filter) -> Vec<Event> {
        let needle = filter.search.as_ref().map(|s| s.to_lowercase());
        let mut events: Vec<Event> = self
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|ev| filter.matches(ev))
            .filter(|ev| {
                needle
                    .as_ref()
                    .map_or(true, |n| ev.content.to_lowercase().contains(n))
            })
            .cloned()
            .collect();
        events.sort_by_key(|e| std::cmp::Reverse(e.created_at));
        if let Some(limit) = filter.limit {
            events.truncate(limit);
        }
        events
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn save_event(&self, event: &Event) -> Result<(), SaveError> {
        let mut events = self.events.lock().unwrap();
        if events.iter().any(|e| e.id == event.id) {
            return Err(SaveError::Duplicate);
        }
        // Drop superseded rows before insert.
        if event.is_replaceable() {
            events.retain(|e| !(e.pubkey == event.pubkey && e.kind == event.kind));
        } else if event.kind == KIND_RECOMMEND_SERVER {
            events.retain(|e| {
                !(e.pubkey == event.pubkey && e.kind == event.kind && e.content == event.content)
            });
        } else if event.is_parameterized_replaceable() {
            let d = event.tag_value("d").unwrap_or_default();
            events.retain(|e| {
                !(e.pubkey == event.pubkey
                    && e.kind == event.kind
                    && e.tag_value("d").unwrap_or_default() == d)
            });
        }
        events.push(event.clone());
        Ok(())
    }

    async fn delete_event(&self, id: &str) -> anyhow::Result<()> {
        self.events.lock().unwrap().retain(|e| e.id != id);
        Ok(())
    }

    async fn query_events(&self, filter: &Filter) -> anyhow::Result<mpsc::Receiver<Event>> {
        let events = self.matching(filter);
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            for ev in events {
                // receiver stopped consuming
                if tx.send(ev).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    fn supports_count(&self) -> bool {
        true
    }

    async fn count_events(&self, filter: &Filter) -> anyhow::Result<u64> {
        let unlimited = Filter {
            limit: None,
            ..filter.clone()
        };
        Ok(self.matching(&unlimited).len() as u64)
    }
}
