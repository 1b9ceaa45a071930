//! Live subscription registry and fan-out.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::event::Event;
use crate::filter::Filter;
use crate::message::RelayMessage;
use crate::ws::Connection;

/// Subscriptions held by one connection.
struct ConnListeners {
    conn: Arc<Connection>,
    subs: HashMap<String, Vec<Filter>>,
}

/// Per-server map of live subscriptions, keyed by connection id.
pub(crate) struct Registry {
    listeners: Mutex<HashMap<u64, ConnListeners>>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self {
            listeners: Mutex::new(HashMap::new()),
        }
    }

    /// Insert or replace a subscription.
    pub(crate) fn add(&self, conn: &Arc<Connection>, id: &str, filters: Vec<Filter>) {
        let mut listeners = self.listeners.lock().unwrap();
        let entry = listeners
            .entry(conn.id())
            .or_insert_with(|| ConnListeners {
                conn: conn.clone(),
                subs: HashMap::new(),
            });
        entry.subs.insert(id.to_string(), filters);
    }

    /// Remove one subscription, dropping the connection entry when it was the last.
    pub(crate) fn remove_id(&self, conn_id: u64, id: &str) {
        let mut listeners = self.listeners.lock().unwrap();
        if let Some(entry) = listeners.get_mut(&conn_id) {
            entry.subs.remove(id);
            if entry.subs.is_empty() {
                listeners.remove(&conn_id);
            }
        }
    }

    /// Remove a connection and all its subscriptions.
    pub(crate) fn remove_conn(&self, conn_id: u64) {
        self.listeners.lock().unwrap().remove(&conn_id);
    }

    /// De-duplicated union of every live filter.
    pub(crate) fn listening_filters(&self) -> Vec<Filter> {
        let listeners = self.listeners.lock().unwrap();
        let mut filters: Vec<Filter> = vec![];
        for entry in listeners.values() {
            for subs in entry.subs.values() {
                for f in subs {
                    if !filters.contains(f) {
                        filters.push(f.clone());
                    }
                }
            }
        }
        filters
    }

    /// Send `event` to every subscription with a matching filter.
    ///
    /// Matches are collected under the lock; the writes happen outside it,
    /// each bounded by the connection write deadline. A failed write does not
    /// end the subscription.
    pub(crate) async fn notify(&self, event: &Event) {
        let targets: Vec<(Arc<Connection>, String)> = {
            let listeners = self.listeners.lock().unwrap();
            let mut targets = vec![];
            for entry in listeners.values() {
                for (id, filters) in &entry.subs {
                    if filters.iter().any(|f| f.matches(event)) {
                        targets.push((entry.conn.clone(), id.clone()));
                    }
                }
            }
            targets
        };
        for (conn, id) in targets {
            let _ = conn.send(&RelayMessage::event(id, event.clone())).await;
        }
    }
}
