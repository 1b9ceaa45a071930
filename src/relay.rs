//! The contract between the relay core and its embedder.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::event::Event;
use crate::filter::Filter;
use crate::store::Store;
use crate::ws::Connection;

/// NIP-11 relay information document.
#[derive(Debug, Clone, Serialize, Default)]
pub struct RelayInfo {
    pub name: String,
    pub description: String,
    pub pubkey: String,
    pub contact: String,
    pub supported_nips: Vec<u32>,
    pub software: String,
    pub version: String,
}

/// The main trait implemented by a relay embedder.
///
/// `name` and `storage` are the required core. Every other method is an
/// optional capability with an inert default: overriding `service_url`
/// enables NIP-42 authentication, `inject_events` feeds externally produced
/// events into the broadcast path, `info_document` overrides the generated
/// NIP-11 response, `handle_unknown` receives unrecognized envelope tags,
/// and `on_shutdown` runs during graceful shutdown.
#[async_trait]
pub trait Relay: Send + Sync + 'static {
    /// Relay name, used in the NIP-11 document and log output.
    fn name(&self) -> String;

    /// Storage backend consulted for every query, save, and delete.
    fn storage(&self) -> Arc<dyn Store>;

    /// Called once before the server starts accepting connections.
    fn init(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Policy check for every incoming event.
    ///
    /// Returning `Err` rejects the event; a non-empty message becomes the OK
    /// reason, an empty one falls back to `blocked: event blocked by relay`.
    async fn accept_event(&self, _event: &Event) -> Result<(), String> {
        Ok(())
    }

    /// Policy check for REQ filters before they hit storage.
    async fn accept_req(
        &self,
        _id: &str,
        _filters: &[Filter],
        _authed_pubkey: Option<&str>,
    ) -> bool {
        true
    }

    /// NIP-42 service URL; returning one enables the AUTH machinery.
    fn service_url(&self) -> Option<String> {
        None
    }

    /// Stream of externally produced events to broadcast to live subscriptions.
    fn inject_events(&self) -> Option<mpsc::Receiver<Event>> {
        None
    }

    /// Override the generated NIP-11 information document.
    fn info_document(&self) -> Option<RelayInfo> {
        None
    }

    /// Handle an envelope tag the server does not recognize.
    ///
    /// Return `true` when handled; `false` sends the default NOTICE.
    async fn handle_unknown(&self, _conn: &Connection, _tag: &str, _rest: &[Value]) -> bool {
        false
    }

    /// Called once during graceful shutdown.
    async fn on_shutdown(&self) {}
}
