//! Relay server lifecycle: construction, HTTP surface, graceful shutdown.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    extract::{State, WebSocketUpgrade},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::config::Settings;
use crate::event::Event;
use crate::filter::Filter;
use crate::listener::Registry;
use crate::relay::{Relay, RelayInfo};
use crate::store::Store;
use crate::ws::{self, Connection};

/// Server construction options.
#[derive(Default)]
pub struct Options {
    auth_deadline: Option<Duration>,
    per_connection_limit: Option<(u32, u32)>,
    router: Option<Router>,
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    /// Close connections still unauthenticated when `deadline` elapses.
    pub fn with_auth_deadline(mut self, deadline: Duration) -> Self {
        self.auth_deadline = Some(deadline);
        self
    }

    /// Give each connection a token bucket of `rate` tokens per second with
    /// `burst` capacity; the reader waits for a token before dispatching.
    pub fn with_per_connection_limit(mut self, rate: u32, burst: u32) -> Self {
        self.per_connection_limit = Some((rate, burst));
        self
    }

    /// Routes served for requests that are neither WebSocket upgrades nor
    /// NIP-11 lookups. Must not claim `/`.
    pub fn with_router(mut self, router: Router) -> Self {
        self.router = Some(router);
        self
    }
}

/// Shared state behind one running server.
pub(crate) struct ServerState {
    pub(crate) relay: Arc<dyn Relay>,
    pub(crate) store: Arc<dyn Store>,
    pub(crate) registry: Registry,
    pub(crate) clients: Mutex<HashMap<u64, Arc<Connection>>>,
    pub(crate) auth_deadline: Option<Duration>,
    pub(crate) per_connection_limit: Option<(u32, u32)>,
    pub(crate) shutdown: watch::Sender<bool>,
    next_conn_id: AtomicU64,
}

impl ServerState {
    pub(crate) fn next_conn_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// A relay server hosting one embedder over HTTP and WebSocket.
///
/// Tests can run several servers in one process; each owns its registry and
/// connection set.
pub struct Server {
    state: Arc<ServerState>,
    router: Mutex<Option<Router>>,
    addr: Mutex<Option<SocketAddr>>,
}

impl Server {
    /// Initialize the storage and the relay, and prepare a server.
    ///
    /// If the relay injects events, a forwarder task is spawned that
    /// broadcasts them until shutdown, blocking while consumers lag.
    pub fn new(relay: impl Relay, options: Options) -> Result<Self> {
        let relay: Arc<dyn Relay> = Arc::new(relay);
        let store = relay.storage();
        store.init().context("storage init")?;
        relay.init().context("relay init")?;

        let (shutdown, _) = watch::channel(false);
        let state = Arc::new(ServerState {
            relay: relay.clone(),
            store,
            registry: Registry::new(),
            clients: Mutex::new(HashMap::new()),
            auth_deadline: options.auth_deadline,
            per_connection_limit: options.per_connection_limit,
            shutdown,
            next_conn_id: AtomicU64::new(1),
        });

        if let Some(mut injected) = relay.inject_events() {
            let state = state.clone();
            let mut stop = state.shutdown.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        event = injected.recv() => match event {
                            Some(event) => state.registry.notify(&event).await,
                            None => break,
                        },
                        _ = stop.changed() => break,
                    }
                }
            });
        }

        Ok(Self {
            state,
            router: Mutex::new(options.router),
            addr: Mutex::new(None),
        })
    }

    /// Bind `host:port` and serve until [`Server::shutdown`] is called.
    pub async fn start(&self, host: &str, port: u16) -> Result<()> {
        let addr: SocketAddr = format!("{host}:{port}").parse().context("parsing address")?;
        let listener = tokio::net::TcpListener::bind(addr).await?;
        *self.addr.lock().unwrap() = Some(listener.local_addr()?);

        let embedder_routes = self
            .router
            .lock()
            .unwrap()
            .take()
            .unwrap_or_else(Router::new);
        let app = Router::new()
            .route("/", get(root))
            .with_state(self.state.clone())
            .merge(embedder_routes)
            .layer(CorsLayer::permissive());

        let mut rx = self.state.shutdown.subscribe();
        let shutdown = async move {
            if !*rx.borrow_and_update() {
                let _ = rx.changed().await;
            }
        };
        info!(relay = %self.state.relay.name(), addr = %self.local_addr().unwrap(), "listening");
        axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(shutdown)
            .await?;
        Ok(())
    }

    /// Serve using `HOST` and `PORT` from the environment.
    pub async fn start_from_env(&self) -> Result<()> {
        let settings = Settings::from_env()?;
        self.start(&settings.host, settings.port).await
    }

    /// Address actually bound, available once `start` has opened its listener.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.addr.lock().unwrap()
    }

    /// Stop serving: every tracked connection receives a close frame and the
    /// embedder's shutdown hook runs. `start` returns once in-flight
    /// connections have wound down.
    pub async fn shutdown(&self) {
        let _ = self.state.shutdown.send(true);
        self.state.relay.on_shutdown().await;
    }

    /// Emit an event to matching live subscriptions without storing it or
    /// running acceptance policy.
    pub async fn broadcast_event(&self, event: &Event) {
        self.state.registry.notify(event).await;
    }

    /// De-duplicated union of every live subscription filter.
    pub fn listening_filters(&self) -> Vec<Filter> {
        self.state.registry.listening_filters()
    }

    /// Number of currently tracked connections.
    pub fn connection_count(&self) -> usize {
        self.state.clients.lock().unwrap().len()
    }
}

/// Route `/` by request shape: upgrade, NIP-11 lookup, or fallthrough.
async fn root(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    upgrade: Option<WebSocketUpgrade>,
) -> Response {
    if let Some(upgrade) = upgrade {
        return upgrade
            .max_message_size(ws::MAX_MESSAGE_SIZE)
            .on_upgrade(move |socket| ws::serve_connection(state, socket));
    }
    let accept = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if accept == "application/nostr+json" {
        return Json(info_document(&state)).into_response();
    }
    StatusCode::NOT_FOUND.into_response()
}

/// NIP-11 document: the embedder override, or one built from the relay name.
fn info_document(state: &ServerState) -> RelayInfo {
    if let Some(info) = state.relay.info_document() {
        return info;
    }
    let mut nips = vec![1, 9, 11, 12, 15, 16, 20, 33];
    if state.relay.service_url().is_some() {
        nips.push(42);
    }
    if state.store.supports_count() {
        nips.push(45);
    }
    RelayInfo {
        name: state.relay.name(),
        supported_nips: nips,
        software: "rostr".into(),
        version: env!("CARGO_PKG_VERSION").into(),
        ..Default::default()
    }
}
