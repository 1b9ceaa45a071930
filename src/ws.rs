//! Per-connection WebSocket actor: read/write loops, keep-alive, dispatch.

use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use axum::extract::ws::{Message, WebSocket};
use futures_util::{Sink, SinkExt, StreamExt};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use nonzero_ext::nonzero;
use rand::Rng;
use std::time::Duration;
use tokio::time::{interval, timeout, timeout_at, Instant};
use tracing::{debug, warn};

use crate::event::KIND_ENCRYPTED_DIRECT_MESSAGE;
use crate::filter::Filter;
use crate::ingest;
use crate::message::{ClientMessage, ParseError, RelayMessage};
use crate::server::ServerState;
use crate::{auth, event::Event};

/// Time allowed to write a message to the peer.
pub(crate) const WRITE_WAIT: Duration = Duration::from_secs(10);
/// Time allowed to read the next pong message from the peer.
const PONG_WAIT: Duration = Duration::from_secs(60);
/// Ping period; must be less than `PONG_WAIT`.
const PING_PERIOD: Duration = Duration::from_secs(30);
/// Maximum message size allowed from the peer.
pub(crate) const MAX_MESSAGE_SIZE: usize = 512 * 1024;

/// Close codes that are ordinary disconnects rather than protocol trouble.
const EXPECTED_CLOSE_CODES: [u16; 3] = [1001, 1005, 1006];

type WsSink = Box<dyn Sink<Message, Error = axum::Error> + Send + Unpin>;

/// One client connection.
///
/// All outbound frames funnel through [`Connection::send`], which serializes
/// writes under a mutex and bounds each one with the write deadline, so
/// frames never interleave regardless of which task produced them.
pub struct Connection {
    id: u64,
    sink: tokio::sync::Mutex<WsSink>,
    challenge: Option<String>,
    authed: Mutex<Option<String>>,
    limiter: Option<DefaultDirectRateLimiter>,
}

impl Connection {
    fn new(
        id: u64,
        sink: WsSink,
        challenge: Option<String>,
        limiter: Option<DefaultDirectRateLimiter>,
    ) -> Self {
        Self {
            id,
            sink: tokio::sync::Mutex::new(sink),
            challenge,
            authed: Mutex::new(None),
            limiter,
        }
    }

    /// Server-local identifier of this connection.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Pubkey proven via AUTH, if any.
    pub fn authed_pubkey(&self) -> Option<String> {
        self.authed.lock().unwrap().clone()
    }

    fn set_authed(&self, pubkey: String) {
        *self.authed.lock().unwrap() = Some(pubkey);
    }

    /// AUTH challenge issued to this connection, if authentication is enabled.
    pub fn challenge(&self) -> Option<&str> {
        self.challenge.as_deref()
    }

    /// Send a protocol message as a text frame.
    pub async fn send(&self, msg: &RelayMessage) -> Result<()> {
        self.send_frame(Message::Text(msg.to_json())).await
    }

    pub(crate) async fn send_frame(&self, frame: Message) -> Result<()> {
        let mut sink = self.sink.lock().await;
        match timeout(WRITE_WAIT, sink.send(frame)).await {
            Ok(res) => res.map_err(anyhow::Error::new),
            Err(_) => Err(anyhow!("write timed out")),
        }
    }
}

/// Run one accepted WebSocket until it disconnects or the server shuts down.
pub(crate) async fn serve_connection(state: Arc<ServerState>, socket: WebSocket) {
    let (sink, mut stream) = socket.split();
    let challenge = state.relay.service_url().map(|_| {
        let bytes: [u8; 8] = rand::thread_rng().gen();
        hex::encode(bytes)
    });
    let limiter = state.per_connection_limit.map(|(rate, burst)| {
        let quota = Quota::per_second(NonZeroU32::new(rate).unwrap_or(nonzero!(1u32)))
            .allow_burst(NonZeroU32::new(burst).unwrap_or(nonzero!(1u32)));
        RateLimiter::direct(quota)
    });
    let conn = Arc::new(Connection::new(
        state.next_conn_id(),
        Box::new(sink),
        challenge,
        limiter,
    ));
    state
        .clients
        .lock()
        .unwrap()
        .insert(conn.id(), conn.clone());

    if let Some(challenge) = conn.challenge() {
        let _ = conn.send(&RelayMessage::auth(challenge)).await;
    }

    let reader = async {
        let mut deadline = Instant::now() + PONG_WAIT;
        loop {
            let msg = match timeout_at(deadline, stream.next()).await {
                Err(_) => break,   // read deadline expired
                Ok(None) => break, // socket gone
                Ok(Some(Err(err))) => {
                    debug!(conn = conn.id(), error = %err, "read error");
                    break;
                }
                Ok(Some(Ok(msg))) => msg,
            };
            match msg {
                Message::Text(text) => {
                    if let Some(limiter) = &conn.limiter {
                        limiter.until_ready().await;
                    }
                    tokio::spawn(handle_message(state.clone(), conn.clone(), text));
                }
                Message::Pong(_) => {
                    deadline = Instant::now() + PONG_WAIT;
                }
                // pings are answered by the protocol layer on read
                Message::Ping(_) => {}
                Message::Binary(_) => {}
                Message::Close(frame) => {
                    if let Some(frame) = &frame {
                        if !EXPECTED_CLOSE_CODES.contains(&frame.code) {
                            warn!(conn = conn.id(), code = frame.code, "unexpected close");
                        }
                    }
                    break;
                }
            }
        }
    };

    let keepalive = async {
        let mut ticker = interval(PING_PERIOD);
        ticker.tick().await; // the first tick is immediate
        let mut auth_deadline = state.auth_deadline.map(|d| Instant::now() + d);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if conn.send_frame(Message::Ping(Vec::new())).await.is_err() {
                        warn!(conn = conn.id(), "error writing ping, closing websocket");
                        break;
                    }
                }
                _ = async {
                    match auth_deadline {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => std::future::pending().await,
                    }
                } => {
                    if conn.authed_pubkey().is_none() {
                        debug!(conn = conn.id(), "authentication deadline expired");
                        break;
                    }
                    auth_deadline = None;
                }
            }
        }
    };

    let mut shutdown = state.shutdown.subscribe();
    tokio::select! {
        _ = reader => {}
        _ = keepalive => {}
        _ = shutdown.changed() => {}
    }

    let _ = conn.send_frame(Message::Close(None)).await;
    state.clients.lock().unwrap().remove(&conn.id());
    state.registry.remove_conn(conn.id());
}

/// Decode one inbound frame and dispatch it.
async fn handle_message(state: Arc<ServerState>, conn: Arc<Connection>, text: String) {
    match ClientMessage::parse(&text) {
        Ok(ClientMessage::Event(event)) => ingest::do_event(&state, &conn, *event).await,
        Ok(ClientMessage::Req { id, filters }) => do_req(&state, &conn, id, filters).await,
        Ok(ClientMessage::Count { id, filters }) => do_count(&state, &conn, id, filters).await,
        Ok(ClientMessage::Close { id }) => do_close(&state, &conn, &id).await,
        Ok(ClientMessage::Auth(event)) => do_auth(&state, &conn, *event).await,
        Ok(ClientMessage::Unknown { tag, rest }) => {
            if !state.relay.handle_unknown(&conn, &tag, &rest).await {
                let msg = RelayMessage::notice(format!("unknown message type {tag}"));
                let _ = conn.send(&msg).await;
            }
        }
        Err(ParseError::Unparseable) => {}
        Err(err @ ParseError::BadEvent(_)) => {
            let _ = conn.send(&RelayMessage::ok("", false, err.to_string())).await;
        }
        Err(err @ ParseError::BadAuthEvent(_)) => {
            let _ = conn.send(&RelayMessage::ok("", false, err.to_string())).await;
        }
        Err(err) => {
            let _ = conn.send(&RelayMessage::notice(err.to_string())).await;
        }
    }
}

/// Serve stored events for a REQ and register the live subscription.
async fn do_req(
    state: &Arc<ServerState>,
    conn: &Arc<Connection>,
    id: String,
    filters: Vec<Filter>,
) {
    if id.is_empty() {
        let _ = conn.send(&RelayMessage::notice("REQ has no <id>")).await;
        return;
    }
    let authed = conn.authed_pubkey();
    if !state.relay.accept_req(&id, &filters, authed.as_deref()).await {
        let _ = conn
            .send(&RelayMessage::notice("REQ filters are not accepted"))
            .await;
        return;
    }
    let auth_enabled = state.relay.service_url().is_some();
    for filter in &filters {
        if auth_enabled && !dm_filter_allowed(filter, authed.as_deref()) {
            let msg = RelayMessage::notice(
                "restricted: this relay only serves kind-4 events to their participants, and only after AUTH",
            );
            let _ = conn.send(&msg).await;
            return;
        }
        let mut rx = match state.store.query_events(filter).await {
            Ok(rx) => rx,
            Err(err) => {
                warn!(error = %err, "query failed");
                continue;
            }
        };
        let limit = filter.limit.unwrap_or(usize::MAX);
        let mut sent = 0usize;
        // keep draining past the limit so the store can close the stream
        while let Some(event) = rx.recv().await {
            if sent < limit {
                if conn.send(&RelayMessage::event(id.as_str(), event)).await.is_err() {
                    break;
                }
                sent += 1;
            }
        }
    }
    let _ = conn.send(&RelayMessage::eose(id.as_str())).await;
    state.registry.add(conn, &id, filters);
}

/// Aggregate per-filter counts and reply with a COUNT envelope.
async fn do_count(
    state: &Arc<ServerState>,
    conn: &Arc<Connection>,
    id: String,
    filters: Vec<Filter>,
) {
    if id.is_empty() {
        let _ = conn.send(&RelayMessage::notice("COUNT has no <id>")).await;
        return;
    }
    if !state.store.supports_count() {
        let msg = RelayMessage::notice("restricted: this relay does not support COUNT");
        let _ = conn.send(&msg).await;
        return;
    }
    let authed = conn.authed_pubkey();
    let auth_enabled = state.relay.service_url().is_some();
    let mut total = 0u64;
    for filter in &filters {
        if auth_enabled && !dm_filter_allowed(filter, authed.as_deref()) {
            let msg = RelayMessage::notice(
                "restricted: this relay only serves kind-4 events to their participants, and only after AUTH",
            );
            let _ = conn.send(&msg).await;
            return;
        }
        match state.store.count_events(filter).await {
            Ok(count) => total += count,
            Err(err) => warn!(error = %err, "count failed"),
        }
    }
    let _ = conn.send(&RelayMessage::count(id.as_str(), total)).await;
}

/// Drop one subscription.
async fn do_close(state: &Arc<ServerState>, conn: &Arc<Connection>, id: &str) {
    if id.is_empty() {
        let _ = conn.send(&RelayMessage::notice("CLOSE has no <id>")).await;
        return;
    }
    state.registry.remove_id(conn.id(), id);
}

/// Validate an AUTH response against the stored challenge.
async fn do_auth(state: &Arc<ServerState>, conn: &Arc<Connection>, event: Event) {
    let (Some(service_url), Some(challenge)) = (state.relay.service_url(), conn.challenge())
    else {
        let msg = RelayMessage::notice("unknown message type AUTH");
        let _ = conn.send(&msg).await;
        return;
    };
    match auth::validate_auth_event(&event, challenge, &service_url) {
        Ok(pubkey) => {
            conn.set_authed(pubkey);
            let _ = conn.send(&RelayMessage::ok(event.id.as_str(), true, "")).await;
        }
        Err(err) => {
            debug!(conn = conn.id(), error = %err, "authentication failed");
            let msg = RelayMessage::ok(event.id.as_str(), false, "error: failed to authenticate");
            let _ = conn.send(&msg).await;
        }
    }
}

/// Privacy rule for encrypted direct messages: an authenticated pubkey may
/// only ask for kind-4 events it sent or received.
fn dm_filter_allowed(filter: &Filter, authed: Option<&str>) -> bool {
    let touches_dm = filter
        .kinds
        .as_ref()
        .map_or(false, |ks| ks.contains(&KIND_ENCRYPTED_DIRECT_MESSAGE));
    if !touches_dm {
        return true;
    }
    let Some(authed) = authed else {
        return false;
    };
    let senders: &[String] = filter.authors.as_deref().unwrap_or(&[]);
    let receivers: &[String] = filter.tags.get("p").map(|v| v.as_slice()).unwrap_or(&[]);
    (senders.len() == 1 && receivers.len() < 2 && senders[0] == authed)
        || (receivers.len() == 1 && senders.len() < 2 && receivers[0] == authed)
}

#[cfg(test)]
pub(crate) fn test_connection(id: u64) -> Arc<Connection> {
    let sink = futures_util::sink::drain().sink_map_err(|e: std::convert::Infallible| match e {});
    Arc::new(Connection::new(id, Box::new(sink), None, None))
}
