//! End-to-end tests driving a live relay over real WebSockets.

use std::net::{SocketAddr, TcpListener};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use secp256k1::{Keypair, Message as SecpMessage, Secp256k1};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message as TMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use rostr::{Event, MemoryStore, Options, Relay, Server, Store, Tag};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestRelay {
    store: Arc<MemoryStore>,
    service_url: Option<String>,
    injected: Mutex<Option<mpsc::Receiver<Event>>>,
}

impl TestRelay {
    fn new() -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
            service_url: None,
            injected: Mutex::new(None),
        }
    }

    fn with_auth(url: String) -> Self {
        Self {
            service_url: Some(url),
            ..Self::new()
        }
    }

    fn with_injector(rx: mpsc::Receiver<Event>) -> Self {
        Self {
            injected: Mutex::new(Some(rx)),
            ..Self::new()
        }
    }
}

#[async_trait]
impl Relay for TestRelay {
    fn name(&self) -> String {
        "test relay".into()
    }

    fn storage(&self) -> Arc<dyn Store> {
        self.store.clone()
    }

    fn service_url(&self) -> Option<String> {
        self.service_url.clone()
    }

    fn inject_events(&self) -> Option<mpsc::Receiver<Event>> {
        self.injected.lock().unwrap().take()
    }
}

/// Signing helper around one secret key.
struct Signer {
    secp: Secp256k1<secp256k1::All>,
    kp: Keypair,
}

impl Signer {
    fn new(seed: u8) -> Self {
        let secp = Secp256k1::new();
        let kp = Keypair::from_seckey_slice(&secp, &[seed; 32]).unwrap();
        Self { secp, kp }
    }

    fn pubkey(&self) -> String {
        hex::encode(self.kp.x_only_public_key().0.serialize())
    }

    fn event(&self, kind: u32, created_at: u64, tags: Vec<Tag>, content: &str) -> Event {
        let mut ev = Event {
            id: String::new(),
            pubkey: self.pubkey(),
            kind,
            created_at,
            tags,
            content: content.into(),
            sig: String::new(),
        };
        let hash = ev.hash().unwrap();
        ev.id = hex::encode(hash);
        let msg = SecpMessage::from_digest_slice(&hash).unwrap();
        let sig = self.secp.sign_schnorr_no_aux_rand(&msg, &self.kp);
        ev.sig = hex::encode(sig.as_ref());
        ev
    }
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

async fn start_relay(relay: TestRelay, options: Options) -> (Arc<Server>, SocketAddr) {
    let server = Arc::new(Server::new(relay, options).unwrap());
    let srv = server.clone();
    tokio::spawn(async move { srv.start("127.0.0.1", 0).await.unwrap() });
    loop {
        if let Some(addr) = server.local_addr() {
            return (server, addr);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn start_relay_on(relay: TestRelay, port: u16) -> Arc<Server> {
    let server = Arc::new(Server::new(relay, Options::new()).unwrap());
    let srv = server.clone();
    tokio::spawn(async move { srv.start("127.0.0.1", port).await.unwrap() });
    while server.local_addr().is_none() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    server
}

async fn connect(addr: SocketAddr) -> WsStream {
    let (ws, _) = connect_async(format!("ws://{addr}/")).await.unwrap();
    ws
}

/// Read the next text frame as JSON, skipping control frames.
async fn recv_value(ws: &mut WsStream) -> Value {
    loop {
        let msg = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .expect("read error");
        match msg {
            TMessage::Text(t) => return serde_json::from_str(&t).unwrap(),
            TMessage::Ping(_) | TMessage::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

async fn send_value(ws: &mut WsStream, val: Value) {
    ws.send(TMessage::Text(val.to_string())).await.unwrap();
}

/// Open a subscription and wait for its EOSE, returning stored events seen.
async fn subscribe(ws: &mut WsStream, sub: &str, filter: Value) -> Vec<Value> {
    send_value(ws, json!(["REQ", sub, filter])).await;
    let mut events = vec![];
    loop {
        let val = recv_value(ws).await;
        match val[0].as_str() {
            Some("EVENT") => events.push(val[2].clone()),
            Some("EOSE") => break,
            other => panic!("unexpected message while subscribing: {other:?}"),
        }
    }
    // give the server a beat to register the live listener
    tokio::time::sleep(Duration::from_millis(50)).await;
    events
}

#[tokio::test]
async fn accept_and_broadcast() {
    let (server, addr) = start_relay(TestRelay::new(), Options::new()).await;
    let mut c1 = connect(addr).await;
    let mut c2 = connect(addr).await;

    let stored = subscribe(&mut c2, "s1", json!({"kinds": [1]})).await;
    assert!(stored.is_empty());

    let ev = Signer::new(1).event(1, now(), vec![], "hi");
    send_value(&mut c1, json!(["EVENT", &ev])).await;

    let ok = recv_value(&mut c1).await;
    assert_eq!(ok[0], "OK");
    assert_eq!(ok[1], ev.id);
    assert_eq!(ok[2], true);
    assert_eq!(ok[3], "");

    let live = timeout(Duration::from_secs(1), recv_value(&mut c2))
        .await
        .expect("no live event within 1s");
    assert_eq!(live[0], "EVENT");
    assert_eq!(live[1], "s1");
    assert_eq!(live[2]["id"], ev.id);

    server.shutdown().await;
}

#[tokio::test]
async fn invalid_signature_is_rejected_and_not_broadcast() {
    let (server, addr) = start_relay(TestRelay::new(), Options::new()).await;
    let mut c1 = connect(addr).await;
    let mut c2 = connect(addr).await;
    subscribe(&mut c2, "s1", json!({"kinds": [1]})).await;

    let mut ev = Signer::new(1).event(1, now(), vec![], "hi");
    let mut sig = hex::decode(&ev.sig).unwrap();
    *sig.last_mut().unwrap() ^= 0x01;
    ev.sig = hex::encode(sig);
    send_value(&mut c1, json!(["EVENT", &ev])).await;

    let ok = recv_value(&mut c1).await;
    assert_eq!(ok[0], "OK");
    assert_eq!(ok[2], false);
    assert_eq!(ok[3], "invalid: signature is invalid");

    // not broadcast and not stored
    assert!(timeout(Duration::from_millis(300), c2.next()).await.is_err());
    let mut c3 = connect(addr).await;
    let stored = subscribe(&mut c3, "q", json!({"ids": [ev.id]})).await;
    assert!(stored.is_empty());

    server.shutdown().await;
}

#[tokio::test]
async fn tampered_id_is_rejected() {
    let (server, addr) = start_relay(TestRelay::new(), Options::new()).await;
    let mut c1 = connect(addr).await;
    let mut ev = Signer::new(1).event(1, now(), vec![], "hi");
    ev.content = "tampered".into();
    send_value(&mut c1, json!(["EVENT", &ev])).await;
    let ok = recv_value(&mut c1).await;
    assert_eq!(ok[2], false);
    assert_eq!(ok[3], "invalid: event id is computed incorrectly");
    server.shutdown().await;
}

#[tokio::test]
async fn deletion_requires_matching_author() {
    let (server, addr) = start_relay(TestRelay::new(), Options::new()).await;
    let alice = Signer::new(1);
    let mallory = Signer::new(2);
    let mut c1 = connect(addr).await;
    let mut c2 = connect(addr).await;

    let note = alice.event(1, now(), vec![], "to be deleted");
    send_value(&mut c1, json!(["EVENT", &note])).await;
    assert_eq!(recv_value(&mut c1).await[2], true);

    // a stranger cannot delete it
    let theirs = mallory.event(
        5,
        now(),
        vec![Tag(vec!["e".into(), note.id.clone()])],
        "",
    );
    send_value(&mut c2, json!(["EVENT", &theirs])).await;
    let ok = recv_value(&mut c2).await;
    assert_eq!(ok[2], false);
    assert_eq!(ok[3], "insufficient permissions");
    let mut probe = connect(addr).await;
    let stored = subscribe(&mut probe, "q", json!({"ids": [note.id]})).await;
    assert_eq!(stored.len(), 1);

    // the author can
    let deletion = alice.event(
        5,
        now(),
        vec![Tag(vec!["e".into(), note.id.clone()])],
        "",
    );
    send_value(&mut c1, json!(["EVENT", &deletion])).await;
    assert_eq!(recv_value(&mut c1).await[2], true);
    let mut probe2 = connect(addr).await;
    let stored = subscribe(&mut probe2, "q", json!({"ids": [note.id]})).await;
    assert!(stored.is_empty());

    server.shutdown().await;
}

#[tokio::test]
async fn ephemeral_events_broadcast_but_never_persist() {
    let relay = TestRelay::new();
    let store = relay.store.clone();
    let (server, addr) = start_relay(relay, Options::new()).await;
    let mut c1 = connect(addr).await;
    let mut c2 = connect(addr).await;
    subscribe(&mut c2, "s1", json!({"kinds": [20001]})).await;

    let ev = Signer::new(1).event(20001, now(), vec![], "beep");
    send_value(&mut c1, json!(["EVENT", &ev])).await;
    assert_eq!(recv_value(&mut c1).await[2], true);

    let live = recv_value(&mut c2).await;
    assert_eq!(live[0], "EVENT");
    assert_eq!(live[2]["id"], ev.id);

    assert!(store.is_empty());
    let mut c3 = connect(addr).await;
    let stored = subscribe(&mut c3, "q", json!({"kinds": [20001]})).await;
    assert!(stored.is_empty());

    server.shutdown().await;
}

#[tokio::test]
async fn duplicate_event_is_acknowledged_as_present() {
    let (server, addr) = start_relay(TestRelay::new(), Options::new()).await;
    let mut c1 = connect(addr).await;
    let ev = Signer::new(1).event(1, now(), vec![], "hi");
    send_value(&mut c1, json!(["EVENT", &ev])).await;
    assert_eq!(recv_value(&mut c1).await[2], true);
    send_value(&mut c1, json!(["EVENT", &ev])).await;
    let ok = recv_value(&mut c1).await;
    assert_eq!(ok[2], true);
    assert_eq!(ok[3], "duplicate: already have this event");
    server.shutdown().await;
}

#[tokio::test]
async fn replaceable_event_supersedes_older_version() {
    let (server, addr) = start_relay(TestRelay::new(), Options::new()).await;
    let alice = Signer::new(1);
    let mut c1 = connect(addr).await;
    let ts = now();
    let old = alice.event(0, ts - 1, vec![], "{\"name\":\"old\"}");
    let new = alice.event(0, ts, vec![], "{\"name\":\"new\"}");
    for ev in [&old, &new] {
        send_value(&mut c1, json!(["EVENT", &ev])).await;
        assert_eq!(recv_value(&mut c1).await[2], true);
    }
    let mut probe = connect(addr).await;
    let stored = subscribe(
        &mut probe,
        "q",
        json!({"kinds": [0], "authors": [alice.pubkey()]}),
    )
    .await;
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0]["id"], new.id);
    server.shutdown().await;
}

#[tokio::test]
async fn close_stops_event_delivery() {
    let (server, addr) = start_relay(TestRelay::new(), Options::new()).await;
    let mut c1 = connect(addr).await;
    let mut c2 = connect(addr).await;
    subscribe(&mut c2, "s1", json!({"kinds": [1]})).await;

    send_value(&mut c2, json!(["CLOSE", "s1"])).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let ev = Signer::new(1).event(1, now(), vec![], "hi");
    send_value(&mut c1, json!(["EVENT", &ev])).await;
    assert_eq!(recv_value(&mut c1).await[2], true);

    assert!(timeout(Duration::from_millis(300), c2.next()).await.is_err());
    server.shutdown().await;
}

#[tokio::test]
async fn limit_zero_yields_immediate_eose() {
    let (server, addr) = start_relay(TestRelay::new(), Options::new()).await;
    let mut c1 = connect(addr).await;
    let ev = Signer::new(1).event(1, now(), vec![], "hi");
    send_value(&mut c1, json!(["EVENT", &ev])).await;
    assert_eq!(recv_value(&mut c1).await[2], true);

    let stored = subscribe(&mut c1, "q", json!({"limit": 0})).await;
    assert!(stored.is_empty());
    server.shutdown().await;
}

#[tokio::test]
async fn count_aggregates_over_filters() {
    let (server, addr) = start_relay(TestRelay::new(), Options::new()).await;
    let alice = Signer::new(1);
    let mut c1 = connect(addr).await;
    let ts = now();
    for i in 0..3u64 {
        let ev = alice.event(1, ts + i, vec![], &format!("note {i}"));
        send_value(&mut c1, json!(["EVENT", &ev])).await;
        assert_eq!(recv_value(&mut c1).await[2], true);
    }
    send_value(&mut c1, json!(["COUNT", "c1", {"kinds": [1]}])).await;
    let count = recv_value(&mut c1).await;
    assert_eq!(count[0], "COUNT");
    assert_eq!(count[1], "c1");
    assert_eq!(count[2]["count"], 3);
    server.shutdown().await;
}

#[tokio::test]
async fn malformed_and_unknown_messages_get_notices() {
    let (server, addr) = start_relay(TestRelay::new(), Options::new()).await;
    let mut c1 = connect(addr).await;

    // silently dropped
    send_value(&mut c1, json!({"not": "an array"})).await;
    ws_send_raw(&mut c1, "not json at all").await;

    // too short
    send_value(&mut c1, json!(["EVENT"])).await;
    let notice = recv_value(&mut c1).await;
    assert_eq!(notice[0], "NOTICE");

    // unknown tag
    send_value(&mut c1, json!(["FROB", "x"])).await;
    let notice = recv_value(&mut c1).await;
    assert_eq!(notice[0], "NOTICE");
    assert_eq!(notice[1], "unknown message type FROB");

    // missing sub id
    send_value(&mut c1, json!(["REQ", "", {}])).await;
    let notice = recv_value(&mut c1).await;
    assert_eq!(notice[0], "NOTICE");
    assert_eq!(notice[1], "REQ has no <id>");

    server.shutdown().await;
}

async fn ws_send_raw(ws: &mut WsStream, text: &str) {
    ws.send(TMessage::Text(text.into())).await.unwrap();
}

#[tokio::test]
async fn oversized_message_closes_the_connection() {
    let (server, addr) = start_relay(TestRelay::new(), Options::new()).await;
    let mut c1 = connect(addr).await;
    let huge = "x".repeat(600 * 1024);
    let _ = c1.send(TMessage::Text(huge)).await;
    let closed = timeout(Duration::from_secs(2), async {
        loop {
            match c1.next().await {
                None | Some(Err(_)) | Some(Ok(TMessage::Close(_))) => break,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "connection stayed open past the size limit");
    server.shutdown().await;
}

#[tokio::test]
async fn auth_gates_direct_message_reads() {
    let port = free_port();
    let url = format!("ws://127.0.0.1:{port}");
    let server = start_relay_on(TestRelay::with_auth(url.clone()), port).await;
    let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
    let alice = Signer::new(1);

    let mut c1 = connect(addr).await;
    let hello = recv_value(&mut c1).await;
    assert_eq!(hello[0], "AUTH");
    let challenge = hello[1].as_str().unwrap().to_string();

    // unauthenticated kind-4 subscription is refused
    send_value(&mut c1, json!(["REQ", "dms", {"kinds": [4]}])).await;
    let notice = recv_value(&mut c1).await;
    assert_eq!(notice[0], "NOTICE");
    assert!(notice[1].as_str().unwrap().starts_with("restricted:"));

    // authenticate
    let auth_event = alice.event(
        22242,
        now(),
        vec![
            Tag(vec!["challenge".into(), challenge]),
            Tag(vec!["relay".into(), url.clone()]),
        ],
        "",
    );
    send_value(&mut c1, json!(["AUTH", &auth_event])).await;
    let ok = recv_value(&mut c1).await;
    assert_eq!(ok[0], "OK");
    assert_eq!(ok[2], true);

    // the authenticated pubkey may read its own DMs
    let stored = subscribe(
        &mut c1,
        "dms",
        json!({"kinds": [4], "authors": [alice.pubkey()]}),
    )
    .await;
    assert!(stored.is_empty());

    // but still not somebody else's
    send_value(
        &mut c1,
        json!(["REQ", "spy", {"kinds": [4], "authors": [Signer::new(2).pubkey()]}]),
    )
    .await;
    let notice = recv_value(&mut c1).await;
    assert!(notice[1].as_str().unwrap().starts_with("restricted:"));

    server.shutdown().await;
}

#[tokio::test]
async fn auth_rejects_wrong_challenge() {
    let port = free_port();
    let url = format!("ws://127.0.0.1:{port}");
    let server = start_relay_on(TestRelay::with_auth(url.clone()), port).await;
    let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();

    let mut c1 = connect(addr).await;
    let hello = recv_value(&mut c1).await;
    assert_eq!(hello[0], "AUTH");

    let auth_event = Signer::new(1).event(
        22242,
        now(),
        vec![
            Tag(vec!["challenge".into(), "wrong".into()]),
            Tag(vec!["relay".into(), url]),
        ],
        "",
    );
    send_value(&mut c1, json!(["AUTH", &auth_event])).await;
    let ok = recv_value(&mut c1).await;
    assert_eq!(ok[0], "OK");
    assert_eq!(ok[2], false);
    assert_eq!(ok[3], "error: failed to authenticate");
    server.shutdown().await;
}

#[tokio::test]
async fn injected_events_reach_live_subscriptions() {
    let (tx, rx) = mpsc::channel(1);
    let (server, addr) = start_relay(TestRelay::with_injector(rx), Options::new()).await;
    let mut c1 = connect(addr).await;
    subscribe(&mut c1, "s1", json!({"kinds": [1]})).await;

    let ev = Signer::new(1).event(1, now(), vec![], "from outside");
    tx.send(ev.clone()).await.unwrap();

    let live = recv_value(&mut c1).await;
    assert_eq!(live[0], "EVENT");
    assert_eq!(live[2]["id"], ev.id);
    server.shutdown().await;
}

#[tokio::test]
async fn broadcast_event_skips_storage() {
    let relay = TestRelay::new();
    let store = relay.store.clone();
    let (server, addr) = start_relay(relay, Options::new()).await;
    let mut c1 = connect(addr).await;
    subscribe(&mut c1, "s1", json!({"kinds": [1]})).await;
    assert_eq!(server.listening_filters().len(), 1);

    let ev = Signer::new(1).event(1, now(), vec![], "side channel");
    server.broadcast_event(&ev).await;

    let live = recv_value(&mut c1).await;
    assert_eq!(live[2]["id"], ev.id);
    assert!(store.is_empty());
    server.shutdown().await;
}

#[tokio::test]
async fn shutdown_closes_clients_promptly() {
    let (server, addr) = start_relay(TestRelay::new(), Options::new()).await;
    let mut c1 = connect(addr).await;
    let mut c2 = connect(addr).await;
    subscribe(&mut c1, "s1", json!({"kinds": [1]})).await;
    subscribe(&mut c2, "s2", json!({"kinds": [1]})).await;

    server.shutdown().await;

    for ws in [&mut c1, &mut c2] {
        let frame = timeout(Duration::from_secs(1), ws.next())
            .await
            .expect("no close frame within 1s");
        match frame {
            Some(Ok(TMessage::Close(_))) | Some(Err(_)) | None => {}
            other => panic!("expected a close, got {other:?}"),
        }
    }
    // teardown runs just after the close frames go out
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.connection_count(), 0);
    assert!(server.listening_filters().is_empty());
}

#[tokio::test]
async fn dropped_connection_is_purged_from_the_registry() {
    let (server, addr) = start_relay(TestRelay::new(), Options::new()).await;
    let mut c1 = connect(addr).await;
    subscribe(&mut c1, "s1", json!({"kinds": [1]})).await;
    assert_eq!(server.listening_filters().len(), 1);

    c1.close(None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(server.listening_filters().is_empty());
    assert_eq!(server.connection_count(), 0);
    server.shutdown().await;
}

#[tokio::test]
async fn rate_limited_events_wait_instead_of_dropping() {
    let options = Options::new().with_per_connection_limit(5, 2);
    let (server, addr) = start_relay(TestRelay::new(), options).await;
    let alice = Signer::new(1);
    let mut c1 = connect(addr).await;
    let ts = now();
    let events: Vec<Event> = (0..4u64)
        .map(|i| alice.event(1, ts + i, vec![], &format!("burst {i}")))
        .collect();
    for ev in &events {
        send_value(&mut c1, json!(["EVENT", ev])).await;
    }
    // every event is eventually acknowledged; none were shed
    let mut accepted = 0;
    for _ in 0..events.len() {
        let ok = recv_value(&mut c1).await;
        assert_eq!(ok[0], "OK");
        assert_eq!(ok[2], true);
        accepted += 1;
    }
    assert_eq!(accepted, events.len());
    server.shutdown().await;
}

#[tokio::test]
async fn auth_deadline_closes_unauthenticated_connections() {
    let port = free_port();
    let url = format!("ws://127.0.0.1:{port}");
    let relay = TestRelay::with_auth(url);
    let server = Arc::new(
        Server::new(relay, Options::new().with_auth_deadline(Duration::from_millis(200))).unwrap(),
    );
    let srv = server.clone();
    tokio::spawn(async move { srv.start("127.0.0.1", port).await.unwrap() });
    while server.local_addr().is_none() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();

    let mut c1 = connect(addr).await;
    let hello = recv_value(&mut c1).await;
    assert_eq!(hello[0], "AUTH");

    // never authenticate; the server hangs up once the deadline passes
    let closed = timeout(Duration::from_secs(2), async {
        loop {
            match c1.next().await {
                None | Some(Err(_)) | Some(Ok(TMessage::Close(_))) => break,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "connection outlived the auth deadline");
    server.shutdown().await;
}
