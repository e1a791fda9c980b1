//! End-to-end relay scenarios over real WebSocket connections.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use guildr::crypto::Keys;
use guildr::engine::{Engine, Registry};
use guildr::event::{
    channel_id, genesis_event, sign_body, validate_chain, Access, ChannelKind, Event, EventBody,
};
use guildr::proto::{self, Publish, Sub};
use guildr::state::GuildState;
use guildr::store::{LogStore, MemoryStore};
use guildr::ws;

type Socket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

async fn spawn_relay() -> (Arc<Engine>, String) {
    let store: Arc<dyn LogStore> = Arc::new(MemoryStore::new());
    let engine = Arc::new(Engine::new(store, Arc::new(Registry::new()), None));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    let serve_engine = engine.clone();
    tokio::spawn(async move {
        ws::serve_ws(addr, serve_engine, std::future::pending())
            .await
            .unwrap();
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    (engine, format!("ws://{}/", addr))
}

async fn connect(url: &str) -> Socket {
    let (socket, _) = connect_async(url).await.unwrap();
    socket
}

async fn send(socket: &mut Socket, frame: String) {
    socket.send(Message::Text(frame)).await.unwrap();
}

async fn recv_frame(socket: &mut Socket) -> (String, Value) {
    let msg = tokio::time::timeout(Duration::from_secs(3), socket.next())
        .await
        .expect("timed out waiting for frame")
        .expect("socket closed")
        .unwrap();
    match msg {
        Message::Text(txt) => proto::parse(&txt).unwrap(),
        other => panic!("unexpected message {other:?}"),
    }
}

fn publish_frame(keys: &Keys, body: EventBody, created_at: u64) -> String {
    let publish = Publish {
        signature: sign_body(keys, &body, created_at),
        author: keys.public_hex(),
        body,
        created_at,
    };
    proto::frame("PUBLISH", &publish)
}

fn genesis_frame(keys: &Keys) -> (String, String) {
    let g = genesis_event(keys, "G", None, Access::Public, 1_000);
    let frame = proto::frame(
        "PUBLISH",
        &Publish {
            body: g.body,
            author: g.author,
            signature: g.signature,
            created_at: g.created_at,
        },
    );
    (g.id, frame)
}

fn sub_frame(sub_id: &str, guild_id: &str) -> String {
    proto::frame(
        "SUB",
        &Sub {
            sub_id: sub_id.into(),
            guild_id: guild_id.into(),
            channels: None,
            from_seq: None,
            limit: None,
        },
    )
}

#[tokio::test]
async fn basic_message_reaches_subscriber_in_order() {
    let (_engine, url) = spawn_relay().await;
    let alice = Keys::generate();
    let (gid, genesis) = genesis_frame(&alice);

    // Bob subscribes before the guild exists: empty snapshot, then live.
    let mut bob = connect(&url).await;
    send(&mut bob, sub_frame("s1", &gid)).await;
    let (kind, payload) = recv_frame(&mut bob).await;
    assert_eq!(kind, "SNAPSHOT");
    assert!(payload["events"].as_array().unwrap().is_empty());

    let mut publisher = connect(&url).await;
    send(&mut publisher, genesis).await;
    let cid = channel_id(&gid, "general", ChannelKind::Text, "salt");
    send(
        &mut publisher,
        publish_frame(
            &alice,
            EventBody::ChannelCreate {
                guild_id: gid.clone(),
                channel_id: cid.clone(),
                name: "general".into(),
                kind: ChannelKind::Text,
                retention: None,
            },
            1_001,
        ),
    )
    .await;
    send(
        &mut publisher,
        publish_frame(
            &alice,
            EventBody::Message {
                guild_id: gid.clone(),
                channel_id: cid,
                message_id: "m1".into(),
                content: "hello".into(),
                reply_to: None,
            },
            1_002,
        ),
    )
    .await;

    let mut received = Vec::new();
    for expected_seq in 0..3u64 {
        let (kind, payload) = recv_frame(&mut bob).await;
        assert_eq!(kind, "EVENT");
        assert_eq!(payload["seq"], expected_seq);
        received.push(serde_json::from_value::<Event>(payload).unwrap());
    }
    assert!(validate_chain(&received));
    let state = GuildState::fold(&received).unwrap();
    assert_eq!(state.owner_id, alice.public_hex());
    assert_eq!(state.channels.len(), 1);
    assert_eq!(
        state.channels.values().next().unwrap().name,
        "general".to_string()
    );
}

#[tokio::test]
async fn unauthorized_channel_create_is_rejected() {
    let (engine, url) = spawn_relay().await;
    let owner = Keys::generate();
    let attacker = Keys::generate();

    let mut socket = connect(&url).await;
    let (gid, genesis) = genesis_frame(&owner);
    send(&mut socket, genesis).await;
    let (kind, _) = recv_frame(&mut socket).await;
    assert_eq!(kind, "EVENT");

    let before = engine.store().get_log(&gid).unwrap().len();
    let mut evil = connect(&url).await;
    send(
        &mut evil,
        publish_frame(
            &attacker,
            EventBody::ChannelCreate {
                guild_id: gid.clone(),
                channel_id: "backdoor".into(),
                name: "backdoor".into(),
                kind: ChannelKind::Text,
                retention: None,
            },
            2_000,
        ),
    )
    .await;
    let (kind, payload) = recv_frame(&mut evil).await;
    assert_eq!(kind, "ERROR");
    assert_eq!(payload["code"], "VALIDATION_FAILED");
    assert!(payload["message"].as_str().unwrap().contains("permission"));
    assert_eq!(engine.store().get_log(&gid).unwrap().len(), before);
}

#[tokio::test]
async fn concurrent_publishes_yield_dense_seqs() {
    let (engine, url) = spawn_relay().await;
    let owner = Keys::generate();

    let mut setup = connect(&url).await;
    let (gid, genesis) = genesis_frame(&owner);
    send(&mut setup, genesis).await;
    let cid = channel_id(&gid, "general", ChannelKind::Text, "salt");
    send(
        &mut setup,
        publish_frame(
            &owner,
            EventBody::ChannelCreate {
                guild_id: gid.clone(),
                channel_id: cid.clone(),
                name: "general".into(),
                kind: ChannelKind::Text,
                retention: None,
            },
            1_001,
        ),
    )
    .await;
    recv_frame(&mut setup).await;
    recv_frame(&mut setup).await;
    let start_seq = engine.store().head(&gid).unwrap().unwrap().seq;

    // Ten racing sockets, one authorized author.
    let mut handles = Vec::new();
    for n in 0..10u64 {
        let url = url.clone();
        let frame = publish_frame(
            &owner,
            EventBody::Message {
                guild_id: gid.clone(),
                channel_id: cid.clone(),
                message_id: format!("m{n}"),
                content: format!("msg {n}"),
                reply_to: None,
            },
            2_000 + n,
        );
        handles.push(tokio::spawn(async move {
            let mut socket = connect(&url).await;
            send(&mut socket, frame).await;
            // Wait for the echo so the publish has fully landed.
            let (kind, _) = recv_frame(&mut socket).await;
            assert_eq!(kind, "EVENT");
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let log = engine.store().get_log(&gid).unwrap();
    assert!(validate_chain(&log));
    assert_eq!(engine.store().head(&gid).unwrap().unwrap().seq, start_seq + 10);
    assert_eq!(log.iter().filter(|ev| ev.body.is_message()).count(), 10);
}

#[tokio::test]
async fn forged_signature_is_rejected() {
    let (engine, url) = spawn_relay().await;
    let owner = Keys::generate();
    let forger = Keys::generate();

    let mut socket = connect(&url).await;
    let (gid, genesis) = genesis_frame(&owner);
    send(&mut socket, genesis).await;
    recv_frame(&mut socket).await;

    // Body claims the owner as author but carries the forger's signature.
    let body = EventBody::BanUser {
        guild_id: gid.clone(),
        user_id: "02ab".into(),
        reason: None,
    };
    let publish = Publish {
        signature: sign_body(&forger, &body, 2_000),
        author: owner.public_hex(),
        body,
        created_at: 2_000,
    };
    send(&mut socket, proto::frame("PUBLISH", &publish)).await;
    let (kind, payload) = recv_frame(&mut socket).await;
    assert_eq!(kind, "ERROR");
    assert_eq!(payload["code"], "INVALID_SIGNATURE");
    assert_eq!(engine.store().get_log(&gid).unwrap().len(), 1);
}
