//! Relay binary smoke tests: env configuration, persistence, and `--clean`.

use std::net::TcpListener;
use std::process::{Child, Command};
use std::time::Duration;

use assert_cmd::prelude::*;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tempfile::TempDir;
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use guildr::crypto::Keys;
use guildr::event::{genesis_event, Access};
use guildr::proto::{self, Hello, Publish, Sub, PROTOCOL};

type Socket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn spawn_relay(dir: &TempDir, port: u16, clean: bool) -> Child {
    let mut cmd = Command::cargo_bin("guildr").unwrap();
    cmd.env("PORT", port.to_string())
        .env("DB", dir.path().join("db"))
        .env("PRUNE_INTERVAL_SECS", "3600")
        .env("CHECKPOINT_INTERVAL_SECS", "3600")
        .args(["--env", "/nonexistent/.env"]);
    if clean {
        cmd.arg("--clean");
    }
    cmd.spawn().unwrap()
}

async fn connect(port: u16) -> Socket {
    let url = format!("ws://127.0.0.1:{port}/");
    for _ in 0..50 {
        if let Ok((socket, _)) = connect_async(&url).await {
            return socket;
        }
        sleep(Duration::from_millis(100)).await;
    }
    panic!("relay did not come up on {port}");
}

async fn send(socket: &mut Socket, frame: String) {
    socket.send(Message::Text(frame)).await.unwrap();
}

async fn recv_frame(socket: &mut Socket) -> (String, Value) {
    let msg = tokio::time::timeout(Duration::from_secs(3), socket.next())
        .await
        .expect("timed out")
        .expect("socket closed")
        .unwrap();
    match msg {
        Message::Text(txt) => proto::parse(&txt).unwrap(),
        other => panic!("unexpected message {other:?}"),
    }
}

fn sub_frame(guild_id: &str) -> String {
    proto::frame(
        "SUB",
        &Sub {
            sub_id: "s1".into(),
            guild_id: guild_id.into(),
            channels: None,
            from_seq: None,
            limit: None,
        },
    )
}

#[tokio::test]
async fn serve_persists_and_clean_wipes() {
    let dir = TempDir::new().unwrap();
    let keys = Keys::generate();
    let genesis = genesis_event(&keys, "G", None, Access::Public, 1_000);
    let gid = genesis.id.clone();

    // First run: handshake and publish a guild.
    let port = free_port();
    let mut child = spawn_relay(&dir, port, false);
    let mut socket = connect(port).await;
    send(
        &mut socket,
        proto::frame(
            "HELLO",
            &Hello {
                protocol: PROTOCOL.into(),
                client_name: Some("smoke".into()),
                client_version: None,
            },
        ),
    )
    .await;
    let (kind, payload) = recv_frame(&mut socket).await;
    assert_eq!(kind, "HELLO_OK");
    assert_eq!(payload["protocol"], PROTOCOL);

    send(
        &mut socket,
        proto::frame(
            "PUBLISH",
            &Publish {
                body: genesis.body,
                author: genesis.author,
                signature: genesis.signature,
                created_at: genesis.created_at,
            },
        ),
    )
    .await;
    let (kind, payload) = recv_frame(&mut socket).await;
    assert_eq!(kind, "EVENT");
    assert_eq!(payload["id"], gid.as_str());
    drop(socket);
    child.kill().unwrap();
    let _ = child.wait();

    // Second run on the same DB: the log survived.
    let port = free_port();
    let mut child = spawn_relay(&dir, port, false);
    let mut socket = connect(port).await;
    send(&mut socket, sub_frame(&gid)).await;
    let (kind, payload) = recv_frame(&mut socket).await;
    assert_eq!(kind, "SNAPSHOT");
    assert_eq!(payload["events"].as_array().unwrap().len(), 1);
    assert_eq!(payload["endSeq"], 0);
    drop(socket);
    child.kill().unwrap();
    let _ = child.wait();

    // Third run with --clean: the log is gone.
    let port = free_port();
    let mut child = spawn_relay(&dir, port, true);
    let mut socket = connect(port).await;
    send(&mut socket, sub_frame(&gid)).await;
    let (kind, payload) = recv_frame(&mut socket).await;
    assert_eq!(kind, "SNAPSHOT");
    assert!(payload["events"].as_array().unwrap().is_empty());
    drop(socket);
    child.kill().unwrap();
    let _ = child.wait();
}

#[tokio::test]
async fn invalid_frames_do_not_kill_the_connection() {
    let dir = TempDir::new().unwrap();
    let port = free_port();
    let mut child = spawn_relay(&dir, port, false);
    let mut socket = connect(port).await;
    send(&mut socket, "garbage".into()).await;
    let (kind, payload) = recv_frame(&mut socket).await;
    assert_eq!(kind, "ERROR");
    assert_eq!(payload["code"], "INVALID_FRAME");
    send(&mut socket, sub_frame(&"ab".repeat(32))).await;
    let (kind, _) = recv_frame(&mut socket).await;
    assert_eq!(kind, "SNAPSHOT");
    drop(socket);
    child.kill().unwrap();
    let _ = child.wait();
}
