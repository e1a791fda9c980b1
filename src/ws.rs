//! WebSocket relay endpoint.
//!
//! One task per socket reads frames in order; outbound frames go through an
//! unbounded per-socket queue drained by a writer task, so broadcast never
//! blocks on a slow connection.

use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::engine::{Engine, SubSpec};
use crate::proto::{self, ErrorCode, Hello, HelloOk, Publish, Snapshot, Sub, Unsub, PROTOCOL};

/// Start the relay WebSocket server.
pub async fn serve_ws(
    addr: SocketAddr,
    engine: Arc<Engine>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let app = Router::new().route("/", get(handler)).with_state(engine);
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Handle the HTTP upgrade and spawn the connection processor.
async fn handler(ws: WebSocketUpgrade, State(engine): State<Arc<Engine>>) -> impl IntoResponse {
    ws.on_upgrade(|socket| async move { process(socket, engine).await })
}

/// Process one connection until it closes, then garbage-collect its
/// subscriptions.
async fn process(socket: WebSocket, engine: Arc<Engine>) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let conn = engine.registry().register(tx);

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if sink.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = stream.next().await {
        if let Message::Text(txt) = msg {
            handle_frame(&engine, conn, &txt).await;
        }
    }

    engine.registry().unregister(conn);
    writer.abort();
    debug!(conn, "socket closed");
}

/// Dispatch one inbound frame. Malformed input answers `INVALID_FRAME` and
/// leaves the socket open.
async fn handle_frame(engine: &Engine, conn: u64, text: &str) {
    let (kind, payload) = match proto::parse(text) {
        Ok(parsed) => parsed,
        Err(e) => {
            reply(
                engine,
                conn,
                proto::error_frame(ErrorCode::InvalidFrame, e.to_string()),
            );
            return;
        }
    };
    match kind.as_str() {
        "HELLO" => match serde_json::from_value::<Hello>(payload) {
            Ok(hello) if hello.protocol == PROTOCOL => {
                let ok = HelloOk {
                    protocol: PROTOCOL.to_string(),
                    relay_name: Some(engine.relay_name().to_string()),
                    relay_version: Some(env!("CARGO_PKG_VERSION").to_string()),
                    features: Some(vec!["sub".into(), "publish".into(), "checkpoint".into()]),
                };
                reply(engine, conn, proto::frame("HELLO_OK", &ok));
            }
            Ok(hello) => {
                reply(
                    engine,
                    conn,
                    proto::error_frame(
                        ErrorCode::UnsupportedProtocol,
                        format!("unsupported protocol {}", hello.protocol),
                    ),
                );
            }
            Err(e) => {
                reply(
                    engine,
                    conn,
                    proto::error_frame(ErrorCode::InvalidFrame, e.to_string()),
                );
            }
        },
        "SUB" => match serde_json::from_value::<Sub>(payload) {
            Ok(sub) => {
                // Register before reading the log so nothing falls between
                // the snapshot and the live stream; replicas dedup overlap.
                engine.registry().subscribe(
                    conn,
                    sub.sub_id.clone(),
                    SubSpec {
                        guild_id: sub.guild_id.clone(),
                        channels: sub.channels.clone(),
                    },
                );
                match engine.snapshot(&sub.guild_id, sub.from_seq, sub.limit) {
                    Ok((events, end_seq)) => {
                        let snapshot = Snapshot {
                            sub_id: sub.sub_id,
                            guild_id: sub.guild_id,
                            events,
                            end_seq,
                        };
                        reply(engine, conn, proto::frame("SNAPSHOT", &snapshot));
                    }
                    Err(e) => {
                        warn!(guild = %sub.guild_id, "snapshot failed: {e}");
                        engine.registry().unsubscribe(conn, &sub.sub_id);
                        reply(
                            engine,
                            conn,
                            proto::error_frame(ErrorCode::InternalError, "snapshot failed"),
                        );
                    }
                }
            }
            Err(e) => {
                reply(
                    engine,
                    conn,
                    proto::error_frame(ErrorCode::InvalidFrame, e.to_string()),
                );
            }
        },
        "UNSUB" => match serde_json::from_value::<Unsub>(payload) {
            Ok(unsub) => engine.registry().unsubscribe(conn, &unsub.sub_id),
            Err(e) => {
                reply(
                    engine,
                    conn,
                    proto::error_frame(ErrorCode::InvalidFrame, e.to_string()),
                );
            }
        },
        "PUBLISH" => match serde_json::from_value::<Publish>(payload) {
            Ok(publish) => {
                if let Err(e) = engine.ingest_guarded(publish, Some(conn)).await {
                    reply(engine, conn, proto::error_frame(e.code(), e.to_string()));
                }
            }
            Err(e) => {
                reply(
                    engine,
                    conn,
                    proto::error_frame(ErrorCode::InvalidFrame, e.to_string()),
                );
            }
        },
        other => {
            reply(
                engine,
                conn,
                proto::error_frame(ErrorCode::InvalidFrame, format!("unknown frame kind {other}")),
            );
        }
    }
}

fn reply(engine: &Engine, conn: u64, frame: String) {
    engine.registry().send_to(conn, frame);
}
