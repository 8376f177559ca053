//! Demonstration HTTP server wiring `pushcast::Broker` into axum routes:
//! publish, subscribe (chunked or SSE), delete, and stats.
//!
//! Mirrors the teacher's `main.rs`/`app.rs` split: `main` just calls into a
//! small `run()` that loads config, initializes logging, and starts the
//! server.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::{Path as AxumPath, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use clap::Parser;
use serde::Deserialize;
use tower_http::trace::TraceLayer;

use tokio::sync::mpsc;

use pushcast::template::{chunk_wrap, final_chunk};
use pushcast::{Broker, BrokerConfig, Message, WorkerSlot};
use pushcast::subscriber::{last_seen_from_etag, LongPollOutcome, ResponseSink, StreamHandle};

/// Adapts the chunked-transfer wire format onto the library's `ResponseSink`
/// boundary: every write becomes one HTTP chunk, `finalize` writes the
/// terminating zero-length chunk.
struct ChunkedSink(mpsc::UnboundedSender<std::io::Result<Bytes>>);

impl ResponseSink for ChunkedSink {
    type Error = ();

    async fn write_chunk(&mut self, bytes: Bytes) -> Result<(), ()> {
        self.0.send(Ok(chunk_wrap(&bytes))).map_err(|_| ())
    }

    async fn finalize(&mut self) {
        let _ = self.0.send(Ok(final_chunk()));
    }
}

const ENV_LOG: &str = "PUSHCAST_LOG";

#[derive(Parser)]
#[command(name = "pushcast-demo")]
#[command(version, about = "Demo server for the pushcast publish/subscribe broker", long_about = None)]
struct Cli {
    /// Server host address
    #[arg(long, short = 'H', env = "PUSHCAST_HOST")]
    host: Option<String>,

    /// Server port
    #[arg(long, short = 'p', env = "PUSHCAST_PORT")]
    port: Option<u16>,

    /// Path to a JSON config file
    #[arg(long, short = 'c', env = "PUSHCAST_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_logging();

    let cli = Cli::parse();
    let mut config = BrokerConfig::load(cli.config.as_deref())?;
    if config.max_messages.is_none() {
        // Keep the demo's default footprint bounded unless overridden.
        config.max_messages = Some(200);
    }

    let host = cli.host.unwrap_or_else(|| pushcast::constants::DEFAULT_HOST.to_string());
    let port = cli.port.unwrap_or(pushcast::constants::DEFAULT_PORT);

    let broker = Arc::new(Broker::new(config));
    let _timers = broker.spawn_background_tasks();

    let app = Router::new()
        .route("/channels/{channel}/publish", post(publish))
        .route("/channels/{channel}/subscribe", get(subscribe))
        .route("/channels/{channel}", axum::routing::delete(delete_channel))
        .route("/channels/{channel}/stats", get(channel_stats))
        .route("/stats", get(global_stats))
        .layer(TraceLayer::new_for_http())
        .with_state(broker);

    let addr: SocketAddr = format!("{host}:{port}").parse().context("invalid host/port")?;
    tracing::info!(%addr, "pushcast demo server listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn init_logging() {
    let filter = std::env::var(ENV_LOG)
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| "info,pushcast=debug".to_string());

    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(false)
        .with_level(true)
        .compact()
        .with_env_filter(filter)
        .init();
}

#[derive(Deserialize)]
struct PublishBody {
    text: String,
    #[serde(default)]
    event_id: Option<String>,
}

async fn publish(
    State(broker): State<Arc<Broker>>,
    AxumPath(channel): AxumPath<String>,
    Json(body): Json<PublishBody>,
) -> Response {
    match broker
        .publish(channel.as_bytes(), Bytes::from(body.text.into_bytes()), body.event_id)
        .await
    {
        Ok(message) => (StatusCode::OK, Json(serde_json::json!({ "id": message.id }))).into_response(),
        Err(e) => broker_error_response(e),
    }
}

async fn delete_channel(State(broker): State<Arc<Broker>>, AxumPath(channel): AxumPath<String>) -> Response {
    match broker.delete_channel(channel.as_bytes()).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => broker_error_response(e),
    }
}

async fn channel_stats(State(broker): State<Arc<Broker>>, AxumPath(channel): AxumPath<String>) -> Response {
    match broker.stats(channel.as_bytes()) {
        Some(stats) => Json(serde_json::json!({
            "stored_messages": stats.stored_messages,
            "subscribers": stats.subscribers,
            "worker_count": stats.worker_count,
            "broadcast": stats.broadcast,
        }))
        .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn global_stats(State(broker): State<Arc<Broker>>) -> Response {
    let stats = broker.global_stats();
    Json(serde_json::json!({
        "live_channels": stats.live_channels,
        "trash_channels": stats.trash_channels,
        "unrecoverable_channels": stats.unrecoverable_channels,
        "total_subscribers": stats.total_subscribers,
        "total_stored_messages": stats.total_stored_messages,
    }))
    .into_response()
}

#[derive(Deserialize)]
struct SubscribeQuery {
    #[serde(default)]
    worker: u32,
    /// Long-poll subscribers wait for at most one batch of messages (or the
    /// disconnect interval) and return a plain response instead of a
    /// chunked stream; see spec.md §6's long-poll timeout wire format.
    #[serde(default)]
    longpoll: bool,
}

/// Long-lived subscribe endpoint: streaming (chunked, default) or long-poll
/// (`?longpoll=true`). A real deployment would pick the worker slot from
/// the connection's load-balanced process; the demo takes it as a query
/// parameter so a client can exercise multi-worker fan-out.
async fn subscribe(
    State(broker): State<Arc<Broker>>,
    AxumPath(channel): AxumPath<String>,
    Query(query): Query<SubscribeQuery>,
    headers: HeaderMap,
) -> Response {
    let etag = headers
        .get(axum::http::header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok());
    let last_seen = last_seen_from_etag(etag);

    let subscription = match broker.subscribe(channel.as_bytes(), WorkerSlot(query.worker), last_seen).await {
        Ok(s) => s,
        Err(e) => return broker_error_response(e),
    };

    let mut stream = StreamHandle::new(broker.clone(), subscription.handle, subscription.receiver, 0);
    let backlog = subscription.backlog;

    if query.longpoll {
        return long_poll_response(stream, backlog, last_seen).await;
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<std::io::Result<Bytes>>();
    tokio::spawn(async move {
        let _ = stream.drive(backlog, ChunkedSink(tx)).await;
    });

    let body_stream = async_stream::stream! {
        while let Some(item) = rx.recv().await {
            yield item;
        }
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(axum::http::header::TRANSFER_ENCODING, "chunked")
        .header(axum::http::header::CONTENT_TYPE, "text/plain")
        .body(Body::from_stream(body_stream))
        .unwrap()
        .into_response()
}

/// spec.md §8 scenario 6: a long-poll subscriber with nothing new by the
/// time the disconnect timer fires gets a 304 with `Last-Modified` set to
/// now and `Etag` set to the last message id it had seen.
async fn long_poll_response(mut stream: StreamHandle, backlog: Vec<Arc<Message>>, last_seen: i64) -> Response {
    match stream.await_long_poll(backlog).await {
        LongPollOutcome::Messages(parts) => {
            let mut body = bytes::BytesMut::new();
            for part in parts {
                body.extend_from_slice(&part);
            }
            (StatusCode::OK, body.freeze()).into_response()
        }
        LongPollOutcome::ChannelDeleted(bytes) => (StatusCode::OK, bytes).into_response(),
        LongPollOutcome::TimedOut => {
            let now = chrono::Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
            Response::builder()
                .status(StatusCode::NOT_MODIFIED)
                .header(axum::http::header::LAST_MODIFIED, now)
                .header(axum::http::header::ETAG, format!("\"{last_seen}\""))
                .body(Body::empty())
                .unwrap()
        }
    }
}

fn broker_error_response(err: pushcast::BrokerError) -> Response {
    use pushcast::BrokerError::*;
    let status = match err {
        ChannelNotFound(_) | ChannelCreationDisabled(_) => StatusCode::NOT_FOUND,
        OutOfMemory => StatusCode::SERVICE_UNAVAILABLE,
        Config(_) | Template(_) => StatusCode::INTERNAL_SERVER_ERROR,
        PeerWrite | Disconnected => StatusCode::BAD_GATEWAY,
    };
    (status, err.to_string()).into_response()
}
