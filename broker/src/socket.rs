//! The WebSocket fan-out server.
//!
//! Clients connect with their bearer token and (optionally) the last
//! stream entry id they saw. The server replays the user's bounded
//! stream past that id, then forwards live events for the user's room
//! from the global channel. Ordering across the replay/live boundary is
//! best-effort; clients reconcile by `event_id` and `ts`.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use common::id::UserId;
use futures::StreamExt;
use numio_api::server::{LayerConfig, NxQuery, spawn_server_task};
use numio_api_core::error::ApiError;
use numio_api_core::models::EventEnvelope;
use numio_tokio::notify_once::NotifyOnce;
use numio_tokio::task::NxTask;
use serde::Deserialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::context::AppContext;

/// Live events flowing to connected sockets. Production feeds this from
/// the Redis `events:global` channel; tests feed it directly.
#[derive(Clone)]
pub struct EventFeed {
    tx: broadcast::Sender<EventEnvelope>,
}

impl Default for EventFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl EventFeed {
    pub fn new() -> Self {
        Self {
            tx: broadcast::channel(1024).0,
        }
    }

    pub fn publish(&self, envelope: EventEnvelope) {
        let _ = self.tx.send(envelope);
    }

    fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.tx.subscribe()
    }
}

/// Bridges the Redis pub/sub channel into the local [`EventFeed`].
pub fn spawn_redis_relay(
    redis_url: String,
    feed: EventFeed,
    shutdown: NotifyOnce,
) -> NxTask<()> {
    NxTask::spawn("socket-redis-relay", async move {
        let mut backoff = common::backoff::get_backoff_iter();
        loop {
            if shutdown.try_recv() {
                break;
            }
            match relay_once(&redis_url, &feed, shutdown.clone()).await {
                Ok(()) => break,
                Err(e) => {
                    let wait = backoff.next().unwrap();
                    warn!("Relay dropped ({e:#}); retrying in {wait:?}");
                    tokio::time::sleep(wait).await;
                }
            }
        }
    })
}

async fn relay_once(
    redis_url: &str,
    feed: &EventFeed,
    mut shutdown: NotifyOnce,
) -> anyhow::Result<()> {
    let client = redis::Client::open(redis_url)?;
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub
        .subscribe(numio_core::store::redis::GLOBAL_CHANNEL)
        .await?;
    info!("Relay subscribed to the global events channel");

    let mut messages = pubsub.on_message();
    loop {
        tokio::select! {
            () = shutdown.recv() => return Ok(()),
            maybe_message = messages.next() => {
                let Some(message) = maybe_message else {
                    anyhow::bail!("Pub/sub stream ended");
                };
                let raw: String = message.get_payload()?;
                match serde_json::from_str::<EventEnvelope>(&raw) {
                    Ok(envelope) => feed.publish(envelope),
                    Err(e) => warn!("Bad envelope on channel: {e}"),
                }
            }
        }
    }
}

#[derive(Clone)]
struct SocketState {
    ctx: Arc<AppContext>,
    feed: EventFeed,
}

#[derive(Debug, Deserialize)]
struct ConnectParams {
    token: String,
    /// Replay the user stream after this entry id.
    last_id: Option<String>,
}

/// Binds and serves the socket server.
pub async fn serve(
    ctx: Arc<AppContext>,
    feed: EventFeed,
    addr: SocketAddr,
    shutdown: NotifyOnce,
) -> anyhow::Result<(NxTask<()>, SocketAddr)> {
    let router = Router::new()
        .route("/ws", get(upgrade))
        .with_state(SocketState { ctx, feed });
    spawn_server_task(
        addr,
        router,
        LayerConfig {
            // WS sessions are long-lived; a handling timeout would cut
            // them off.
            handling_timeout: None,
            ..LayerConfig::default()
        },
        "socket",
        shutdown,
    )
    .await
}

async fn upgrade(
    State(state): State<SocketState>,
    NxQuery(params): NxQuery<ConnectParams>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let claims = state
        .ctx
        .token_authority
        .verify(&params.token, common::time::TimestampMs::now())?;
    let user_id = claims.sub;

    Ok(ws.on_upgrade(move |socket| {
        session(socket, state, user_id, params.last_id)
    }))
}

async fn session(
    mut socket: WebSocket,
    state: SocketState,
    user_id: UserId,
    last_id: Option<String>,
) {
    let room = format!("user:{user_id}");
    debug!("Socket session open for {room}");

    // Subscribe *before* replay so nothing falls between the two.
    let mut live = state.feed.subscribe();

    // Replay the bounded stream past the client's cursor.
    match state
        .ctx
        .transport
        .read_user_stream(user_id, last_id.as_deref(), 100)
        .await
    {
        Ok(entries) =>
            for (_entry_id, envelope) in entries {
                if send_envelope(&mut socket, &envelope).await.is_err() {
                    return;
                }
            },
        Err(e) => warn!("Replay failed for {room}: {e}"),
    }

    let mut shutdown = state.ctx.shutdown.clone();
    loop {
        tokio::select! {
            () = shutdown.recv() => break,
            // Drain client frames so pings are answered; clients don't
            // send us anything meaningful.
            incoming = socket.recv() => match incoming {
                None | Some(Err(_)) => break,
                Some(Ok(Message::Close(_))) => break,
                Some(Ok(_)) => (),
            },
            event = live.recv() => match event {
                Ok(envelope) if envelope.room == room => {
                    if send_envelope(&mut socket, &envelope)
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                // Not our room, or we lagged: keep going.
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) =>
                    (),
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    debug!("Socket session closed for {room}");
}

async fn send_envelope(
    socket: &mut WebSocket,
    envelope: &EventEnvelope,
) -> Result<(), axum::Error> {
    let json = serde_json::to_string(envelope)
        .expect("Envelope serialization can't fail");
    socket.send(Message::Text(json.into())).await
}
