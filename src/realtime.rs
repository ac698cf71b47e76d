//! Realtime subscriber.
//!
//! Keeps one Phoenix channel open on the hosted realtime websocket for the
//! current (date, store) scope and applies `postgres_changes` events to the
//! in-memory orders. The server filters on `date`; the store is filtered
//! here. Missed events are not replayed after a reconnect.

use futures_util::{Sink, SinkExt, StreamExt};
use serde_json::{json, Value};
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::RemoteConfig;
use crate::context::{AppContext, Scope};
use crate::models::{Order, SyncStatus};

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);
pub const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const PHOENIX_TOPIC: &str = "phoenix";
const ORDERS_TABLE: &str = "orders";

// ---------------------------------------------------------------------------
// Wire messages
// ---------------------------------------------------------------------------

pub fn channel_topic(scope: &Scope) -> String {
    format!("realtime:{ORDERS_TABLE}:{}:{}", scope.date, scope.store_id)
}

pub fn join_message(scope: &Scope, access_token: &str, msg_ref: u64) -> Value {
    json!({
        "topic": channel_topic(scope),
        "event": "phx_join",
        "payload": {
            "config": {
                "broadcast": { "self": false },
                "presence": { "key": "" },
                "postgres_changes": [{
                    "event": "*",
                    "schema": "public",
                    "table": ORDERS_TABLE,
                    "filter": format!("date=eq.{}", scope.date),
                }],
            },
            "access_token": access_token,
        },
        "ref": msg_ref.to_string(),
        "join_ref": msg_ref.to_string(),
    })
}

pub fn heartbeat_message(msg_ref: u64) -> Value {
    json!({
        "topic": PHOENIX_TOPIC,
        "event": "heartbeat",
        "payload": {},
        "ref": msg_ref.to_string(),
    })
}

pub fn leave_message(topic: &str, msg_ref: u64) -> Value {
    json!({
        "topic": topic,
        "event": "phx_leave",
        "payload": {},
        "ref": msg_ref.to_string(),
    })
}

/// A row change delivered on the channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    Upsert(Order),
    /// `store_id` is only present when the table replicates full old rows.
    Delete { id: String, store_id: Option<String> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelMessage {
    Joined,
    JoinFailed(String),
    Change(ChangeEvent),
    ChannelError(String),
    Closed,
    Ignored,
}

/// Decode one text frame addressed to `topic`. Frames for other topics
/// (heartbeat replies) and anything malformed are [`ChannelMessage::Ignored`].
pub fn decode_message(text: &str, topic: &str) -> ChannelMessage {
    let Ok(frame) = serde_json::from_str::<Value>(text) else {
        debug!("undecodable realtime frame");
        return ChannelMessage::Ignored;
    };
    if frame.get("topic").and_then(Value::as_str) != Some(topic) {
        return ChannelMessage::Ignored;
    }
    let payload = frame.get("payload").cloned().unwrap_or(Value::Null);
    let status = payload.get("status").and_then(Value::as_str);

    match frame.get("event").and_then(Value::as_str).unwrap_or_default() {
        "phx_reply" => match status {
            Some("ok") => ChannelMessage::Joined,
            _ => ChannelMessage::JoinFailed(
                payload
                    .pointer("/response/reason")
                    .and_then(Value::as_str)
                    .unwrap_or("join rejected")
                    .to_string(),
            ),
        },
        "system" if status == Some("error") => ChannelMessage::ChannelError(
            payload
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("subscription error")
                .to_string(),
        ),
        "postgres_changes" => decode_change(payload.get("data").unwrap_or(&Value::Null))
            .map(ChannelMessage::Change)
            .unwrap_or(ChannelMessage::Ignored),
        "phx_error" => ChannelMessage::ChannelError("channel error".to_string()),
        "phx_close" => ChannelMessage::Closed,
        _ => ChannelMessage::Ignored,
    }
}

fn decode_change(data: &Value) -> Option<ChangeEvent> {
    match data.get("type").and_then(Value::as_str)? {
        "INSERT" | "UPDATE" => {
            let record = data.get("record")?.clone();
            match serde_json::from_value::<Order>(record) {
                Ok(order) => Some(ChangeEvent::Upsert(order)),
                Err(e) => {
                    warn!(error = %e, "realtime record not an order row");
                    None
                }
            }
        }
        "DELETE" => {
            let old = data.get("old_record")?;
            let id = match old.get("id")? {
                Value::String(s) if !s.is_empty() => s.clone(),
                Value::Number(n) => n.to_string(),
                _ => return None,
            };
            let store_id = old
                .get("store_id")
                .and_then(Value::as_str)
                .map(String::from);
            Some(ChangeEvent::Delete { id, store_id })
        }
        _ => None,
    }
}

/// Apply a change for `scope`. Rows of another date or store are skipped.
/// Returns whether in-memory state changed.
pub fn apply_change(ctx: &AppContext, scope: &Scope, event: ChangeEvent) -> bool {
    let applied = match event {
        ChangeEvent::Upsert(order) => {
            if order.date != scope.date || order.store_id() != scope.store_id {
                debug!(date = %order.date, store_id = %order.store_id(), "change outside scope skipped");
                return false;
            }
            ctx.update_order(order);
            true
        }
        ChangeEvent::Delete { id, store_id } => {
            if store_id.as_deref().is_some_and(|s| s != scope.store_id) {
                return false;
            }
            ctx.remove_order(&id)
        }
    };
    ctx.status().set(SyncStatus::Ready);
    applied
}

// ---------------------------------------------------------------------------
// Subscription loop
// ---------------------------------------------------------------------------

enum SessionEnd {
    ScopeChanged,
    Shutdown,
    Dropped(String),
}

pub struct RealtimeSubscriber {
    handle: JoinHandle<()>,
}

impl RealtimeSubscriber {
    /// Start following the context's scope until `shutdown` fires.
    pub fn spawn(ctx: Arc<AppContext>, config: &RemoteConfig, shutdown: CancellationToken) -> Self {
        let worker = Worker {
            ctx,
            url: config.realtime_url(),
            access_token: config.anon_key.clone(),
            shutdown,
            backoff: RECONNECT_BACKOFF,
        };
        Self {
            handle: tokio::spawn(worker.run()),
        }
    }

    pub async fn join(self) {
        if let Err(e) = self.handle.await {
            warn!(error = %e, "realtime task failed");
        }
    }
}

struct Worker {
    ctx: Arc<AppContext>,
    url: String,
    access_token: String,
    shutdown: CancellationToken,
    backoff: Duration,
}

impl Worker {
    async fn run(self) {
        let mut scope_rx = self.ctx.watch_scope();
        loop {
            let scope = scope_rx.borrow_and_update().clone();
            let subscription = Uuid::new_v4();
            match self.session(&scope, subscription, &mut scope_rx).await {
                SessionEnd::Shutdown => break,
                SessionEnd::ScopeChanged => {
                    debug!(%subscription, "scope changed, resubscribing");
                }
                SessionEnd::Dropped(reason) => {
                    warn!(%subscription, %reason, "realtime channel dropped");
                    self.ctx.status().set(SyncStatus::Offline);
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        changed = scope_rx.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                        _ = tokio::time::sleep(self.backoff) => {}
                    }
                }
            }
        }
        info!("realtime subscriber stopped");
    }

    async fn session(
        &self,
        scope: &Scope,
        subscription: Uuid,
        scope_rx: &mut watch::Receiver<Scope>,
    ) -> SessionEnd {
        let ws = match timeout(CONNECT_TIMEOUT, connect_async(self.url.as_str())).await {
            Ok(Ok((ws, _))) => ws,
            Ok(Err(e)) => return SessionEnd::Dropped(format!("connect failed: {e}")),
            Err(_) => return SessionEnd::Dropped("connect timed out".to_string()),
        };
        let (mut write, mut read) = ws.split();

        let topic = channel_topic(scope);
        let mut next_ref = 1u64;
        if let Err(e) = send_json(&mut write, &join_message(scope, &self.access_token, next_ref)).await {
            return SessionEnd::Dropped(e);
        }
        info!(%subscription, %topic, "realtime join sent");

        let mut heartbeat = interval_at(Instant::now() + HEARTBEAT_INTERVAL, HEARTBEAT_INTERVAL);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    next_ref += 1;
                    leave(&mut write, &topic, next_ref).await;
                    return SessionEnd::Shutdown;
                }
                changed = scope_rx.changed() => {
                    next_ref += 1;
                    leave(&mut write, &topic, next_ref).await;
                    info!(%subscription, %topic, "realtime channel left");
                    return if changed.is_err() {
                        SessionEnd::Shutdown
                    } else {
                        SessionEnd::ScopeChanged
                    };
                }
                _ = heartbeat.tick() => {
                    next_ref += 1;
                    if let Err(e) = send_json(&mut write, &heartbeat_message(next_ref)).await {
                        return SessionEnd::Dropped(e);
                    }
                }
                frame = read.next() => match frame {
                    Some(Ok(Message::Text(text))) => match decode_message(&text, &topic) {
                        ChannelMessage::Joined => {
                            info!(%subscription, %topic, "realtime subscribed");
                            self.ctx.status().set(SyncStatus::Ready);
                        }
                        ChannelMessage::Change(event) => {
                            debug!(%subscription, ?event, "realtime change");
                            apply_change(&self.ctx, scope, event);
                        }
                        ChannelMessage::JoinFailed(reason) | ChannelMessage::ChannelError(reason) => {
                            return SessionEnd::Dropped(reason);
                        }
                        ChannelMessage::Closed => {
                            return SessionEnd::Dropped("channel closed by server".to_string());
                        }
                        ChannelMessage::Ignored => {}
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        return SessionEnd::Dropped("socket closed".to_string());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return SessionEnd::Dropped(e.to_string()),
                },
            }
        }
    }
}

async fn send_json<S>(sink: &mut S, value: &Value) -> Result<(), String>
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    sink.send(Message::Text(value.to_string()))
        .await
        .map_err(|e| format!("send failed: {e}"))
}

async fn leave<S>(sink: &mut S, topic: &str, msg_ref: u64)
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    if let Err(e) = send_json(sink, &leave_message(topic, msg_ref)).await {
        debug!(%topic, error = %e, "leave not delivered");
    }
    let _ = sink.close().await;
}
