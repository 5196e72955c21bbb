//! Live change feed over the realtime websocket (Phoenix channel protocol).
//!
//! One socket is shared by every subscription. Each subscription joins its own
//! topic; on reconnect all live topics are joined again.

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use super::{ChangeEvent, ChangeFeed, ChangeKind, Filter};
use crate::config::ClientConfig;
use crate::error::{GatewayError, GatewayResult};

const MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Frame of the Phoenix channel protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhoenixMessage {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref", default)]
    pub reference: Option<String>,
}

struct Channel {
    table: String,
    filter: Option<Filter>,
    event: Option<ChangeKind>,
    sender: mpsc::UnboundedSender<ChangeEvent>,
}

#[derive(Default)]
struct Shared {
    channels: HashMap<String, Channel>,
    outbound: Option<mpsc::UnboundedSender<PhoenixMessage>>,
    access_token: Option<String>,
    supervisor: Option<JoinHandle<()>>,
}

struct Inner {
    url: String,
    heartbeat: Duration,
    next_ref: AtomicU64,
    shared: Mutex<Shared>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn next_ref(&self) -> String {
        self.next_ref.fetch_add(1, Ordering::Relaxed).to_string()
    }

    /// Queue a frame on the live socket; dropped when disconnected since
    /// every join is replayed on reconnect.
    fn send(&self, message: PhoenixMessage) {
        if let Some(outbound) = &self.lock().outbound {
            let _ = outbound.send(message);
        }
    }

    /// Record a channel and queue its join. Both happen under one lock, so a
    /// connection coming up concurrently either replays the join or receives
    /// it queued, never both.
    fn register(&self, topic: &str, channel: Channel) {
        let mut shared = self.lock();
        if let Some(outbound) = &shared.outbound {
            let join = join_message(topic, &channel, shared.access_token.as_deref(), self.next_ref());
            let _ = outbound.send(join);
        }
        shared.channels.insert(topic.to_string(), channel);
    }

    /// Install the outbound queue of a fresh connection and return the joins
    /// to replay on it.
    fn attach(&self, outbound: mpsc::UnboundedSender<PhoenixMessage>) -> Vec<PhoenixMessage> {
        let mut shared = self.lock();
        shared.outbound = Some(outbound);
        let token = shared.access_token.as_deref();
        shared
            .channels
            .iter()
            .map(|(topic, channel)| join_message(topic, channel, token, self.next_ref()))
            .collect()
    }
}

pub struct RealtimeClient {
    inner: Arc<Inner>,
}

impl RealtimeClient {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                url: config.realtime_url(),
                heartbeat: Duration::from_secs(config.realtime_heartbeat_secs.max(1)),
                next_ref: AtomicU64::new(1),
                shared: Mutex::new(Shared::default()),
            }),
        }
    }

    /// Token sent with every join; pushed to joined topics immediately.
    pub fn set_access_token(&self, token: Option<String>) {
        let topics: Vec<String> = {
            let mut shared = self.inner.lock();
            if shared.access_token == token {
                return;
            }
            shared.access_token = token.clone();
            shared.channels.keys().cloned().collect()
        };
        let Some(token) = token else {
            return;
        };
        for topic in topics {
            self.inner.send(PhoenixMessage {
                topic,
                event: "access_token".to_string(),
                payload: json!({ "access_token": token }),
                reference: Some(self.inner.next_ref()),
            });
        }
    }

    /// Join a new topic for `table` and return its feed. The socket is opened on first use.
    pub fn subscribe(
        &self,
        table: &str,
        filter: Option<&Filter>,
        event: Option<ChangeKind>,
    ) -> GatewayResult<ChangeFeed> {
        let topic = format!("realtime:{}:{}", table, uuid::Uuid::new_v4());
        let (sender, receiver) = mpsc::unbounded_channel();
        let channel = Channel {
            table: table.to_string(),
            filter: filter.cloned(),
            event,
            sender,
        };

        debug!("Subscribing to {} as {}", table, topic);
        self.inner.register(&topic, channel);
        self.ensure_running()?;

        let inner = self.inner.clone();
        Ok(ChangeFeed::new(receiver, move || {
            let removed = inner.lock().channels.remove(&topic);
            if removed.is_some() {
                debug!("Leaving {}", topic);
                let reference = inner.next_ref();
                inner.send(PhoenixMessage {
                    topic,
                    event: "phx_leave".to_string(),
                    payload: json!({}),
                    reference: Some(reference),
                });
            }
        }))
    }

    pub fn active_channels(&self) -> usize {
        self.inner.lock().channels.len()
    }

    /// Close the socket. Channels stay registered and are joined again when the
    /// next subscription reopens it.
    pub fn disconnect(&self) {
        let mut shared = self.inner.lock();
        if let Some(handle) = shared.supervisor.take() {
            handle.abort();
        }
        shared.outbound = None;
        info!("Realtime disconnected");
    }

    fn ensure_running(&self) -> GatewayResult<()> {
        let mut shared = self.inner.lock();
        if matches!(&shared.supervisor, Some(handle) if !handle.is_finished()) {
            return Ok(());
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| GatewayError::Realtime(format!("no async runtime: {}", e)))?;
        let inner = self.inner.clone();
        shared.supervisor = Some(runtime.spawn(supervise(inner)));
        Ok(())
    }
}

impl Drop for RealtimeClient {
    fn drop(&mut self) {
        if let Some(handle) = self.inner.lock().supervisor.take() {
            handle.abort();
        }
    }
}

/// Keep a socket open while any channel is live, reconnecting with
/// exponential backoff.
async fn supervise(inner: Arc<Inner>) {
    let mut attempts: u32 = 0;
    loop {
        match connect_async(inner.url.as_str()).await {
            Ok((stream, _)) => {
                info!("Realtime connected");
                attempts = 0;
                run_connection(&inner, stream).await;
            }
            Err(e) => warn!("Realtime connection failed: {}", e),
        }
        inner.lock().outbound = None;

        if inner.lock().channels.is_empty() {
            debug!("No live channels, realtime supervisor stopping");
            return;
        }

        attempts += 1;
        if attempts > MAX_RECONNECT_ATTEMPTS {
            error!("Max realtime reconnection attempts reached");
            return;
        }
        let delay = Duration::from_secs(2_u64.pow(attempts.min(5)));
        info!("Reconnecting realtime in {:?} (attempt {})", delay, attempts);
        tokio::time::sleep(delay).await;
    }
}

async fn run_connection<S>(inner: &Arc<Inner>, stream: tokio_tungstenite::WebSocketStream<S>)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut sink, mut source) = stream.split();
    let (outbound, mut queued) = mpsc::unbounded_channel::<PhoenixMessage>();

    for join in inner.attach(outbound) {
        if let Err(e) = send_frame(&mut sink, &join).await {
            warn!("Failed to join {}: {}", join.topic, e);
            return;
        }
    }

    let mut heartbeat = interval(inner.heartbeat);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            Some(message) = queued.recv() => {
                if let Err(e) = send_frame(&mut sink, &message).await {
                    warn!("Realtime send failed: {}", e);
                    return;
                }
            }
            _ = heartbeat.tick() => {
                let beat = PhoenixMessage {
                    topic: "phoenix".to_string(),
                    event: "heartbeat".to_string(),
                    payload: json!({}),
                    reference: Some(inner.next_ref()),
                };
                if let Err(e) = send_frame(&mut sink, &beat).await {
                    debug!("Failed to send heartbeat: {}", e);
                    return;
                }
            }
            frame = source.next() => match frame {
                Some(Ok(Message::Text(text))) => handle_text(inner, &text),
                Some(Ok(Message::Ping(data))) => {
                    let _ = sink.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(_))) => {
                    info!("Realtime socket closed by server");
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!("Realtime socket error: {}", e);
                    return;
                }
                None => {
                    info!("Realtime stream ended");
                    return;
                }
            }
        }
    }
}

async fn send_frame<S>(sink: &mut S, message: &PhoenixMessage) -> anyhow::Result<()>
where
    S: futures_util::Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let text = serde_json::to_string(message)?;
    sink.send(Message::Text(text))
        .await
        .map_err(|e| anyhow::anyhow!("{}", e))
}

fn handle_text(inner: &Inner, text: &str) {
    let message: PhoenixMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            warn!("Failed to parse realtime frame: {}", e);
            return;
        }
    };

    match message.event.as_str() {
        "postgres_changes" => {
            let Some(change) = parse_change(&message.payload) else {
                debug!("Ignoring malformed change on {}", message.topic);
                return;
            };
            if let Some(channel) = inner.lock().channels.get(&message.topic) {
                if channel.table == change.table {
                    let _ = channel.sender.send(change);
                }
            }
        }
        "phx_reply" => {
            if message.payload.get("status").and_then(Value::as_str) == Some("error") {
                warn!("Realtime rejected {}: {}", message.topic, message.payload["response"]);
            }
        }
        "phx_error" | "phx_close" => warn!("Channel {} {}", message.topic, message.event),
        "system" => debug!("Realtime system message on {}: {}", message.topic, message.payload),
        _ => {}
    }
}

fn join_message(
    topic: &str,
    channel: &Channel,
    access_token: Option<&str>,
    reference: String,
) -> PhoenixMessage {
    let mut change = json!({
        "event": channel.event.map(|kind| kind.as_str()).unwrap_or("*"),
        "schema": "public",
        "table": channel.table,
    });
    if let Some(filter) = &channel.filter {
        change["filter"] = Value::String(filter.to_realtime());
    }

    let mut payload = json!({
        "config": {
            "broadcast": { "self": false },
            "presence": { "key": "" },
            "postgres_changes": [change],
        }
    });
    if let Some(token) = access_token {
        payload["access_token"] = Value::String(token.to_string());
    }

    PhoenixMessage {
        topic: topic.to_string(),
        event: "phx_join".to_string(),
        payload,
        reference: Some(reference),
    }
}

/// Row change carried in a `postgres_changes` payload.
pub fn parse_change(payload: &Value) -> Option<ChangeEvent> {
    let data = payload.get("data")?;
    let kind: ChangeKind = serde_json::from_value(data.get("type")?.clone()).ok()?;
    let table = data.get("table")?.as_str()?;
    let present = |key: &str| data.get(key).filter(|v| !v.is_null()).cloned();

    Some(ChangeEvent {
        table: table.to_string(),
        kind,
        record: present("record"),
        old_record: present("old_record"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(filter: Option<Filter>, event: Option<ChangeKind>) -> Channel {
        let (sender, _) = mpsc::unbounded_channel();
        Channel {
            table: "prompt_usage".to_string(),
            filter,
            event,
            sender,
        }
    }

    #[test]
    fn test_join_message_carries_filter_and_token() {
        let join = join_message(
            "realtime:prompt_usage:1",
            &channel(Some(Filter::eq("user_id", "u1")), None),
            Some("jwt"),
            "7".to_string(),
        );
        assert_eq!(join.event, "phx_join");
        assert_eq!(join.reference.as_deref(), Some("7"));
        let change = &join.payload["config"]["postgres_changes"][0];
        assert_eq!(change["event"], "*");
        assert_eq!(change["table"], "prompt_usage");
        assert_eq!(change["filter"], "user_id=eq.u1");
        assert_eq!(join.payload["access_token"], "jwt");
    }

    #[test]
    fn test_join_message_without_filter() {
        let join = join_message("t", &channel(None, Some(ChangeKind::Update)), None, "1".into());
        let change = &join.payload["config"]["postgres_changes"][0];
        assert_eq!(change["event"], "UPDATE");
        assert!(change.get("filter").is_none());
        assert!(join.payload.get("access_token").is_none());
    }

    #[test]
    fn test_parse_change() {
        let payload = json!({
            "data": {
                "type": "UPDATE",
                "table": "user_subscriptions",
                "schema": "public",
                "record": { "user_id": "u1", "tier": "pro" },
                "old_record": { "user_id": "u1" }
            },
            "ids": [1]
        });
        let change = parse_change(&payload).unwrap();
        assert_eq!(change.kind, ChangeKind::Update);
        assert_eq!(change.table, "user_subscriptions");
        assert_eq!(change.record.unwrap()["tier"], "pro");
        assert!(change.old_record.is_some());

        assert!(parse_change(&json!({ "data": { "type": "TRUNCATE", "table": "x" } })).is_none());
        assert!(parse_change(&json!({})).is_none());
    }

    #[test]
    fn test_phoenix_message_wire_format() {
        let text = r#"{"topic":"phoenix","event":"phx_reply","payload":{"status":"ok"},"ref":"3"}"#;
        let message: PhoenixMessage = serde_json::from_str(text).unwrap();
        assert_eq!(message.reference.as_deref(), Some("3"));
        let back = serde_json::to_value(&message).unwrap();
        assert_eq!(back["ref"], "3");
    }

    fn inner() -> Inner {
        Inner {
            url: "ws://127.0.0.1:9".to_string(),
            heartbeat: Duration::from_secs(30),
            next_ref: AtomicU64::new(1),
            shared: Mutex::new(Shared::default()),
        }
    }

    #[test]
    fn test_each_topic_joins_once_around_connect() {
        let inner = inner();
        inner.register("realtime:prompts:early", channel(None, None));

        let (outbound, mut queued) = mpsc::unbounded_channel();
        let replayed = inner.attach(outbound);
        inner.register("realtime:prompts:late", channel(None, None));

        let replayed: Vec<String> = replayed.into_iter().map(|m| m.topic).collect();
        assert_eq!(replayed, vec!["realtime:prompts:early".to_string()]);

        let late = queued.try_recv().unwrap();
        assert_eq!(late.topic, "realtime:prompts:late");
        assert_eq!(late.event, "phx_join");
        assert!(queued.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_feed_release_removes_channel() {
        let config = ClientConfig {
            supabase_url: "http://127.0.0.1:9".to_string(),
            supabase_anon_key: "anon".to_string(),
            ..Default::default()
        };
        let client = RealtimeClient::new(&config);
        let feed = client.subscribe("prompts", None, None).unwrap();
        assert_eq!(client.active_channels(), 1);
        feed.unsubscribe();
        assert_eq!(client.active_channels(), 0);
        client.disconnect();
    }
}
