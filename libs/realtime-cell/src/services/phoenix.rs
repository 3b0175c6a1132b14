//! Supabase Realtime transport over the Phoenix channels websocket protocol.
//!
//! One socket is shared by every channel and opened lazily on the first
//! `open_channel`. Frames are routed to channels by topic
//! (`realtime:{channel name}`); losing the socket reports `CLOSED` on every
//! routed channel so subscribers can fall back to polling.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use shared_config::AppConfig;

use crate::{
    ChangeEvent, ChangeEventType, ChangeFeedTransport, ChannelConfig, ChannelStatus, FeedChannel,
    FeedMessage, RealtimeError,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const JOIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhoenixFrame {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref", default)]
    pub reference: Option<String>,
}

impl PhoenixFrame {
    pub fn heartbeat(reference: u64) -> Self {
        Self {
            topic: "phoenix".to_string(),
            event: "heartbeat".to_string(),
            payload: json!({}),
            reference: Some(reference.to_string()),
        }
    }

    pub fn join(config: &ChannelConfig, access_token: Option<&str>, reference: u64) -> Self {
        let mut payload = json!({
            "config": {
                "broadcast": { "ack": false, "self": false },
                "presence": { "key": "" },
                "postgres_changes": [{
                    "event": config.event,
                    "schema": config.schema,
                    "table": config.table,
                    "filter": config.filter.to_feed_filter(),
                }],
                "private": false
            }
        });

        if let Some(token) = access_token {
            payload["access_token"] = json!(token);
        }

        Self {
            topic: topic_for(&config.name),
            event: "phx_join".to_string(),
            payload,
            reference: Some(reference.to_string()),
        }
    }

    pub fn leave(channel_name: &str, reference: u64) -> Self {
        Self {
            topic: topic_for(channel_name),
            event: "phx_leave".to_string(),
            payload: json!({}),
            reference: Some(reference.to_string()),
        }
    }
}

pub fn topic_for(channel_name: &str) -> String {
    format!("realtime:{}", channel_name)
}

/// A server frame translated for the channel on `topic`.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundFrame {
    pub topic: String,
    /// `ref` of the push this frame answers. Join replies and channel closes
    /// carry the join ref.
    pub reference: Option<String>,
    pub message: FeedMessage,
}

/// Returns `None` for frames channels don't care about.
pub fn decode_frame(text: &str) -> Option<InboundFrame> {
    let frame: PhoenixFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            debug!("Ignoring undecodable realtime frame: {}", e);
            return None;
        }
    };

    let status = frame.payload.get("status").and_then(Value::as_str);

    let message = match frame.event.as_str() {
        "phx_reply" => match status {
            Some("ok") => FeedMessage::Status(ChannelStatus::Subscribed),
            Some("error") => FeedMessage::Status(ChannelStatus::ChannelError),
            _ => return None,
        },
        "phx_error" => FeedMessage::Status(ChannelStatus::ChannelError),
        "phx_close" => FeedMessage::Status(ChannelStatus::Closed),
        "system" if status == Some("error") => FeedMessage::Status(ChannelStatus::ChannelError),
        "postgres_changes" => {
            let data = frame.payload.get("data")?;
            let event_type = data
                .get("type")
                .and_then(Value::as_str)
                .and_then(ChangeEventType::from_feed)?;
            let table = data.get("table").and_then(Value::as_str)?.to_string();

            FeedMessage::Change(ChangeEvent {
                event_type,
                table,
                new_value: data.get("record").cloned().unwrap_or(Value::Null),
                old_value: data
                    .get("old_record")
                    .filter(|old| !old.is_null())
                    .cloned(),
            })
        }
        _ => return None,
    };

    Some(InboundFrame {
        topic: frame.topic,
        reference: frame.reference,
        message,
    })
}

struct Route {
    sender: mpsc::UnboundedSender<FeedMessage>,
    join_ref: String,
    joined: bool,
}

impl Route {
    /// Status frames answering an earlier join or a leave on the same topic
    /// belong to a previous subscription.
    fn accepts(&self, frame: &InboundFrame) -> bool {
        match (&frame.message, &frame.reference) {
            (FeedMessage::Status(_), Some(reference)) => *reference == self.join_ref,
            _ => true,
        }
    }
}

type Routes = Arc<RwLock<HashMap<String, Route>>>;

struct SocketConnection {
    outgoing: mpsc::UnboundedSender<String>,
    routes: Routes,
    next_ref: Arc<AtomicU64>,
    alive: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
}

impl SocketConnection {
    async fn connect(endpoint: &str, heartbeat_interval: Duration) -> Result<Self, RealtimeError> {
        let (stream, _) = connect_async(endpoint)
            .await
            .map_err(|e| RealtimeError::Transport(e.to_string()))?;
        let (mut sink, mut source) = stream.split();

        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<String>();
        let routes: Routes = Arc::new(RwLock::new(HashMap::new()));
        let next_ref = Arc::new(AtomicU64::new(1));
        let alive = Arc::new(AtomicBool::new(true));

        let writer = tokio::spawn(async move {
            while let Some(frame) = outgoing_rx.recv().await {
                if let Err(e) = sink.send(Message::Text(frame)).await {
                    warn!("Realtime socket write failed: {}", e);
                    break;
                }
            }
        });

        let reader = {
            let routes = Arc::clone(&routes);
            let alive = Arc::clone(&alive);
            tokio::spawn(async move {
                while let Some(message) = source.next().await {
                    match message {
                        Ok(Message::Text(text)) => route_frame(&routes, &text).await,
                        Ok(Message::Close(frame)) => {
                            debug!("Realtime socket closed by server: {:?}", frame);
                            break;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!("Realtime socket read failed: {}", e);
                            break;
                        }
                    }
                }

                alive.store(false, Ordering::SeqCst);
                let mut routes = routes.write().await;
                for (topic, route) in routes.drain() {
                    debug!("Closing {} after socket loss", topic);
                    let _ = route.sender.send(FeedMessage::Status(ChannelStatus::Closed));
                }
            })
        };

        let heartbeat = {
            let outgoing = outgoing.clone();
            let next_ref = Arc::clone(&next_ref);
            tokio::spawn(async move {
                let mut ticker = interval(heartbeat_interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let reference = next_ref.fetch_add(1, Ordering::SeqCst);
                    let Ok(text) = serde_json::to_string(&PhoenixFrame::heartbeat(reference)) else {
                        break;
                    };
                    if outgoing.send(text).is_err() {
                        break;
                    }
                }
            })
        };

        info!("Connected to realtime server");

        Ok(Self {
            outgoing,
            routes,
            next_ref,
            alive,
            tasks: vec![writer, reader, heartbeat],
        })
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst) && !self.outgoing.is_closed()
    }

    fn next_ref(&self) -> u64 {
        self.next_ref.fetch_add(1, Ordering::SeqCst)
    }

    fn send(&self, frame: &PhoenixFrame) -> Result<(), RealtimeError> {
        let text = serde_json::to_string(frame)
            .map_err(|e| RealtimeError::Transport(e.to_string()))?;
        self.outgoing
            .send(text)
            .map_err(|_| RealtimeError::Transport("realtime socket is closed".to_string()))
    }
}

impl Drop for SocketConnection {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn route_frame(routes: &Routes, text: &str) {
    let Some(frame) = decode_frame(text) else {
        return;
    };

    let mut routes = routes.write().await;
    let Some(route) = routes.get_mut(&frame.topic) else {
        return;
    };

    if !route.accepts(&frame) {
        debug!(
            "Dropping stale {:?} on {} (ref {:?}, current join {})",
            frame.message, frame.topic, frame.reference, route.join_ref
        );
        return;
    }

    if matches!(frame.message, FeedMessage::Status(_)) {
        route.joined = true;
    }
    let _ = route.sender.send(frame.message);
}

pub struct SupabaseRealtimeTransport {
    endpoint: String,
    access_token: Option<String>,
    heartbeat_interval: Duration,
    connect_timeout: Duration,
    join_timeout: Duration,
    connection: Mutex<Option<Arc<SocketConnection>>>,
}

impl SupabaseRealtimeTransport {
    /// Uses the service-role key when configured so server-side channels
    /// see every row matching their filter; the anon key otherwise.
    pub fn new(config: &AppConfig) -> Self {
        let key = if config.supabase_service_role_key.is_empty() {
            config.supabase_anon_key.clone()
        } else {
            config.supabase_service_role_key.clone()
        };

        Self {
            endpoint: format!(
                "{}/websocket?apikey={}&vsn=1.0.0",
                config.supabase_realtime_url.trim_end_matches('/'),
                urlencoding::encode(&key)
            ),
            access_token: Some(key),
            heartbeat_interval: Duration::from_secs(config.realtime_heartbeat_interval_secs.max(1)),
            connect_timeout: CONNECT_TIMEOUT,
            join_timeout: JOIN_TIMEOUT,
            connection: Mutex::new(None),
        }
    }

    /// Overrides how long the websocket handshake and a channel join may take.
    pub fn with_timeouts(mut self, connect_timeout: Duration, join_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self.join_timeout = join_timeout;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn live_connection(&self) -> Option<Arc<SocketConnection>> {
        let guard = self.connection.lock().await;
        guard
            .as_ref()
            .filter(|connection| connection.is_alive())
            .map(Arc::clone)
    }

    /// The lock is not held across the handshake, so a stalled server only
    /// delays the callers waiting on it.
    async fn connection(&self) -> Result<Arc<SocketConnection>, RealtimeError> {
        if let Some(connection) = self.live_connection().await {
            return Ok(connection);
        }

        let connected = timeout(
            self.connect_timeout,
            SocketConnection::connect(&self.endpoint, self.heartbeat_interval),
        )
        .await
        .map_err(|_| {
            RealtimeError::Transport(format!(
                "realtime handshake timed out after {:?}",
                self.connect_timeout
            ))
        })??;

        let mut guard = self.connection.lock().await;
        if let Some(existing) = guard.as_ref().filter(|existing| existing.is_alive()) {
            // Another caller connected first; ours is dropped and its tasks aborted
            return Ok(Arc::clone(existing));
        }

        let connection = Arc::new(connected);
        *guard = Some(Arc::clone(&connection));
        Ok(connection)
    }
}

#[async_trait]
impl ChangeFeedTransport for SupabaseRealtimeTransport {
    async fn open_channel(&self, config: &ChannelConfig) -> Result<FeedChannel, RealtimeError> {
        let connection = self.connection().await?;
        let topic = topic_for(&config.name);

        let reference = connection.next_ref();
        let join_ref = reference.to_string();

        let (sender, messages) = mpsc::unbounded_channel();
        connection.routes.write().await.insert(
            topic.clone(),
            Route {
                sender,
                join_ref: join_ref.clone(),
                joined: false,
            },
        );

        let join = PhoenixFrame::join(config, self.access_token.as_deref(), reference);
        if let Err(e) = connection.send(&join) {
            connection.routes.write().await.remove(&topic);
            return Err(e);
        }

        let routes = Arc::clone(&connection.routes);
        let join_timeout = self.join_timeout;
        tokio::spawn(async move {
            sleep(join_timeout).await;
            let routes = routes.read().await;
            if let Some(route) = routes.get(&topic) {
                if route.join_ref == join_ref && !route.joined {
                    let _ = route.sender.send(FeedMessage::Status(ChannelStatus::TimedOut));
                }
            }
        });

        debug!("Joining realtime channel {} on {}", config.name, config.table);
        Ok(FeedChannel {
            name: config.name.clone(),
            messages,
        })
    }

    async fn close_channel(&self, name: &str) {
        let guard = self.connection.lock().await;
        let Some(connection) = guard.as_ref() else {
            return;
        };

        let removed = connection.routes.write().await.remove(&topic_for(name));
        if removed.is_some() {
            let leave = PhoenixFrame::leave(name, connection.next_ref());
            if let Err(e) = connection.send(&leave) {
                debug!("Could not send leave for {}: {}", name, e);
            }
        }
    }
}
