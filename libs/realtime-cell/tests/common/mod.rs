#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Notify};
use tokio::time::Duration;
use uuid::Uuid;

use realtime_cell::*;

/// How the in-memory feed answers a join.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FeedBehavior {
    Subscribe,
    ChannelError,
    Closed,
    FailOpen,
    Silent,
}

pub struct MockTransport {
    behavior: Mutex<FeedBehavior>,
    channels: Mutex<HashMap<String, mpsc::UnboundedSender<FeedMessage>>>,
    configs: Mutex<Vec<ChannelConfig>>,
    closed: Mutex<Vec<String>>,
    opened: AtomicUsize,
}

impl MockTransport {
    pub fn new(behavior: FeedBehavior) -> Arc<Self> {
        Arc::new(Self {
            behavior: Mutex::new(behavior),
            channels: Mutex::new(HashMap::new()),
            configs: Mutex::new(Vec::new()),
            closed: Mutex::new(Vec::new()),
            opened: AtomicUsize::new(0),
        })
    }

    pub fn set_behavior(&self, behavior: FeedBehavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    /// Pushes a message on an open channel. False if the channel isn't open.
    pub fn send(&self, channel_name: &str, message: FeedMessage) -> bool {
        self.channels
            .lock()
            .unwrap()
            .get(channel_name)
            .map(|sender| sender.send(message).is_ok())
            .unwrap_or(false)
    }

    pub fn emit(&self, channel_name: &str, event: ChangeEvent) -> bool {
        self.send(channel_name, FeedMessage::Change(event))
    }

    pub fn report(&self, channel_name: &str, status: ChannelStatus) -> bool {
        self.send(channel_name, FeedMessage::Status(status))
    }

    pub fn is_open(&self, channel_name: &str) -> bool {
        self.channels.lock().unwrap().contains_key(channel_name)
    }

    pub fn open_count(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> Vec<String> {
        self.closed.lock().unwrap().clone()
    }

    pub fn configs(&self) -> Vec<ChannelConfig> {
        self.configs.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChangeFeedTransport for MockTransport {
    async fn open_channel(&self, config: &ChannelConfig) -> Result<FeedChannel, RealtimeError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        self.configs.lock().unwrap().push(config.clone());

        let behavior = *self.behavior.lock().unwrap();
        if behavior == FeedBehavior::FailOpen {
            return Err(RealtimeError::Transport("connection refused".to_string()));
        }

        let (sender, messages) = mpsc::unbounded_channel();
        let status = match behavior {
            FeedBehavior::Subscribe => Some(ChannelStatus::Subscribed),
            FeedBehavior::ChannelError => Some(ChannelStatus::ChannelError),
            FeedBehavior::Closed => Some(ChannelStatus::Closed),
            _ => None,
        };
        if let Some(status) = status {
            let _ = sender.send(FeedMessage::Status(status));
        }

        self.channels.lock().unwrap().insert(config.name.clone(), sender);

        Ok(FeedChannel {
            name: config.name.clone(),
            messages,
        })
    }

    async fn close_channel(&self, name: &str) {
        if self.channels.lock().unwrap().remove(name).is_some() {
            self.closed.lock().unwrap().push(name.to_string());
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueryCall {
    pub table: String,
    pub filter: RowFilter,
    pub order: OrderBy,
}

pub struct MockQuery {
    rows: Mutex<Vec<Value>>,
    fail: AtomicBool,
    hold: Mutex<Option<Arc<Notify>>>,
    calls: Mutex<Vec<QueryCall>>,
}

impl MockQuery {
    pub fn new(rows: Vec<Value>) -> Arc<Self> {
        Arc::new(Self {
            rows: Mutex::new(rows),
            fail: AtomicBool::new(false),
            hold: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn set_rows(&self, rows: Vec<Value>) {
        *self.rows.lock().unwrap() = rows;
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Every query blocks until the returned `Notify` is signalled.
    pub fn hold(&self) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        *self.hold.lock().unwrap() = Some(Arc::clone(&notify));
        notify
    }

    pub fn calls(&self) -> Vec<QueryCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl RowQueryService for MockQuery {
    async fn query(
        &self,
        table: &str,
        filter: &RowFilter,
        order: &OrderBy,
    ) -> Result<Vec<Value>, RealtimeError> {
        self.calls.lock().unwrap().push(QueryCall {
            table: table.to_string(),
            filter: filter.clone(),
            order: order.clone(),
        });

        let hold = self.hold.lock().unwrap().clone();
        if let Some(notify) = hold {
            notify.notified().await;
        }

        if self.fail.load(Ordering::SeqCst) {
            return Err(RealtimeError::Query("database unavailable".to_string()));
        }

        Ok(self.rows.lock().unwrap().clone())
    }
}

/// Collects everything a subscription hands to its consumer.
#[derive(Clone, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<ChangeEvent>>>,
    errors: Arc<Mutex<Vec<RealtimeError>>>,
}

impl Recorder {
    pub fn handlers(&self) -> SubscriptionHandlers {
        let events = Arc::clone(&self.events);
        let errors = Arc::clone(&self.errors);

        SubscriptionHandlers::new(move |event| {
            events.lock().unwrap().push(event);
            Ok(())
        })
        .on_error(move |error| errors.lock().unwrap().push(error))
    }

    pub fn error_sink(&self) -> impl Fn(RealtimeError) + Send + Sync + 'static {
        let errors = Arc::clone(&self.errors);
        move |error| errors.lock().unwrap().push(error)
    }

    pub fn events(&self) -> Vec<ChangeEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn errors(&self) -> Vec<RealtimeError> {
        self.errors.lock().unwrap().clone()
    }
}

pub const POLL_INTERVAL: Duration = Duration::from_millis(5000);

pub fn registry(transport: &Arc<MockTransport>, query: &Arc<MockQuery>) -> SubscriptionRegistry {
    SubscriptionRegistry::new(
        Arc::clone(transport) as Arc<dyn ChangeFeedTransport>,
        Arc::clone(query) as Arc<dyn RowQueryService>,
        RegistrySettings {
            poll_interval: POLL_INTERVAL,
        },
    )
}

/// Lets spawned subscription tasks run without reaching the next poll.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

pub fn notification_row(user_id: Uuid, title: &str, created_at: &str) -> Value {
    json!({
        "id": Uuid::new_v4(),
        "user_id": user_id,
        "title": title,
        "message": format!("{} details", title),
        "type": "appointment",
        "link": null,
        "is_read": false,
        "created_at": created_at
    })
}

pub fn insert_event(table: &str, row: Value) -> ChangeEvent {
    ChangeEvent {
        event_type: ChangeEventType::Insert,
        table: table.to_string(),
        new_value: row,
        old_value: None,
    }
}
