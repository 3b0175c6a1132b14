use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::RealtimeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeEventType {
    Insert,
    Update,
    Delete,
    PollingSnapshot,
}

impl ChangeEventType {
    /// Parses the `type` field of a `postgres_changes` payload.
    pub fn from_feed(raw: &str) -> Option<Self> {
        match raw {
            "INSERT" => Some(ChangeEventType::Insert),
            "UPDATE" => Some(ChangeEventType::Update),
            "DELETE" => Some(ChangeEventType::Delete),
            _ => None,
        }
    }
}

/// A change delivered to consumers, from the push feed or a polling snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub event_type: ChangeEventType,
    pub table: String,
    /// Post-change row, or the whole result set for `PollingSnapshot`.
    pub new_value: Value,
    pub old_value: Option<Value>,
}

impl ChangeEvent {
    pub fn polling_snapshot(table: &str, rows: Vec<Value>) -> Self {
        Self {
            event_type: ChangeEventType::PollingSnapshot,
            table: table.to_string(),
            new_value: Value::Array(rows),
            old_value: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscriptionMode {
    Push,
    Polling,
}

/// Channel status values reported by the change feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Subscribed,
    ChannelError,
    TimedOut,
    Closed,
}

impl fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelStatus::Subscribed => write!(f, "SUBSCRIBED"),
            ChannelStatus::ChannelError => write!(f, "CHANNEL_ERROR"),
            ChannelStatus::TimedOut => write!(f, "TIMED_OUT"),
            ChannelStatus::Closed => write!(f, "CLOSED"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowFilter {
    pub column: String,
    pub value: String,
}

impl RowFilter {
    pub fn eq(column: &str, value: &str) -> Self {
        Self {
            column: column.to_string(),
            value: value.to_string(),
        }
    }

    pub fn user_id(value: &str) -> Self {
        Self::eq("user_id", value)
    }

    /// Filter string understood by the realtime server, e.g. `user_id=eq.42`.
    pub fn to_feed_filter(&self) -> String {
        format!("{}=eq.{}", self.column, self.value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub column: String,
    pub direction: SortDirection,
}

impl OrderBy {
    pub fn newest_first() -> Self {
        Self {
            column: "created_at".to_string(),
            direction: SortDirection::Descending,
        }
    }

    /// PostgREST `order` parameter value.
    pub fn to_query_value(&self) -> String {
        let direction = match self.direction {
            SortDirection::Ascending => "asc",
            SortDirection::Descending => "desc",
        };
        format!("{}.{}", self.column, direction)
    }
}

impl Default for OrderBy {
    fn default() -> Self {
        Self::newest_first()
    }
}

/// What a consumer wants to watch. One per channel name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionRequest {
    pub channel_name: String,
    pub table: String,
    pub filter: RowFilter,
    pub order: OrderBy,
}

impl SubscriptionRequest {
    /// Watches `table` rows whose `user_id` equals `filter_value`.
    pub fn new(channel_name: &str, table: &str, filter_value: &str) -> Self {
        Self {
            channel_name: channel_name.to_string(),
            table: table.to_string(),
            filter: RowFilter::user_id(filter_value),
            order: OrderBy::newest_first(),
        }
    }

    pub fn with_filter_column(mut self, column: &str) -> Self {
        self.filter.column = column.to_string();
        self
    }

    pub fn validate(&self) -> Result<(), RealtimeError> {
        let missing = [
            ("channel name", &self.channel_name),
            ("table", &self.table),
            ("filter column", &self.filter.column),
            ("filter value", &self.filter.value),
        ]
        .into_iter()
        .find(|(_, value)| value.trim().is_empty());

        match missing {
            Some((field, _)) => Err(RealtimeError::InvalidSubscription(format!(
                "{} must not be empty",
                field
            ))),
            None => Ok(()),
        }
    }
}

/// Configuration passed to the change feed when opening a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    pub name: String,
    pub schema: String,
    pub table: String,
    /// `*` listens for inserts, updates and deletes.
    pub event: String,
    pub filter: RowFilter,
}

impl From<&SubscriptionRequest> for ChannelConfig {
    fn from(request: &SubscriptionRequest) -> Self {
        Self {
            name: request.channel_name.clone(),
            schema: "public".to_string(),
            table: request.table.clone(),
            event: "*".to_string(),
            filter: request.filter.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FeedMessage {
    Status(ChannelStatus),
    Change(ChangeEvent),
}

pub type UpdateCallback = Arc<dyn Fn(ChangeEvent) -> anyhow::Result<()> + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(RealtimeError) + Send + Sync>;

/// Consumer callbacks for one subscription.
#[derive(Clone)]
pub struct SubscriptionHandlers {
    pub on_update: UpdateCallback,
    pub on_error: Option<ErrorCallback>,
}

impl SubscriptionHandlers {
    pub fn new<F>(on_update: F) -> Self
    where
        F: Fn(ChangeEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            on_update: Arc::new(on_update),
            on_error: None,
        }
    }

    pub fn on_error<F>(mut self, on_error: F) -> Self
    where
        F: Fn(RealtimeError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(on_error));
        self
    }
}

impl fmt::Debug for SubscriptionHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandlers")
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}
