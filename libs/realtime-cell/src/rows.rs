//! Typed schemas for the tables consumers watch.
//!
//! Rows coming off the change feed or a polling snapshot are untyped JSON.
//! They are decoded here, once, and anything that does not fit the schema is
//! rejected with [`RealtimeError::MalformedRow`] instead of reaching consumers.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::{ChangeEvent, ChangeEventType, RealtimeError};

pub trait TableRow: DeserializeOwned + Send + Sync + 'static {
    const TABLE: &'static str;
    /// Column compared against the owner id when subscribing.
    const FILTER_COLUMN: &'static str = "user_id";

    fn row_id(&self) -> Uuid;

    fn decode(value: Value) -> Result<Self, RealtimeError> {
        serde_json::from_value(value).map_err(|e| RealtimeError::MalformedRow {
            table: Self::TABLE.to_string(),
            reason: e.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub user_id: Uuid,
    pub title: String,
    pub message: String,
    #[serde(rename = "type", default)]
    pub notification_type: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

impl TableRow for Notification {
    const TABLE: &'static str = "notifications";

    fn row_id(&self) -> Uuid {
        self.id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmergencyBookingStatus {
    Pending,
    Accepted,
    Rejected,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmergencyBooking {
    pub id: Uuid,
    pub user_id: Uuid,
    #[serde(default)]
    pub doctor_id: Option<Uuid>,
    #[serde(default)]
    pub reason: Option<String>,
    pub status: EmergencyBookingStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl TableRow for EmergencyBooking {
    const TABLE: &'static str = "emergency_bookings";

    fn row_id(&self) -> Uuid {
        self.id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: Uuid,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl TableRow for Profile {
    const TABLE: &'static str = "profiles";
    const FILTER_COLUMN: &'static str = "id";

    fn row_id(&self) -> Uuid {
        self.id
    }
}

/// A [`ChangeEvent`] decoded against a table schema.
#[derive(Debug, Clone, PartialEq)]
pub enum RowChange<T> {
    Inserted(T),
    Updated(T),
    /// Delete payloads only reliably carry the primary key.
    Deleted(Uuid),
    Snapshot(Vec<T>),
}

/// Decoding result. `rejected` holds snapshot rows that were dropped.
#[derive(Debug)]
pub struct DecodedChange<T> {
    pub change: RowChange<T>,
    pub rejected: Vec<RealtimeError>,
}

impl<T: TableRow> RowChange<T> {
    pub fn decode(event: ChangeEvent) -> Result<DecodedChange<T>, RealtimeError> {
        if event.table != T::TABLE {
            return Err(RealtimeError::MalformedRow {
                table: T::TABLE.to_string(),
                reason: format!("event is for table {}", event.table),
            });
        }

        let mut rejected = Vec::new();
        let change = match event.event_type {
            ChangeEventType::Insert => RowChange::Inserted(T::decode(event.new_value)?),
            ChangeEventType::Update => RowChange::Updated(T::decode(event.new_value)?),
            ChangeEventType::Delete => {
                let id = event
                    .old_value
                    .as_ref()
                    .and_then(|old| old.get("id"))
                    .and_then(Value::as_str)
                    .and_then(|raw| Uuid::parse_str(raw).ok())
                    .ok_or_else(|| RealtimeError::MalformedRow {
                        table: T::TABLE.to_string(),
                        reason: "delete event without a row id".to_string(),
                    })?;
                RowChange::Deleted(id)
            }
            ChangeEventType::PollingSnapshot => {
                let rows = match event.new_value {
                    Value::Array(rows) => rows,
                    other => {
                        return Err(RealtimeError::MalformedRow {
                            table: T::TABLE.to_string(),
                            reason: format!("snapshot is not an array: {}", other),
                        })
                    }
                };

                let mut decoded = Vec::with_capacity(rows.len());
                for row in rows {
                    match T::decode(row) {
                        Ok(row) => decoded.push(row),
                        Err(e) => rejected.push(e),
                    }
                }
                RowChange::Snapshot(decoded)
            }
        };

        Ok(DecodedChange { change, rejected })
    }
}
