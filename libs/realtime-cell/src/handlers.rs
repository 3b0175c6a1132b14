use std::convert::Infallible;
use std::sync::Arc;

use anyhow::anyhow;
use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
    response::Json,
    Extension,
};
use futures::{stream, Stream};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use shared_config::AppConfig;
use shared_models::{auth::User, error::AppError};

use crate::{
    EmergencyBooking, Notification, Profile, SubscriptionHandlers, SubscriptionRegistry,
    SubscriptionRequest, TableRow,
};

pub struct RealtimeState {
    pub config: Arc<AppConfig>,
    pub registry: Arc<SubscriptionRegistry>,
}

/// Tables a signed-in user may stream, with the column holding their id.
fn owner_column(table: &str) -> Option<&'static str> {
    [
        (Notification::TABLE, Notification::FILTER_COLUMN),
        (EmergencyBooking::TABLE, EmergencyBooking::FILTER_COLUMN),
        (Profile::TABLE, Profile::FILTER_COLUMN),
    ]
    .into_iter()
    .find(|(name, _)| *name == table)
    .map(|(_, column)| column)
}

/// Removes the stream's subscription once the client goes away.
struct StreamGuard {
    registry: Arc<SubscriptionRegistry>,
    channel_name: String,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        let registry = Arc::clone(&self.registry);
        let channel_name = std::mem::take(&mut self.channel_name);
        tokio::spawn(async move {
            registry.unsubscribe(&channel_name).await;
        });
    }
}

/// Server-sent events carrying the caller's change events for one table
pub async fn stream_changes(
    State(state): State<Arc<RealtimeState>>,
    Path(table): Path<String>,
    Extension(user): Extension<User>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let column = owner_column(&table)
        .ok_or_else(|| AppError::BadRequest(format!("Table {} cannot be streamed", table)))?;

    let channel_name = format!("sse:{}:{}:{}", table, user.id, Uuid::new_v4());
    let request = SubscriptionRequest::new(&channel_name, &table, &user.id)
        .with_filter_column(column);

    let (sender, receiver) = mpsc::unbounded_channel::<Event>();
    let updates = sender.clone();

    let handlers = SubscriptionHandlers::new(move |change| {
        let event = Event::default().event("change").json_data(&change)?;
        updates.send(event).map_err(|_| anyhow!("event stream closed"))
    })
    .on_error(move |error| {
        let _ = sender.send(Event::default().event("error").data(error.to_string()));
    });

    state
        .registry
        .subscribe(request, handlers)
        .await
        .map_err(|e| AppError::BadRequest(e.to_string()))?;

    info!("Streaming {} changes to user {}", table, user.id);

    let guard = StreamGuard {
        registry: Arc::clone(&state.registry),
        channel_name,
    };

    let events = stream::unfold((receiver, guard), |(mut receiver, guard)| async move {
        let event = receiver.recv().await?;
        Some((Ok(event), (receiver, guard)))
    });

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

pub async fn realtime_status(
    State(state): State<Arc<RealtimeState>>,
    Extension(user): Extension<User>,
) -> Json<Value> {
    debug!("Realtime status requested by {}", user.id);

    Json(json!({
        "push_available": state.registry.is_available(),
        "active_channels": state.registry.channel_names().await.len(),
        "poll_interval_ms": state.config.realtime_poll_interval_ms
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owner_column() {
        assert_eq!(owner_column("notifications"), Some("user_id"));
        assert_eq!(owner_column("emergency_bookings"), Some("user_id"));
        assert_eq!(owner_column("profiles"), Some("id"));
        assert_eq!(owner_column("prescriptions"), None);
    }
}
