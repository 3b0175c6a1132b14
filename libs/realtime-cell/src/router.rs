use std::sync::Arc;

use axum::{
    Router,
    routing::get,
    middleware,
};

use shared_config::AppConfig;
use shared_utils::extractor::auth_middleware;

use crate::handlers::{self, RealtimeState};
use crate::SubscriptionRegistry;

pub fn realtime_routes(config: Arc<AppConfig>, registry: Arc<SubscriptionRegistry>) -> Router {
    let state = Arc::new(RealtimeState {
        config: Arc::clone(&config),
        registry,
    });

    Router::new()
        .route("/status", get(handlers::realtime_status))
        .route("/{table}/events", get(handlers::stream_changes))
        .layer(middleware::from_fn_with_state(config, auth_middleware))
        .with_state(state)
}
