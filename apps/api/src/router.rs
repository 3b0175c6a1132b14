use std::sync::Arc;

use axum::{
    Router,
    routing::get,
};

use auth_cell::auth_routes;
use notification_cell::notification_routes;
use realtime_cell::{realtime_routes, SubscriptionRegistry};
use shared_config::AppConfig;

pub fn create_router(state: Arc<AppConfig>, registry: Arc<SubscriptionRegistry>) -> Router {
    Router::new()
        .route("/", get(|| async { "Clinic realtime API is running!" }))
        .nest("/auth", auth_routes(state.clone()))
        .nest("/notifications", notification_routes(state.clone()))
        .nest("/realtime", realtime_routes(state, registry))
}
