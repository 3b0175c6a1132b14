use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use shared_config::AppConfig;
use shared_utils::extractor::auth_middleware;

use crate::handlers::*;

pub fn notification_routes(config: Arc<AppConfig>) -> Router {
    Router::new()
        .route("/", get(list_notifications))
        .route("/send", post(send_notification))
        .route("/read-all", post(mark_all_read))
        .route("/{id}/read", post(mark_notification_read))
        .layer(middleware::from_fn_with_state(config.clone(), auth_middleware))
        .with_state(config)
}
