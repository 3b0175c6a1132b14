use std::sync::Arc;

use axum::{
    extract::{Extension, Path, State},
    http::StatusCode,
    Json,
};
use axum_extra::TypedHeader;
use headers::{authorization::Bearer, Authorization};
use serde_json::{json, Value};
use uuid::Uuid;

use shared_config::AppConfig;
use shared_models::auth::User;
use shared_models::error::AppError;

use crate::models::{SendNotificationRequest, SendOutcome};
use crate::services::NotificationService;

#[axum::debug_handler]
pub async fn send_notification(
    State(config): State<Arc<AppConfig>>,
    Extension(user): Extension<User>,
    Json(request): Json<SendNotificationRequest>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    tracing::debug!("User {} sending notification to {}", user.id, request.user_id);

    request.authorize(&user)?;

    let service = NotificationService::new(&config);

    match service.send(request).await? {
        SendOutcome::Sent(notification) => Ok((
            StatusCode::CREATED,
            Json(json!({ "sent": true, "notification": notification })),
        )),
        SendOutcome::Skipped { reason } => Ok((
            StatusCode::OK,
            Json(json!({ "sent": false, "reason": reason })),
        )),
    }
}

#[axum::debug_handler]
pub async fn list_notifications(
    State(config): State<Arc<AppConfig>>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Extension(user): Extension<User>,
) -> Result<Json<Value>, AppError> {
    let service = NotificationService::new(&config);

    let notifications = service.list_for_user(&user.id, auth.token()).await?;
    let unread = notifications.iter().filter(|n| !n.is_read).count();

    Ok(Json(json!({
        "notifications": notifications,
        "unread_count": unread
    })))
}

#[axum::debug_handler]
pub async fn mark_notification_read(
    State(config): State<Arc<AppConfig>>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Extension(user): Extension<User>,
    Path(notification_id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    let service = NotificationService::new(&config);

    let notification = service.mark_read(notification_id, &user.id, auth.token()).await?;

    Ok(Json(json!(notification)))
}

#[axum::debug_handler]
pub async fn mark_all_read(
    State(config): State<Arc<AppConfig>>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Extension(user): Extension<User>,
) -> Result<Json<Value>, AppError> {
    let service = NotificationService::new(&config);

    let updated = service.mark_all_read(&user.id, auth.token()).await?;

    Ok(Json(json!({ "updated": updated })))
}
