use std::sync::Arc;

use axum::{
    extract::{Extension, State},
    Json,
};
use axum_extra::TypedHeader;
use headers::{authorization::Bearer, Authorization};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use shared_config::AppConfig;
use shared_database::supabase::SupabaseClient;
use shared_models::auth::User;
use shared_models::error::AppError;

/// Permanently deletes the caller's account.
///
/// The caller is resolved through the Auth API with their own token; the
/// delete itself needs the service-role key.
#[axum::debug_handler]
pub async fn delete_account(
    State(config): State<Arc<AppConfig>>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Extension(user): Extension<User>,
) -> Result<Json<Value>, AppError> {
    debug!("Account deletion requested by {}", user.id);

    let client = SupabaseClient::new(&config);
    let auth_user = client
        .get_auth_user(auth.token())
        .await
        .map_err(|e| AppError::Auth(e.to_string()))?;

    let user_id = auth_user
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| AppError::Auth("Token does not resolve to a user".to_string()))?;

    if user_id != user.id {
        warn!("Token subject {} resolved to auth user {}", user.id, user_id);
        return Err(AppError::Auth("Token does not match the account".to_string()));
    }

    let admin = SupabaseClient::service_role(&config)
        .map_err(|e| AppError::Internal(e.to_string()))?;

    admin
        .admin_delete_user(user_id)
        .await
        .map_err(|e| AppError::ExternalService(e.to_string()))?;

    info!("Deleted account {}", user_id);

    Ok(Json(json!({
        "deleted": true,
        "user_id": user_id
    })))
}
