use chrono::Utc;
use reqwest::{
    header::{HeaderMap, HeaderValue},
    Method,
};
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use realtime_cell::{Notification, OrderBy, RowFilter, SupabaseRowQueryService, TableRow};
use shared_config::AppConfig;
use shared_database::supabase::SupabaseClient;

use crate::models::{NotificationError, NotificationPreferences, SendNotificationRequest, SendOutcome};

pub struct NotificationService {
    supabase: SupabaseClient,
    admin: Option<SupabaseClient>,
}

impl NotificationService {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            supabase: SupabaseClient::new(config),
            admin: SupabaseClient::service_role(config).ok(),
        }
    }

    fn admin(&self) -> Result<&SupabaseClient, NotificationError> {
        self.admin.as_ref().ok_or(NotificationError::ServiceRoleMissing)
    }

    fn representation() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("Prefer", HeaderValue::from_static("return=representation"));
        headers
    }

    fn owned_notification_path(notification_id: Uuid, user_id: &str) -> String {
        format!(
            "/rest/v1/notifications?id=eq.{}&user_id=eq.{}",
            notification_id,
            urlencoding::encode(user_id)
        )
    }

    fn unread_path(user_id: &str) -> String {
        format!(
            "/rest/v1/notifications?user_id=eq.{}&is_read=eq.false",
            urlencoding::encode(user_id)
        )
    }

    pub async fn get_preferences(&self, user_id: Uuid) -> Result<NotificationPreferences, NotificationError> {
        let path = format!("/rest/v1/notification_preferences?select=*&user_id=eq.{}", user_id);

        let rows: Vec<Value> = self
            .admin()?
            .request(Method::GET, &path, None, None)
            .await
            .map_err(|e| NotificationError::DatabaseError(e.to_string()))?;

        match rows.into_iter().next() {
            Some(row) => serde_json::from_value(row)
                .map_err(|e| NotificationError::DatabaseError(format!("Invalid preferences row: {}", e))),
            None => {
                debug!("No notification preferences for {}, using defaults", user_id);
                Ok(NotificationPreferences::default())
            }
        }
    }

    /// Inserts a notification for `request.user_id` unless their preferences
    /// turn it off. Runs with the service-role key.
    #[instrument(skip(self, request), fields(user_id = %request.user_id))]
    pub async fn send(&self, request: SendNotificationRequest) -> Result<SendOutcome, NotificationError> {
        request.validate()?;

        let preferences = self.get_preferences(request.user_id).await?;
        if let Some(reason) = preferences.block_reason(request.notification_type.as_deref()) {
            info!("Notification not sent: {}", reason);
            return Ok(SendOutcome::Skipped { reason });
        }

        let notification_data = json!({
            "user_id": request.user_id,
            "title": request.title,
            "message": request.message,
            "type": request.notification_type,
            "link": request.link,
            "is_read": false,
            "created_at": Utc::now().to_rfc3339()
        });

        let result: Vec<Value> = self
            .admin()?
            .request_with_headers(
                Method::POST,
                "/rest/v1/notifications",
                None,
                Some(notification_data),
                Some(Self::representation()),
            )
            .await
            .map_err(|e| NotificationError::DatabaseError(e.to_string()))?;

        let row = result
            .into_iter()
            .next()
            .ok_or_else(|| NotificationError::DatabaseError("Failed to create notification".to_string()))?;

        let notification = Notification::decode(row)
            .map_err(|e| NotificationError::DatabaseError(e.to_string()))?;

        info!("Notification {} sent", notification.id);
        Ok(SendOutcome::Sent(notification))
    }

    pub async fn list_for_user(&self, user_id: &str, auth_token: &str) -> Result<Vec<Notification>, NotificationError> {
        let path = SupabaseRowQueryService::query_path(
            Notification::TABLE,
            &RowFilter::user_id(user_id),
            &OrderBy::newest_first(),
        );

        let rows: Vec<Value> = self
            .supabase
            .request(Method::GET, &path, Some(auth_token), None)
            .await
            .map_err(|e| NotificationError::DatabaseError(e.to_string()))?;

        let notifications = rows
            .into_iter()
            .filter_map(|row| match Notification::decode(row) {
                Ok(notification) => Some(notification),
                Err(e) => {
                    warn!("Skipping notification row: {}", e);
                    None
                }
            })
            .collect();

        Ok(notifications)
    }

    pub async fn mark_read(
        &self,
        notification_id: Uuid,
        user_id: &str,
        auth_token: &str,
    ) -> Result<Notification, NotificationError> {
        let path = Self::owned_notification_path(notification_id, user_id);

        let result: Vec<Value> = self
            .supabase
            .request_with_headers(
                Method::PATCH,
                &path,
                Some(auth_token),
                Some(json!({ "is_read": true })),
                Some(Self::representation()),
            )
            .await
            .map_err(|e| NotificationError::DatabaseError(e.to_string()))?;

        let row = result.into_iter().next().ok_or(NotificationError::NotFound)?;

        Notification::decode(row).map_err(|e| NotificationError::DatabaseError(e.to_string()))
    }

    /// Returns how many notifications were flipped to read.
    pub async fn mark_all_read(&self, user_id: &str, auth_token: &str) -> Result<usize, NotificationError> {
        let path = Self::unread_path(user_id);

        let result: Vec<Value> = self
            .supabase
            .request_with_headers(
                Method::PATCH,
                &path,
                Some(auth_token),
                Some(json!({ "is_read": true })),
                Some(Self::representation()),
            )
            .await
            .map_err(|e| NotificationError::DatabaseError(e.to_string()))?;

        debug!("Marked {} notifications read for {}", result.len(), user_id);
        Ok(result.len())
    }
}
