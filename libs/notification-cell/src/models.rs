use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use realtime_cell::Notification;
use shared_models::auth::User;
use shared_models::error::AppError;

/// Roles allowed to notify users other than themselves.
const SENDER_ROLES: [&str; 2] = ["service_role", "admin"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendNotificationRequest {
    pub user_id: Uuid,
    pub title: String,
    pub message: String,
    #[serde(rename = "type", default)]
    pub notification_type: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
}

impl SendNotificationRequest {
    pub fn validate(&self) -> Result<(), NotificationError> {
        if self.title.trim().is_empty() {
            return Err(NotificationError::ValidationError("title must not be empty".to_string()));
        }
        if self.message.trim().is_empty() {
            return Err(NotificationError::ValidationError("message must not be empty".to_string()));
        }
        Ok(())
    }

    /// Callers may notify themselves; notifying anyone else needs a sender role.
    pub fn authorize(&self, caller: &User) -> Result<(), NotificationError> {
        let is_recipient = self.user_id.to_string() == caller.id;
        let is_sender = caller
            .role
            .as_deref()
            .is_some_and(|role| SENDER_ROLES.contains(&role));

        if is_recipient || is_sender {
            Ok(())
        } else {
            Err(NotificationError::Forbidden(format!(
                "not allowed to notify user {}",
                self.user_id
            )))
        }
    }
}

/// Row of `notification_preferences`. A user without a row gets everything.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationPreferences {
    #[serde(default = "default_in_app_enabled")]
    pub in_app_enabled: bool,
    #[serde(default)]
    pub disabled_types: Vec<String>,
}

fn default_in_app_enabled() -> bool {
    true
}

impl Default for NotificationPreferences {
    fn default() -> Self {
        Self {
            in_app_enabled: true,
            disabled_types: Vec::new(),
        }
    }
}

impl NotificationPreferences {
    /// Why a notification of this type must not be sent, if it must not.
    pub fn block_reason(&self, notification_type: Option<&str>) -> Option<String> {
        if !self.in_app_enabled {
            return Some("in-app notifications are disabled".to_string());
        }

        notification_type
            .filter(|kind| self.disabled_types.iter().any(|disabled| disabled == kind))
            .map(|kind| format!("notifications of type {} are disabled", kind))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    Sent(Notification),
    Skipped { reason: String },
}

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("Notification not found")]
    NotFound,

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Service role key is not configured")]
    ServiceRoleMissing,

    #[error("Database error: {0}")]
    DatabaseError(String),
}

impl From<NotificationError> for AppError {
    fn from(err: NotificationError) -> Self {
        match err {
            NotificationError::NotFound => AppError::NotFound(err.to_string()),
            NotificationError::ValidationError(msg) => AppError::ValidationError(msg),
            NotificationError::Forbidden(msg) => AppError::Forbidden(msg),
            NotificationError::ServiceRoleMissing => AppError::Internal(err.to_string()),
            NotificationError::DatabaseError(msg) => AppError::ExternalService(msg),
        }
    }
}
