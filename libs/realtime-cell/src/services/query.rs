use async_trait::async_trait;
use reqwest::Method;
use serde_json::Value;
use tracing::{debug, instrument};

use shared_config::AppConfig;
use shared_database::supabase::SupabaseClient;

use crate::{OrderBy, RealtimeError, RowFilter};

/// One-shot row fetch used by the polling fallback.
#[async_trait]
pub trait RowQueryService: Send + Sync + 'static {
    async fn query(
        &self,
        table: &str,
        filter: &RowFilter,
        order: &OrderBy,
    ) -> Result<Vec<Value>, RealtimeError>;
}

pub struct SupabaseRowQueryService {
    supabase: SupabaseClient,
    auth_token: Option<String>,
}

impl SupabaseRowQueryService {
    pub fn new(supabase: SupabaseClient) -> Self {
        Self {
            supabase,
            auth_token: None,
        }
    }

    /// Queries as the given user so row level security applies.
    pub fn for_user(config: &AppConfig, auth_token: &str) -> Self {
        Self {
            supabase: SupabaseClient::new(config),
            auth_token: Some(auth_token.to_string()),
        }
    }

    /// The filter value is percent-encoded; column and table names are not.
    pub fn query_path(table: &str, filter: &RowFilter, order: &OrderBy) -> String {
        format!(
            "/rest/v1/{}?select=*&{}=eq.{}&order={}",
            table,
            filter.column,
            urlencoding::encode(&filter.value),
            order.to_query_value()
        )
    }
}

#[async_trait]
impl RowQueryService for SupabaseRowQueryService {
    #[instrument(skip(self, filter, order))]
    async fn query(
        &self,
        table: &str,
        filter: &RowFilter,
        order: &OrderBy,
    ) -> Result<Vec<Value>, RealtimeError> {
        let path = Self::query_path(table, filter, order);

        let rows: Vec<Value> = self
            .supabase
            .request(Method::GET, &path, self.auth_token.as_deref(), None)
            .await
            .map_err(|e| RealtimeError::Query(e.to_string()))?;

        debug!("Fetched {} rows from {}", rows.len(), table);
        Ok(rows)
    }
}
