use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RealtimeError {
    #[error("Invalid subscription: {0}")]
    InvalidSubscription(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Update callback failed: {0}")]
    Callback(String),

    #[error("Malformed {table} row: {reason}")]
    MalformedRow { table: String, reason: String },
}
