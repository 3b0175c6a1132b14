use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{ChannelConfig, FeedMessage, RealtimeError};

/// An open change-feed channel. Status updates and row changes arrive on
/// `messages` in the order the feed produced them; the sender side is dropped
/// when the feed goes away.
#[derive(Debug)]
pub struct FeedChannel {
    pub name: String,
    pub messages: mpsc::UnboundedReceiver<FeedMessage>,
}

/// Push-based change notification service.
#[async_trait]
pub trait ChangeFeedTransport: Send + Sync + 'static {
    async fn open_channel(&self, config: &ChannelConfig) -> Result<FeedChannel, RealtimeError>;

    /// Releases the channel. Closing an unknown name is a no-op.
    async fn close_channel(&self, name: &str);
}
