use std::any::Any;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, info, instrument, warn};

use shared_config::AppConfig;

use crate::{
    ChangeEvent, ChangeFeedTransport, ChannelConfig, ChannelStatus, FallbackPoller, FeedMessage,
    RealtimeError, RowChange, RowQueryService, SubscriptionHandlers, SubscriptionMode,
    SubscriptionRequest, TableRow,
};

#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub poll_interval: Duration,
}

impl RegistrySettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            poll_interval: Duration::from_millis(config.realtime_poll_interval_ms),
        }
    }
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(shared_config::DEFAULT_POLL_INTERVAL_MS),
        }
    }
}

struct ActiveSubscription {
    mode: watch::Receiver<SubscriptionMode>,
    /// `false` once torn down. Held for the duration of every callback.
    gate: Arc<Mutex<bool>>,
    task: JoinHandle<()>,
}

/// Owns every live subscription and hides whether each one is served by the
/// push feed or by polling.
///
/// Push availability is a registry-wide circuit breaker: the first push
/// failure on any channel clears it, and later subscriptions go straight to
/// polling. It is never reset; a fresh registry is the only way to retry push.
pub struct SubscriptionRegistry {
    transport: Arc<dyn ChangeFeedTransport>,
    query: Arc<dyn RowQueryService>,
    settings: RegistrySettings,
    subscriptions: RwLock<HashMap<String, ActiveSubscription>>,
    push_available: Arc<AtomicBool>,
}

impl SubscriptionRegistry {
    pub fn new(
        transport: Arc<dyn ChangeFeedTransport>,
        query: Arc<dyn RowQueryService>,
        settings: RegistrySettings,
    ) -> Self {
        Self {
            transport,
            query,
            settings,
            subscriptions: RwLock::new(HashMap::new()),
            push_available: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Starts watching `request`. Replaces any subscription already registered
    /// under the same channel name. Returns once the subscription task is
    /// installed; connection and polling happen in the background.
    #[instrument(skip(self, request, handlers), fields(channel = %request.channel_name, table = %request.table))]
    pub async fn subscribe(
        &self,
        request: SubscriptionRequest,
        handlers: SubscriptionHandlers,
    ) -> Result<(), RealtimeError> {
        request.validate()?;

        let mut subscriptions = self.subscriptions.write().await;

        if let Some(previous) = subscriptions.remove(&request.channel_name) {
            debug!("Replacing existing subscription {}", request.channel_name);
            self.release(&request.channel_name, previous).await;
        }

        let try_push = self.push_available.load(Ordering::SeqCst);
        let initial_mode = if try_push {
            SubscriptionMode::Push
        } else {
            SubscriptionMode::Polling
        };
        let (mode_tx, mode_rx) = watch::channel(initial_mode);
        let gate = Arc::new(Mutex::new(true));

        let channel_name = request.channel_name.clone();
        let driver = SubscriptionDriver {
            request,
            handlers,
            transport: Arc::clone(&self.transport),
            query: Arc::clone(&self.query),
            push_available: Arc::clone(&self.push_available),
            mode: mode_tx,
            gate: Arc::clone(&gate),
            poll_interval: self.settings.poll_interval,
        };

        let task = tokio::spawn(driver.run(try_push));

        subscriptions.insert(channel_name, ActiveSubscription {
            mode: mode_rx,
            gate,
            task,
        });

        Ok(())
    }

    /// Subscribes to a typed table, filtered on the row owner.
    ///
    /// Malformed rows never reach `on_change`; they are reported through
    /// `on_error` as [`RealtimeError::MalformedRow`].
    pub async fn subscribe_rows<T, F, E>(
        &self,
        channel_name: &str,
        owner_id: &str,
        on_change: F,
        on_error: E,
    ) -> Result<(), RealtimeError>
    where
        T: TableRow,
        F: Fn(RowChange<T>) -> anyhow::Result<()> + Send + Sync + 'static,
        E: Fn(RealtimeError) + Send + Sync + 'static,
    {
        let request = SubscriptionRequest::new(channel_name, T::TABLE, owner_id)
            .with_filter_column(T::FILTER_COLUMN);

        let on_error = Arc::new(on_error);
        let row_errors = Arc::clone(&on_error);

        let handlers = SubscriptionHandlers::new(move |event| {
            match RowChange::<T>::decode(event) {
                Ok(decoded) => {
                    for rejected in decoded.rejected {
                        row_errors(rejected);
                    }
                    on_change(decoded.change)
                }
                Err(e) => {
                    row_errors(e);
                    Ok(())
                }
            }
        })
        .on_error(move |e| on_error(e));

        self.subscribe(request, handlers).await
    }

    /// No-op for unknown names.
    #[instrument(skip(self))]
    pub async fn unsubscribe(&self, channel_name: &str) {
        let removed = self.subscriptions.write().await.remove(channel_name);

        match removed {
            Some(subscription) => {
                self.release(channel_name, subscription).await;
                info!("Unsubscribed realtime channel {}", channel_name);
            }
            None => debug!("No subscription named {}", channel_name),
        }
    }

    /// Unsubscribes everything. Push availability is left as it was.
    pub async fn cleanup(&self) {
        let drained: Vec<(String, ActiveSubscription)> =
            self.subscriptions.write().await.drain().collect();

        let count = drained.len();
        for (channel_name, subscription) in drained {
            self.release(&channel_name, subscription).await;
        }

        if count > 0 {
            info!("Released {} realtime subscriptions", count);
        }
    }

    pub fn is_available(&self) -> bool {
        self.push_available.load(Ordering::SeqCst)
    }

    pub async fn mode(&self, channel_name: &str) -> Option<SubscriptionMode> {
        let subscriptions = self.subscriptions.read().await;
        subscriptions
            .get(channel_name)
            .map(|subscription| *subscription.mode.borrow())
    }

    pub async fn channel_names(&self) -> Vec<String> {
        let subscriptions = self.subscriptions.read().await;
        subscriptions.keys().cloned().collect()
    }

    async fn release(&self, channel_name: &str, subscription: ActiveSubscription) {
        *subscription.gate.lock().await = false;

        subscription.task.abort();
        // Wait until the task has stopped so nothing it owns outlives this call
        let _ = subscription.task.await;

        // A polling subscription closed its feed before it started polling
        if *subscription.mode.borrow() == SubscriptionMode::Push {
            self.transport.close_channel(channel_name).await;
        }
    }
}

impl Drop for SubscriptionRegistry {
    fn drop(&mut self) {
        for subscription in self.subscriptions.get_mut().values() {
            subscription.task.abort();
        }
    }
}

/// Background task for one subscription. It owns exactly one handle at a
/// time: the feed channel while pushing, the poll timer once degraded.
struct SubscriptionDriver {
    request: SubscriptionRequest,
    handlers: SubscriptionHandlers,
    transport: Arc<dyn ChangeFeedTransport>,
    query: Arc<dyn RowQueryService>,
    push_available: Arc<AtomicBool>,
    mode: watch::Sender<SubscriptionMode>,
    gate: Arc<Mutex<bool>>,
    poll_interval: Duration,
}

impl SubscriptionDriver {
    async fn run(self, try_push: bool) {
        if try_push {
            let reason = self.run_push().await;
            warn!(
                "Realtime unavailable for {} ({}), falling back to polling every {:?}",
                self.request.channel_name, reason, self.poll_interval
            );
            self.push_available.store(false, Ordering::SeqCst);
        } else {
            debug!(
                "Push marked unavailable, polling {} directly",
                self.request.channel_name
            );
        }

        self.mode.send_replace(SubscriptionMode::Polling);
        self.run_polling().await;
    }

    /// Runs until the feed fails; returns why. The channel is closed on return.
    async fn run_push(&self) -> String {
        let config = ChannelConfig::from(&self.request);

        let mut channel = match self.transport.open_channel(&config).await {
            Ok(channel) => channel,
            Err(e) => return e.to_string(),
        };

        let reason = loop {
            match channel.messages.recv().await {
                Some(FeedMessage::Status(ChannelStatus::Subscribed)) => {
                    self.mode.send_replace(SubscriptionMode::Push);
                    info!("Realtime channel {} subscribed", config.name);
                }
                Some(FeedMessage::Status(status)) => {
                    break format!("channel reported {}", status);
                }
                Some(FeedMessage::Change(event)) => self.deliver(event).await,
                None => break "feed ended".to_string(),
            }
        };

        drop(channel);
        self.transport.close_channel(&config.name).await;
        reason
    }

    async fn run_polling(&self) {
        let poller = FallbackPoller::new(Arc::clone(&self.query), &self.request, self.poll_interval);
        let mut ticker = poller.ticker();

        loop {
            ticker.tick().await;

            match poller.poll_once().await {
                Ok(event) => self.deliver(event).await,
                Err(e) => {
                    warn!("Polling {} failed: {}", self.request.channel_name, e);
                    self.report(e).await;
                }
            }
        }
    }

    async fn deliver(&self, event: ChangeEvent) {
        let open = self.gate.lock().await;
        if !*open {
            return;
        }

        let on_update = &self.handlers.on_update;
        let failure = match catch_unwind(AssertUnwindSafe(|| on_update(event))) {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e.to_string(),
            Err(panic) => format!("panicked: {}", panic_message(panic.as_ref())),
        };

        self.notify_error(RealtimeError::Callback(failure));
    }

    async fn report(&self, error: RealtimeError) {
        let open = self.gate.lock().await;
        if *open {
            self.notify_error(error);
        }
    }

    fn notify_error(&self, error: RealtimeError) {
        match &self.handlers.on_error {
            Some(on_error) => {
                if catch_unwind(AssertUnwindSafe(|| on_error(error))).is_err() {
                    warn!("Error callback for {} panicked", self.request.channel_name);
                }
            }
            None => warn!(
                "Unhandled realtime error on {}: {}",
                self.request.channel_name, error
            ),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
