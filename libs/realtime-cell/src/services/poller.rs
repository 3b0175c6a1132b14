use std::sync::Arc;

use tokio::time::{interval_at, timeout, Duration, Instant, Interval, MissedTickBehavior};

use crate::{ChangeEvent, OrderBy, RealtimeError, RowFilter, RowQueryService, SubscriptionRequest};

/// Re-fetches a subscription's dataset on a fixed interval.
///
/// Failures are returned to the caller and never stop the timer; there is no
/// backoff and no retry limit. A query still running after one period is
/// abandoned and reported as a failure.
pub struct FallbackPoller {
    query: Arc<dyn RowQueryService>,
    table: String,
    filter: RowFilter,
    order: OrderBy,
    period: Duration,
}

impl FallbackPoller {
    pub fn new(query: Arc<dyn RowQueryService>, request: &SubscriptionRequest, period: Duration) -> Self {
        Self {
            query,
            table: request.table.clone(),
            filter: request.filter.clone(),
            order: request.order.clone(),
            period,
        }
    }

    /// First tick fires one full period after installation.
    pub fn ticker(&self) -> Interval {
        let mut ticker = interval_at(Instant::now() + self.period, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    }

    pub async fn poll_once(&self) -> Result<ChangeEvent, RealtimeError> {
        let rows = timeout(
            self.period,
            self.query.query(&self.table, &self.filter, &self.order),
        )
        .await
        .map_err(|_| {
            RealtimeError::Query(format!(
                "{} query timed out after {:?}",
                self.table, self.period
            ))
        })??;
        Ok(ChangeEvent::polling_snapshot(&self.table, rows))
    }
}
