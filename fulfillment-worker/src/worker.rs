use std::time::Duration;

use anyhow::Result;
use diesel::prelude::*;
use diesel_async::{AsyncConnection, RunQueryDsl};
use tokio::sync::watch;
use tracing::{error, info};

use shared::models::{Order, OrderStatus};
use shared::schema::orders;
use shared::DbPool;

const ERROR_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, PartialEq, Eq)]
pub enum StepOutcome {
    /// An order was claimed, fulfilled, and committed as CONFIRMED.
    Confirmed(i64),
    /// No unclaimed PENDING order existed at poll time.
    Idle,
}

/// One fulfillment worker instance. Any number of these may run against the
/// same database; the skip-locked claim guarantees no two of them ever hold
/// the same order, so instances need no coordination beyond the store.
pub struct Worker {
    pool: DbPool,
    poll_interval: Duration,
    work_duration: Duration,
}

impl Worker {
    pub fn new(pool: DbPool, poll_interval: Duration, work_duration: Duration) -> Self {
        Self {
            pool,
            poll_interval,
            work_duration,
        }
    }

    /// Runs `step` until shutdown is signalled. The in-flight step always
    /// finishes; shutdown only stops new iterations from starting.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            poll_ms = self.poll_interval.as_millis() as u64,
            work_ms = self.work_duration.as_millis() as u64,
            "worker started"
        );

        while !*shutdown.borrow() {
            match self.step().await {
                // Drain the backlog: no sleep after a successful claim.
                Ok(StepOutcome::Confirmed(order_id)) => {
                    info!(order_id, "order confirmed");
                }
                Ok(StepOutcome::Idle) => {
                    self.sleep_or_shutdown(self.poll_interval, &mut shutdown).await;
                }
                Err(e) => {
                    error!(error = %e, "worker step failed");
                    self.sleep_or_shutdown(ERROR_BACKOFF, &mut shutdown).await;
                }
            }
        }

        info!("worker stopped");
    }

    /// One poll: claim at most one PENDING order, do the work while holding
    /// its row lock, and flip it to CONFIRMED in the same transaction. Any
    /// error rolls back, returning the order to the pool of claimable work.
    pub async fn step(&self) -> Result<StepOutcome> {
        let mut conn = self.pool.get().await?;
        let work_duration = self.work_duration;

        let outcome = conn
            .transaction::<StepOutcome, anyhow::Error, _>(|conn| {
                Box::pin(async move {
                    let claimed = orders::table
                        .filter(orders::status.eq(OrderStatus::Pending.as_str()))
                        .order(orders::id.asc())
                        .for_update()
                        .skip_locked()
                        .first::<Order>(conn)
                        .await
                        .optional()?;

                    let Some(order) = claimed else {
                        return Ok(StepOutcome::Idle);
                    };

                    info!(order_id = order.id, user_id = order.user_id, "order claimed");

                    // Stands in for the real fulfillment integration
                    // (payment, shipping). No timeout: a hung work step
                    // holds this order's lock until the process dies.
                    tokio::time::sleep(work_duration).await;

                    diesel::update(orders::table.filter(orders::id.eq(order.id)))
                        .set(orders::status.eq(OrderStatus::Confirmed.as_str()))
                        .execute(conn)
                        .await?;

                    Ok(StepOutcome::Confirmed(order.id))
                })
            })
            .await?;

        Ok(outcome)
    }

    async fn sleep_or_shutdown(&self, duration: Duration, shutdown: &mut watch::Receiver<bool>) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = shutdown.changed() => {}
        }
    }
}
