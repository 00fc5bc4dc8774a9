use std::cmp;
use std::time::Duration;

use diesel_async::pooled_connection::bb8::Pool;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use tracing::{info, warn};

pub type DbPool = Pool<AsyncPgConnection>;

const INITIAL_RETRY: Duration = Duration::from_millis(500);
const MAX_RETRY: Duration = Duration::from_secs(5);

/// Cheapest possible round trip, used by readiness checks and health probes.
pub async fn ping(conn: &mut AsyncPgConnection) -> diesel::QueryResult<()> {
    diesel::sql_query("SELECT 1").execute(conn).await.map(|_| ())
}

/// Doubling backoff, capped. Never reaches zero, never overflows in practice.
pub fn next_backoff(current: Duration) -> Duration {
    cmp::min(current * 2, MAX_RETRY)
}

/// Blocks until the store answers a trivial query. Retries forever with
/// exponential backoff so a worker started before the database comes up
/// simply waits for it instead of crash-looping.
pub async fn wait_for_store(pool: &DbPool) {
    let mut delay = INITIAL_RETRY;
    loop {
        let outcome = match pool.get().await {
            Ok(mut conn) => ping(&mut conn).await.map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        match outcome {
            Ok(()) => {
                info!("store is ready");
                return;
            }
            Err(error) => {
                warn!(error = %error, retry_ms = delay.as_millis() as u64, "store not ready");
                tokio::time::sleep(delay).await;
                delay = next_backoff(delay);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_capped() {
        let mut delay = INITIAL_RETRY;
        delay = next_backoff(delay);
        assert_eq!(delay, Duration::from_secs(1));
        delay = next_backoff(delay);
        assert_eq!(delay, Duration::from_secs(2));
        delay = next_backoff(delay);
        assert_eq!(delay, Duration::from_secs(4));
        delay = next_backoff(delay);
        assert_eq!(delay, MAX_RETRY);
        assert_eq!(next_backoff(delay), MAX_RETRY);
    }
}
