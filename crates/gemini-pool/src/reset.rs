//! Daily quota reset scheduler
//!
//! One background task for the process lifetime: sleep to the next midnight
//! in a fixed reference timezone, clear every exhaustion flag and request
//! counter under the store lock, persist, repeat. The boundary is recomputed
//! from the current time each cycle, so timer overshoot and clock skew only
//! shift the next wake-up, never skip a day. Shutdown aborts the task via
//! the returned handle; there is no other cancellation.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Days, LocalResult, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use gemini_keys::KeyStore;
use tracing::{debug, warn};

/// Spawn the daily reset task for `store`, resetting at midnight in `tz`.
///
/// Returns the `JoinHandle` so the caller can abort it on shutdown.
pub fn spawn_reset_task(store: Arc<KeyStore>, tz: Tz) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let now = Utc::now().with_timezone(&tz);
            let sleep_for = until_next_midnight(&now);
            debug!(
                timezone = %tz,
                sleep_secs = sleep_for.as_secs(),
                "next daily quota reset scheduled"
            );
            tokio::time::sleep(sleep_for).await;

            if let Err(e) = store.reset_daily().await {
                warn!(error = %e, "daily reset failed to persist, state cleared in memory");
            }

            // Guard so one boundary never fires twice within the same second
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    })
}

/// Time until the next local midnight after `now`.
///
/// DST transitions at the boundary are resolved toward the earliest valid
/// instant; a nonexistent local midnight (spring-forward gap) slides one
/// hour later. The fallback of a flat 24 hours only applies if the timezone
/// database produces no valid instant at all.
fn until_next_midnight(now: &DateTime<Tz>) -> Duration {
    let tz = now.timezone();
    let next_day = now
        .date_naive()
        .checked_add_days(Days::new(1))
        .unwrap_or(now.date_naive());
    let local_midnight = next_day.and_time(NaiveTime::MIN);

    let boundary = match tz.from_local_datetime(&local_midnight) {
        LocalResult::Single(t) => t,
        LocalResult::Ambiguous(earliest, _) => earliest,
        LocalResult::None => tz
            .from_local_datetime(&(local_midnight + chrono::Duration::hours(1)))
            .earliest()
            .unwrap_or_else(|| *now + chrono::Duration::days(1)),
    };

    (boundary - now)
        .to_std()
        .unwrap_or(Duration::from_secs(1))
}
