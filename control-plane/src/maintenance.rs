use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use deadpool_postgres::Pool;

use crate::args::ServerArgs;
use crate::db;

/// Runs forever, GC'ing expired idempotency keys and out-of-window rate records. Must not
/// block request handling; transient database errors are logged and retried next tick.
pub async fn run(pool: Pool, args: ServerArgs) {
    let interval = Duration::from_millis(args.maintenance_interval_ms);
    let idempotency_window = ChronoDuration::milliseconds(args.idempotency_window_ms);

    loop {
        tokio::time::sleep(interval).await;

        let now = Utc::now();
        match db::gc_idempotency_keys(&pool, now - idempotency_window).await {
            Ok(n) if n > 0 => tracing::info!(removed = n, "garbage-collected idempotency keys"),
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "idempotency key gc failed, retrying next tick"),
        }

        match db::gc_rate_limits(&pool, now - ChronoDuration::hours(1)).await {
            Ok(n) if n > 0 => tracing::info!(removed = n, "garbage-collected rate limit records"),
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "rate limit gc failed, retrying next tick"),
        }
    }
}
