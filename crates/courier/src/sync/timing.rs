//! Run timing helpers
//!
//! Pure functions so the orchestrator and renewal loop can be tested
//! without a clock source.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

/// Whether a stream's last cursor write is old enough to warrant a
/// catch-up run.
///
/// A stream that was never synced is always due.
pub fn cooldown_elapsed(last_synced_at: Option<DateTime<Utc>>, cooldown_secs: u64) -> bool {
    match last_synced_at {
        Some(last) => (Utc::now() - last).num_seconds() >= cooldown_secs as i64,
        None => true,
    }
}

/// Whether a run started at `started` has used up its `budget`
pub fn deadline_exceeded(started: Instant, budget: Option<Duration>) -> bool {
    budget.is_some_and(|budget| started.elapsed() >= budget)
}
