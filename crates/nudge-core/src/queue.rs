//! Queue store operations layered over `Db`.
//!
//! Entries move only along `QueueStatus::can_transition_to`; every write is
//! conditional on the status the caller last saw, so a concurrent writer
//! turns a transition into a no-op instead of a double step.

use anyhow::Result;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tracing::info;

use crate::db::Db;
use crate::types::{Candidate, QueueEntry, QueueError, QueueStatus};
use crate::window::business_day;

/// Insert one WAITING entry per candidate for today's business day.
/// Re-running on the same day with the same candidates creates nothing.
pub fn create_for_today(db: &Db, candidates: &[Candidate], now: DateTime<Utc>, tz: Tz) -> Result<usize> {
    if candidates.is_empty() {
        return Ok(0);
    }
    let day = business_day(now, tz);
    let created = db.create_queue_entries(candidates, day, now)?;
    info!(
        %day,
        candidates = candidates.len(),
        created,
        "reminder queue entries created"
    );
    Ok(created)
}

/// Move `entry` to `to`. Returns false when the stored status no longer
/// matches `entry.status` (another writer advanced it first).
pub fn advance(db: &Db, entry: &QueueEntry, to: QueueStatus, now: DateTime<Utc>) -> Result<bool> {
    if !entry.status.can_transition_to(to) {
        return Err(QueueError::IllegalTransition {
            entry_id: entry.id,
            from: entry.status,
            to,
        }
        .into());
    }
    db.transition(entry.id, entry.status, to, now)
}
