use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use tracing::info;

use crate::db::Db;
use crate::types::TimeoutReport;

/// Moves stale entries into the timeout terminal states.
pub struct TimeoutSweeper<'a> {
    pub db: &'a Db,
    pub send_timeout: Duration,
    pub reply_timeout: Duration,
}

impl TimeoutSweeper<'_> {
    /// Reminders that went unanswered for the reply timeout. Each moved
    /// entry frees its user's drip.
    pub fn expire_unanswered(&self, scope: Option<i64>, now: DateTime<Utc>) -> Result<Vec<(i64, i64)>> {
        self.db.expire_unanswered(now - self.reply_timeout, scope, now)
    }

    /// Entries that could have been sent for the whole send timeout but
    /// never were.
    pub fn expire_unsent(&self, scope: Option<i64>, now: DateTime<Utc>) -> Result<Vec<(i64, i64)>> {
        self.db.expire_unsent(now - self.send_timeout, scope, now)
    }

    /// Both passes, reply timeouts first. `scope` limits the sweep to one
    /// user's entries.
    pub fn sweep(&self, scope: Option<i64>, now: DateTime<Utc>) -> Result<TimeoutReport> {
        let no_reply = self.expire_unanswered(scope, now)?;
        let not_sent = self.expire_unsent(scope, now)?;
        Ok(report(&not_sent, &no_reply, scope))
    }
}

pub(crate) fn report(
    not_sent: &[(i64, i64)],
    no_reply: &[(i64, i64)],
    scope: Option<i64>,
) -> TimeoutReport {
    let mut user_ids: Vec<i64> = not_sent
        .iter()
        .chain(no_reply.iter())
        .map(|(_, user_id)| *user_id)
        .collect();
    user_ids.sort_unstable();
    user_ids.dedup();

    if !not_sent.is_empty() || !no_reply.is_empty() {
        info!(
            not_sent = not_sent.len(),
            no_reply = no_reply.len(),
            users = user_ids.len(),
            ?scope,
            "queue entries timed out"
        );
    }
    TimeoutReport {
        not_sent: not_sent.len(),
        no_reply: no_reply.len(),
        user_ids,
    }
}
