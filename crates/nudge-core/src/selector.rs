use std::collections::BTreeMap;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tracing::debug;

use crate::db::Db;
use crate::types::Candidate;
use crate::window::{candidate_window, remind_days};

/// Open tasks of `company_id` whose remind-days value today is one of the
/// company's offsets, one candidate per (task, responsible user). Read-only.
///
/// `only_user` restricts the result to a single responsible user (on-demand
/// runs).
pub fn select_candidates(
    db: &Db,
    company_id: i64,
    now: DateTime<Utc>,
    tz: Tz,
    max_reminded: i64,
    only_user: Option<i64>,
) -> Result<Vec<Candidate>> {
    let company = db
        .get_company(company_id)?
        .with_context(|| format!("company #{company_id} not found"))?;
    let Some(window) = candidate_window(&company.remind_days, now, tz) else {
        debug!(company_id, "empty reminder policy, nothing to select");
        return Ok(Vec::new());
    };

    let rows = db.open_tasks_in_window(company_id, window.start, window.end, max_reminded, only_user)?;
    let scanned = rows.len();
    let candidates: Vec<Candidate> = rows
        .into_iter()
        .filter_map(|(task, user_id)| {
            let days = remind_days(task.deadline?, now, tz);
            company.remind_days.contains(&days).then_some(Candidate {
                task,
                user_id,
                remind_days: days,
            })
        })
        .collect();

    debug!(
        company_id,
        scanned,
        matched = candidates.len(),
        "selected reminder candidates"
    );
    Ok(candidates)
}

/// Candidates keyed by responsible user, each list in selection order.
pub fn group_by_user(candidates: Vec<Candidate>) -> BTreeMap<i64, Vec<Candidate>> {
    let mut grouped: BTreeMap<i64, Vec<Candidate>> = BTreeMap::new();
    for c in candidates {
        grouped.entry(c.user_id).or_default().push(c);
    }
    grouped
}
