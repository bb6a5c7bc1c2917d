use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Timelike, Utc};
use chrono_tz::Tz;
use nudge_core::{engine::ReminderEngine, SweepReport};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

const LAST_SWEEP_KEY: &str = "last_daily_sweep";

/// Drives the periodic work: timeouts and retries every tick, the daily
/// sweep once per business day per company.
pub(crate) struct Scheduler {
    engine: Arc<ReminderEngine>,
    daily_sweep_hour: u32,
    /// Companies with a sweep currently running.
    in_flight: Mutex<HashSet<i64>>,
}

/// The business day whose daily sweep is due at `now`, if any.
pub(crate) fn daily_sweep_due(
    now: DateTime<Utc>,
    tz: Tz,
    hour: u32,
    last_run: Option<NaiveDate>,
) -> Option<NaiveDate> {
    let local = now.with_timezone(&tz);
    if local.hour() < hour {
        return None;
    }
    let today = local.date_naive();
    match last_run {
        Some(day) if day >= today => None,
        _ => Some(today),
    }
}

fn last_sweep_key(company_id: i64) -> String {
    format!("{LAST_SWEEP_KEY}:{company_id}")
}

impl Scheduler {
    pub(crate) fn new(engine: Arc<ReminderEngine>, daily_sweep_hour: u32) -> Self {
        Self {
            engine,
            daily_sweep_hour,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub(crate) fn spawn(self: Arc<Self>, tick_secs: u64) {
        tokio::spawn(async move {
            loop {
                if let Err(e) = self.tick(Utc::now()).await {
                    error!("scheduler tick error: {e:#}");
                }
                tokio::time::sleep(tokio::time::Duration::from_secs(tick_secs)).await;
            }
        });
    }

    pub(crate) async fn tick(&self, now: DateTime<Utc>) -> Result<()> {
        let timeouts = self.engine.sweep_timeouts(None, now).await?;
        if timeouts.not_sent + timeouts.no_reply > 0 {
            info!(
                not_sent = timeouts.not_sent,
                no_reply = timeouts.no_reply,
                "stale reminders timed out"
            );
        }

        let retried = self.engine.dispatch_pending(now).await?;
        if retried > 0 {
            info!(retried, "pending reminders sent");
        }

        self.run_due_daily_sweeps(now).await
    }

    async fn run_due_daily_sweeps(&self, now: DateTime<Utc>) -> Result<()> {
        let db = self.engine.db();
        let tz = self.engine.settings().tz;
        for company in db.list_companies().context("list_companies")? {
            let key = last_sweep_key(company.id);
            let last_run = db
                .get_config(&key)?
                .and_then(|v| NaiveDate::parse_from_str(&v, "%Y-%m-%d").ok());
            let Some(day) = daily_sweep_due(now, tz, self.daily_sweep_hour, last_run) else {
                continue;
            };
            match self.sweep_company(company.id, now).await {
                Ok(Some(_)) => db.set_config(&key, &day.format("%Y-%m-%d").to_string())?,
                Ok(None) => {}
                // Left unmarked so the next tick retries.
                Err(e) => error!(company_id = company.id, "daily sweep failed: {e:#}"),
            }
        }
        Ok(())
    }

    /// Run one company's sweep unless one is already in progress, in which
    /// case `None` is returned.
    pub(crate) async fn sweep_company(
        &self,
        company_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<SweepReport>> {
        {
            let mut guard = self.in_flight.lock().await;
            if !guard.insert(company_id) {
                warn!(company_id, "sweep already running, skipping");
                return Ok(None);
            }
        }
        let result = self.engine.run_daily_sweep(company_id, now).await;
        self.in_flight.lock().await.remove(&company_id);
        result.map(Some)
    }
}
