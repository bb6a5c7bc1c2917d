use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use tracing::{error, info, warn};

use crate::channel::ChannelResolver;
use crate::config::Config;
use crate::db::Db;
use crate::dispatch::{DispatchOutcome, Dispatcher};
use crate::queue::create_for_today;
use crate::render::Renderer;
use crate::reply::ReplyResolver;
use crate::selector::{group_by_user, select_candidates};
use crate::timeout::{self, TimeoutSweeper};
use crate::types::{ChannelKind, ReplyOutcome, ReplyResolution, SweepReport, TimeoutReport};

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub tz: Tz,
    pub max_reminders_per_task: i64,
    pub send_timeout: Duration,
    pub reply_timeout: Duration,
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            tz: config.business_timezone,
            max_reminders_per_task: config.max_reminders_per_task,
            send_timeout: Duration::hours(config.send_timeout_hours),
            reply_timeout: Duration::hours(config.reply_timeout_hours),
        }
    }
}

/// Entry points used by the scheduler and the webhook ingress.
pub struct ReminderEngine {
    db: Arc<Db>,
    channels: Arc<dyn ChannelResolver>,
    renderer: Arc<dyn Renderer>,
    settings: EngineSettings,
    /// Entries already reported as unreachable; retries stay quiet.
    unreachable: Mutex<HashSet<i64>>,
}

impl ReminderEngine {
    pub fn new(
        db: Arc<Db>,
        channels: Arc<dyn ChannelResolver>,
        renderer: Arc<dyn Renderer>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            db,
            channels,
            renderer,
            settings,
            unreachable: Mutex::new(HashSet::new()),
        }
    }

    pub fn db(&self) -> &Arc<Db> {
        &self.db
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    fn dispatcher(&self) -> Dispatcher<'_> {
        Dispatcher {
            db: &self.db,
            channels: self.channels.as_ref(),
            renderer: self.renderer.as_ref(),
            tz: self.settings.tz,
        }
    }

    /// Dispatch for one user, warning once per entry that cannot be routed.
    async fn dispatch(&self, user_id: i64, now: DateTime<Utc>) -> Result<DispatchOutcome> {
        let outcome = self.dispatcher().dispatch_next(user_id, now).await?;
        if let DispatchOutcome::Unreachable { entry_id } = outcome {
            let first = self
                .unreachable
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(entry_id);
            if first {
                warn!(user_id, entry_id, "no reachable chat address for user");
            }
        }
        Ok(outcome)
    }

    fn sweeper(&self) -> TimeoutSweeper<'_> {
        TimeoutSweeper {
            db: &self.db,
            send_timeout: self.settings.send_timeout,
            reply_timeout: self.settings.reply_timeout,
        }
    }

    /// Select today's candidates for a company, queue them and start the
    /// drip for each affected user. One user's failure never stops the rest.
    pub async fn run_daily_sweep(&self, company_id: i64, now: DateTime<Utc>) -> Result<SweepReport> {
        self.sweep_company(company_id, None, now).await
    }

    /// On-demand run for a single user. Only that user's stale entries are
    /// timed out; other users' in-flight state is untouched.
    pub async fn run_for_user(&self, user_id: i64, now: DateTime<Utc>) -> Result<SweepReport> {
        let user = self
            .db
            .get_user(user_id)?
            .with_context(|| format!("user #{user_id} not found"))?;
        self.sweeper().sweep(Some(user_id), now)?;
        self.sweep_company(user.company_id, Some(user_id), now).await
    }

    async fn sweep_company(
        &self,
        company_id: i64,
        only_user: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<SweepReport> {
        let tz = self.settings.tz;
        let candidates = select_candidates(
            &self.db,
            company_id,
            now,
            tz,
            self.settings.max_reminders_per_task,
            only_user,
        )?;
        let mut report = SweepReport {
            company_id,
            candidates: candidates.len(),
            ..Default::default()
        };
        report.created = create_for_today(&self.db, &candidates, now, tz)?;

        // Users with entries still waiting from an earlier run are retried too.
        let mut users: Vec<i64> = group_by_user(candidates).into_keys().collect();
        for user_id in self.db.users_with_waiting(Some(company_id))? {
            if only_user.is_none_or(|u| u == user_id) && !users.contains(&user_id) {
                users.push(user_id);
            }
        }

        for user_id in users {
            match self.dispatch(user_id, now).await {
                Ok(outcome) if outcome.is_sent() => report.dispatched += 1,
                Ok(_) => {}
                Err(e) => {
                    error!(company_id, user_id, "dispatch failed: {e:#}");
                    report.failed_users.push(user_id);
                }
            }
        }

        info!(
            company_id,
            candidates = report.candidates,
            created = report.created,
            dispatched = report.dispatched,
            failed = report.failed_users.len(),
            "reminder sweep finished"
        );
        Ok(report)
    }

    pub async fn resolve_reply(
        &self,
        channel: ChannelKind,
        address: &str,
        event_id: Option<&str>,
        outcome: ReplyOutcome,
        content: &str,
        now: DateTime<Utc>,
    ) -> Result<ReplyResolution> {
        ReplyResolver {
            db: &self.db,
            channels: self.channels.as_ref(),
            renderer: self.renderer.as_ref(),
            tz: self.settings.tz,
        }
        .resolve(channel, address, event_id, outcome, content, now)
        .await
    }

    /// Time out unanswered reminders and send each freed user their next
    /// waiting one, then time out entries that stayed unsent.
    pub async fn sweep_timeouts(&self, scope: Option<i64>, now: DateTime<Utc>) -> Result<TimeoutReport> {
        let sweeper = self.sweeper();
        let no_reply = sweeper.expire_unanswered(scope, now)?;
        let mut freed: Vec<i64> = no_reply.iter().map(|(_, user_id)| *user_id).collect();
        freed.sort_unstable();
        freed.dedup();
        for user_id in freed {
            if let Err(e) = self.dispatch(user_id, now).await {
                error!(user_id, "dispatch after timeout failed: {e:#}");
            }
        }

        let not_sent = sweeper.expire_unsent(scope, now)?;
        if !not_sent.is_empty() {
            let mut reported = self.unreachable.lock().unwrap_or_else(|e| e.into_inner());
            for (entry_id, _) in &not_sent {
                reported.remove(entry_id);
            }
        }
        Ok(timeout::report(&not_sent, &no_reply, scope))
    }

    /// Retry every user with a WAITING entry. Returns how many reminders
    /// went out.
    pub async fn dispatch_pending(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut sent = 0;
        for user_id in self.db.users_with_waiting(None)? {
            match self.dispatch(user_id, now).await {
                Ok(DispatchOutcome::Sent { .. }) => sent += 1,
                Ok(_) => {}
                Err(e) => warn!(user_id, "pending dispatch failed: {e:#}"),
            }
        }
        Ok(sent)
    }
}
