use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::channel::{deliver, resolve_route, ChannelResolver};
use crate::db::Db;
use crate::queue::advance;
use crate::render::Renderer;
use crate::types::{MessageKind, QueueStatus};
use crate::window::{business_day, remind_days};

/// What one `dispatch_next` call did for a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum DispatchOutcome {
    /// Reminder delivered; the entry is now awaiting a reply.
    Sent { entry_id: i64 },
    /// Another entry of the user is already awaiting a reply.
    Blocked,
    /// Nothing waiting.
    Idle,
    /// The user has no address on a channel the company can send on.
    Unreachable { entry_id: i64 },
    /// The send failed; the entry stays WAITING for the next tick.
    SendFailed { entry_id: i64 },
}

impl DispatchOutcome {
    pub fn is_sent(&self) -> bool {
        matches!(self, Self::Sent { .. })
    }
}

/// Sends at most one reminder per user at a time.
pub struct Dispatcher<'a> {
    pub db: &'a Db,
    pub channels: &'a dyn ChannelResolver,
    pub renderer: &'a dyn Renderer,
    pub tz: Tz,
}

impl Dispatcher<'_> {
    /// Send the user's oldest WAITING entry, preceded by the day's intro if
    /// it has not gone out yet. Channel failures are logged and
    /// reported in the outcome, never returned as errors.
    pub async fn dispatch_next(&self, user_id: i64, now: DateTime<Utc>) -> Result<DispatchOutcome> {
        let today = business_day(now, self.tz);
        if self.db.awaiting_reply_entry(user_id)?.is_some() {
            debug!(user_id, "reply pending, drip blocked");
            return Ok(DispatchOutcome::Blocked);
        }

        loop {
            let Some(entry) = self.db.next_waiting_entry(user_id)? else {
                return Ok(DispatchOutcome::Idle);
            };

            let task = match self.db.get_task(entry.task_id)? {
                Some(task) if task.is_open() => task,
                _ => {
                    // Resolved elsewhere since selection; nothing to ask.
                    info!(
                        entry_id = entry.id,
                        task_id = entry.task_id,
                        "task no longer open, dropping reminder"
                    );
                    advance(self.db, &entry, QueueStatus::TimeoutNotSent, now)?;
                    continue;
                }
            };

            let user = self
                .db
                .get_user(user_id)?
                .with_context(|| format!("user #{user_id} not found"))?;
            let Some(route) = resolve_route(self.db, self.channels, &user)? else {
                debug!(user_id, entry_id = entry.id, "no route for user, entry left waiting");
                return Ok(DispatchOutcome::Unreachable { entry_id: entry.id });
            };

            // Claimed before sending so no second reminder can start. Until
            // `attach_message` runs the entry has no message, and replies
            // that arrive in that gap are treated as out of band.
            if !self.db.claim_for_dispatch(entry.id, user_id, now)? {
                debug!(user_id, entry_id = entry.id, "claim lost");
                return Ok(DispatchOutcome::Blocked);
            }

            if self.db.mark_intro_sent(user_id, today)? {
                let intro = self.renderer.intro(&user);
                if let Err(e) = deliver(self.db, &route, &user, MessageKind::Intro, &intro, now).await {
                    error!(user_id, entry_id = entry.id, "intro send failed: {e:#}");
                    self.db.clear_intro(user_id, today)?;
                    self.release(entry.id, now)?;
                    return Ok(DispatchOutcome::SendFailed { entry_id: entry.id });
                }
            }

            // An entry queued on an earlier day is phrased against today.
            let days = task
                .deadline
                .map_or(entry.remind_days, |d| remind_days(d, now, self.tz));
            let reminder = self.renderer.reminder(&task, days);
            let message_id =
                match deliver(self.db, &route, &user, MessageKind::Reminder, &reminder, now).await {
                    Ok(id) => id,
                    Err(e) => {
                        error!(
                            user_id,
                            entry_id = entry.id,
                            task_id = task.id,
                            "reminder send failed: {e:#}"
                        );
                        self.release(entry.id, now)?;
                        return Ok(DispatchOutcome::SendFailed { entry_id: entry.id });
                    }
                };

            self.db.attach_message(entry.id, message_id)?;
            self.db.record_reminder_sent(task.id, days < 0)?;
            info!(
                user_id,
                entry_id = entry.id,
                task_id = task.id,
                remind_days = days,
                channel = %route.kind,
                "reminder sent"
            );
            return Ok(DispatchOutcome::Sent { entry_id: entry.id });
        }
    }

    fn release(&self, entry_id: i64, now: DateTime<Utc>) -> Result<()> {
        if !self
            .db
            .transition(entry_id, QueueStatus::AwaitingReply, QueueStatus::Waiting, now)?
        {
            warn!(entry_id, "claim already moved on before release");
        }
        Ok(())
    }
}
