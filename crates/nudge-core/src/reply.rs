use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tracing::{error, info, warn};

use crate::channel::ChannelResolver;
use crate::db::{Db, NewChatMessage};
use crate::dispatch::{DispatchOutcome, Dispatcher};
use crate::escalation::EscalationRouter;
use crate::render::Renderer;
use crate::types::{ChannelKind, Direction, MessageKind, ReplyOutcome, ReplyResolution};
use crate::window::business_day;

/// Matches an inbound reply to the sender's in-flight entry and keeps the
/// drip moving.
pub struct ReplyResolver<'a> {
    pub db: &'a Db,
    pub channels: &'a dyn ChannelResolver,
    pub renderer: &'a dyn Renderer,
    pub tz: Tz,
}

impl ReplyResolver<'_> {
    /// `event_id` is the platform's id for the inbound event; a redelivery
    /// carrying the same id resolves to `Duplicate` and changes nothing.
    pub async fn resolve(
        &self,
        channel: ChannelKind,
        address: &str,
        event_id: Option<&str>,
        outcome: ReplyOutcome,
        content: &str,
        now: DateTime<Utc>,
    ) -> Result<ReplyResolution> {
        let Some(user) = self.db.find_user_by_address(channel, address)? else {
            info!(%channel, address, "reply from unregistered sender ignored");
            return Ok(ReplyResolution::UnknownSender);
        };

        let Some(reply_id) = self.db.insert_inbound_message(
            &NewChatMessage {
                company_id: user.company_id,
                user_id: user.id,
                channel,
                direction: Direction::Inbound,
                kind: MessageKind::Reply,
                external_id: event_id,
                content,
            },
            now,
        )?
        else {
            info!(user_id = user.id, ?event_id, "redelivered reply ignored");
            return Ok(ReplyResolution::Duplicate { user_id: user.id });
        };

        let Some(entry) = self.db.awaiting_reply_entry(user.id)? else {
            info!(user_id = user.id, %outcome, "out-of-band reply, nothing awaiting");
            return Ok(ReplyResolution::OutOfBand { user_id: user.id });
        };
        if entry.message_id.is_none() {
            info!(
                user_id = user.id,
                entry_id = entry.id,
                "reply arrived before the reminder was delivered"
            );
            return Ok(ReplyResolution::OutOfBand { user_id: user.id });
        }

        let task = self
            .db
            .get_task(entry.task_id)?
            .with_context(|| format!("task #{} not found", entry.task_id))?;
        let late = task
            .deadline
            .is_some_and(|d| business_day(now, self.tz) > business_day(d, self.tz));

        // The conditional write decides which of two concurrent replies wins.
        if !self
            .db
            .record_reply(entry.id, reply_id, task.id, outcome, late, now)?
        {
            info!(user_id = user.id, entry_id = entry.id, "entry resolved concurrently");
            return Ok(ReplyResolution::OutOfBand { user_id: user.id });
        }
        info!(
            user_id = user.id,
            entry_id = entry.id,
            task_id = task.id,
            %outcome,
            "reply resolved"
        );

        let router = EscalationRouter {
            db: self.db,
            channels: self.channels,
            renderer: self.renderer,
        };
        let escalated_to = match router.escalate(&user, &task, outcome, content, now).await {
            Ok(report) => report.delivered.len(),
            Err(e) => {
                error!(user_id = user.id, task_id = task.id, "escalation failed: {e:#}");
                0
            }
        };

        let dispatcher = Dispatcher {
            db: self.db,
            channels: self.channels,
            renderer: self.renderer,
            tz: self.tz,
        };
        let next_entry_id = match dispatcher.dispatch_next(user.id, now).await {
            Ok(DispatchOutcome::Sent { entry_id }) => Some(entry_id),
            Ok(_) => None,
            Err(e) => {
                warn!(user_id = user.id, "follow-up dispatch failed: {e:#}");
                None
            }
        };

        Ok(ReplyResolution::Resolved {
            entry_id: entry.id,
            task_id: task.id,
            escalated_to,
            next_entry_id,
        })
    }
}
