use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::channel::{deliver, resolve_route, ChannelResolver};
use crate::db::Db;
use crate::render::Renderer;
use crate::types::{MessageKind, ReplyOutcome, Task, User};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EscalationReport {
    /// Superiors that received both the intro and the report.
    pub delivered: Vec<i64>,
    /// Superiors with no reachable address.
    pub skipped: Vec<i64>,
    /// Superiors whose send failed.
    pub failed: Vec<i64>,
}

/// Forwards a resolved reply to the replying user's direct superiors.
pub struct EscalationRouter<'a> {
    pub db: &'a Db,
    pub channels: &'a dyn ChannelResolver,
    pub renderer: &'a dyn Renderer,
}

impl EscalationRouter<'_> {
    /// One hop only. A user with no superiors produces an empty report.
    /// Per-superior failures never stop delivery to the others.
    pub async fn escalate(
        &self,
        subordinate: &User,
        task: &Task,
        outcome: ReplyOutcome,
        content: &str,
        now: DateTime<Utc>,
    ) -> Result<EscalationReport> {
        let mut report = EscalationReport::default();
        for superior in self.db.superiors_of(subordinate.id)? {
            if superior.id == subordinate.id {
                warn!(user_id = subordinate.id, "reporting edge points at itself, skipping");
                report.skipped.push(superior.id);
                continue;
            }
            let Some(route) = resolve_route(self.db, self.channels, &superior)? else {
                warn!(
                    superior_id = superior.id,
                    subordinate_id = subordinate.id,
                    "superior has no reachable chat address, skipping escalation"
                );
                report.skipped.push(superior.id);
                continue;
            };

            let intro = self.renderer.report_intro(&superior, subordinate);
            let body = self.renderer.report(subordinate, task, outcome, content);
            let sent = async {
                deliver(self.db, &route, &superior, MessageKind::ReportIntro, &intro, now).await?;
                deliver(self.db, &route, &superior, MessageKind::Report, &body, now).await
            }
            .await;

            match sent {
                Ok(_) => {
                    info!(
                        superior_id = superior.id,
                        subordinate_id = subordinate.id,
                        task_id = task.id,
                        outcome = %outcome,
                        "escalation delivered"
                    );
                    report.delivered.push(superior.id);
                }
                Err(e) => {
                    error!(superior_id = superior.id, task_id = task.id, "escalation send failed: {e:#}");
                    report.failed.push(superior.id);
                }
            }
        }
        Ok(report)
    }
}
