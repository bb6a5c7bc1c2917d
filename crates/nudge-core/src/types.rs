use std::{fmt, str::FromStr};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

// ── Transport / Messaging ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Slack,
    Telegram,
    Line,
}

impl ChannelKind {
    /// Order in which a user's registered addresses are tried.
    pub const PREFERENCE: [ChannelKind; 3] = [Self::Slack, Self::Telegram, Self::Line];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Slack => "slack",
            Self::Telegram => "telegram",
            Self::Line => "line",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "slack" => Ok(Self::Slack),
            "telegram" => Ok(Self::Telegram),
            "line" => Ok(Self::Line),
            other => anyhow::bail!("unknown channel {other:?}"),
        }
    }
}

/// Task-tracking backend a task was imported from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskApp {
    Trello,
    Microsoft,
    Notion,
}

impl TaskApp {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trello => "trello",
            Self::Microsoft => "microsoft",
            Self::Notion => "notion",
        }
    }
}

impl FromStr for TaskApp {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "trello" => Ok(Self::Trello),
            "microsoft" => Ok(Self::Microsoft),
            "notion" => Ok(Self::Notion),
            other => anyhow::bail!("unknown task app {other:?}"),
        }
    }
}

// ── Organisation ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Company {
    pub id: i64,
    pub name: String,
    /// Day offsets relative to the deadline: 2 = two days before, 0 = due
    /// today, -1 = one day overdue.
    pub remind_days: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub company_id: i64,
    pub name: String,
}

// ── Tasks ────────────────────────────────────────────────────────────────

/// A task as exposed by the task-sync read model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub company_id: i64,
    pub task_app: TaskApp,
    pub external_id: String,
    pub title: String,
    pub deadline: Option<DateTime<Utc>>,
    pub done: bool,
    pub closed: bool,
    pub reminded_count: i64,
    pub delayed_count: i64,
}

impl Task {
    pub fn is_open(&self) -> bool {
        !self.done && !self.closed
    }
}

/// Importer-facing shape used to upsert a task.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub company_id: i64,
    pub task_app: TaskApp,
    pub external_id: String,
    pub title: String,
    pub deadline: Option<DateTime<Utc>>,
    pub done: bool,
    pub closed: bool,
}

/// One (task, responsible user) pair that should be reminded today.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub task: Task,
    pub user_id: i64,
    pub remind_days: i64,
}

// ── Reminder queue ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    /// Created, not yet sent.
    Waiting,
    /// Sent; blocks the rest of the user's queue until resolved.
    AwaitingReply,
    Replied,
    TimeoutNotSent,
    TimeoutNoReply,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::AwaitingReply => "awaiting_reply",
            Self::Replied => "replied",
            Self::TimeoutNotSent => "timeout_not_sent",
            Self::TimeoutNoReply => "timeout_no_reply",
        }
    }

    /// Transition table. `AwaitingReply → Waiting` is the dispatcher
    /// releasing its claim after a failed send.
    pub fn can_transition_to(&self, next: QueueStatus) -> bool {
        matches!(
            (self, next),
            (Self::Waiting, Self::AwaitingReply)
                | (Self::Waiting, Self::TimeoutNotSent)
                | (Self::AwaitingReply, Self::Replied)
                | (Self::AwaitingReply, Self::TimeoutNoReply)
                | (Self::AwaitingReply, Self::Waiting)
        )
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "waiting" => Ok(Self::Waiting),
            "awaiting_reply" => Ok(Self::AwaitingReply),
            "replied" => Ok(Self::Replied),
            "timeout_not_sent" => Ok(Self::TimeoutNotSent),
            "timeout_no_reply" => Ok(Self::TimeoutNoReply),
            other => anyhow::bail!("unknown queue status {other:?}"),
        }
    }
}

/// "Task X should remind user Y on business day D."
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: i64,
    pub task_id: i64,
    pub user_id: i64,
    pub reminder_day: NaiveDate,
    pub remind_days: i64,
    pub status: QueueStatus,
    /// Outbound reminder in `chat_messages`, set once dispatched.
    pub message_id: Option<i64>,
    /// Inbound reply in `chat_messages`, set once replied.
    pub reply_message_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    /// Time the entry entered its current status.
    pub updated_at: DateTime<Utc>,
}

/// Violations of the queue state machine. These abort the current unit of
/// work; every other failure is logged and skipped.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("illegal transition {from} -> {to} for queue entry #{entry_id}")]
    IllegalTransition {
        entry_id: i64,
        from: QueueStatus,
        to: QueueStatus,
    },
    #[error("user #{user_id} already has an entry awaiting reply")]
    InFlightConflict { user_id: i64 },
}

// ── Replies ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyOutcome {
    Done,
    InProgress,
    Delayed,
    Withdrawn,
}

impl ReplyOutcome {
    pub const ALL: [ReplyOutcome; 4] = [Self::Done, Self::InProgress, Self::Delayed, Self::Withdrawn];

    /// Action id carried by buttons and quick replies.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Done => "done",
            Self::InProgress => "in_progress",
            Self::Delayed => "delayed",
            Self::Withdrawn => "withdrawn",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Done => "Done",
            Self::InProgress => "In progress",
            Self::Delayed => "Delayed",
            Self::Withdrawn => "Withdrawn",
        }
    }

    /// Best-effort classification of a free-text reply or action id.
    /// Returns None when the text cannot be mapped to an outcome.
    pub fn classify(text: &str) -> Option<Self> {
        let normalized = text.trim().to_lowercase();
        if let Ok(outcome) = normalized.parse() {
            return Some(outcome);
        }
        let normalized = normalized.replace(['-', '_'], " ");
        let mentions = |words: &[&str]| words.iter().any(|w| normalized.contains(w));
        // "not done" must win over "done"
        if mentions(&["delay", "late", "not done", "not yet", "postpone"]) {
            Some(Self::Delayed)
        } else if mentions(&["withdraw", "cancel", "drop", "no longer"]) {
            Some(Self::Withdrawn)
        } else if mentions(&["in progress", "working", "wip", "started", "ongoing"]) {
            Some(Self::InProgress)
        } else if mentions(&["done", "finished", "complete", "completed"]) {
            Some(Self::Done)
        } else {
            None
        }
    }
}

impl fmt::Display for ReplyOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReplyOutcome {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "done" => Ok(Self::Done),
            "in_progress" => Ok(Self::InProgress),
            "delayed" => Ok(Self::Delayed),
            "withdrawn" => Ok(Self::Withdrawn),
            other => anyhow::bail!("unknown reply outcome {other:?}"),
        }
    }
}

// ── Chat message log ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Outbound,
    Inbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Outbound => "outbound",
            Self::Inbound => "inbound",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Intro,
    Reminder,
    ReportIntro,
    Report,
    Reply,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Intro => "intro",
            Self::Reminder => "reminder",
            Self::ReportIntro => "report_intro",
            Self::Report => "report",
            Self::Reply => "reply",
        }
    }
}

/// Immutable log row for every message sent or received.
#[derive(Debug, Clone, Serialize)]
pub struct ChatMessageRecord {
    pub id: i64,
    pub company_id: i64,
    pub user_id: i64,
    pub channel: String,
    pub direction: String,
    pub kind: String,
    /// Message id assigned by the chat platform, when it returns one.
    pub external_id: Option<String>,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Channel-agnostic message produced by the rendering layer.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub text: String,
    /// Quick-reply choices offered with the message (reminders only).
    #[serde(default)]
    pub actions: Vec<ReplyOutcome>,
}

impl OutboundMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            actions: Vec::new(),
        }
    }
}

// ── Run reports ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub company_id: i64,
    pub candidates: usize,
    pub created: usize,
    pub dispatched: usize,
    /// Users whose dispatch faulted; other users were still processed.
    pub failed_users: Vec<i64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TimeoutReport {
    pub not_sent: usize,
    pub no_reply: usize,
    /// Users with at least one entry moved to a timeout state.
    pub user_ids: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ReplyResolution {
    Resolved {
        entry_id: i64,
        task_id: i64,
        escalated_to: usize,
        /// Next entry put in flight by the same call, if any.
        next_entry_id: Option<i64>,
    },
    /// No delivered entry was awaiting a reply from this user.
    OutOfBand { user_id: i64 },
    /// The same inbound event was already handled.
    Duplicate { user_id: i64 },
    /// The sender is not registered on that channel.
    UnknownSender,
}
