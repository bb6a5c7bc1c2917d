#![allow(dead_code)]

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicI64, Ordering},
        Arc, Mutex,
    },
};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use nudge_core::{
    channel::{ChannelResolver, ChatChannel},
    db::Db,
    engine::{EngineSettings, ReminderEngine},
    render::PlainRenderer,
    ChannelKind, NewTask, OutboundMessage, QueueStatus, TaskApp,
};

// ── recording channel ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Sent {
    pub address: String,
    pub message: OutboundMessage,
}

/// In-memory `ChatChannel` that records every send and can be told to fail.
pub struct RecordingChannel {
    kind: ChannelKind,
    sent: Mutex<Vec<Sent>>,
    failing: AtomicBool,
    next_id: AtomicI64,
}

impl RecordingChannel {
    pub fn new(kind: ChannelKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            sent: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
            next_id: AtomicI64::new(1),
        })
    }

    pub fn fail_sends(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    pub fn texts_to(&self, address: &str) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter(|s| s.address == address)
            .map(|s| s.message.text)
            .collect()
    }
}

#[async_trait]
impl ChatChannel for RecordingChannel {
    fn kind(&self) -> ChannelKind {
        self.kind
    }

    async fn send(&self, address: &str, message: &OutboundMessage) -> Result<Option<String>> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("simulated {} outage", self.kind);
        }
        self.sent.lock().unwrap().push(Sent {
            address: address.to_string(),
            message: message.clone(),
        });
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(Some(format!("{}-{id}", self.kind)))
    }
}

#[derive(Default)]
pub struct StubResolver {
    clients: HashMap<(i64, ChannelKind), Arc<dyn ChatChannel>>,
}

impl StubResolver {
    pub fn with(mut self, company_id: i64, client: Arc<dyn ChatChannel>) -> Self {
        self.clients.insert((company_id, client.kind()), client);
        self
    }
}

impl ChannelResolver for StubResolver {
    fn client(&self, company_id: i64, kind: ChannelKind) -> Option<Arc<dyn ChatChannel>> {
        self.clients.get(&(company_id, kind)).cloned()
    }
}

// ── time ─────────────────────────────────────────────────────────────────────

pub const TZ: Tz = chrono_tz::Asia::Tokyo;

pub fn at(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .expect("rfc3339")
        .with_timezone(&Utc)
}

/// 2024-05-10 10:00 JST.
pub fn now() -> DateTime<Utc> {
    at("2024-05-10T01:00:00Z")
}

/// 17:00 JST, `offset` business days from `now()`.
pub fn due_in(days: i64) -> DateTime<Utc> {
    at("2024-05-10T08:00:00Z") + Duration::days(days)
}

// ── harness ──────────────────────────────────────────────────────────────────

pub fn open_db() -> Db {
    let mut db = Db::open(":memory:").expect("open in-memory db");
    db.migrate().expect("migrate");
    db
}

pub fn settings() -> EngineSettings {
    EngineSettings {
        tz: TZ,
        max_reminders_per_task: 10,
        send_timeout: Duration::hours(24),
        reply_timeout: Duration::hours(24),
    }
}

pub struct Harness {
    pub db: Arc<Db>,
    pub engine: ReminderEngine,
    pub slack: Arc<RecordingChannel>,
    pub telegram: Arc<RecordingChannel>,
    pub company: i64,
}

pub fn harness(policy: &[i64]) -> Harness {
    harness_with(policy, settings())
}

/// One company with Slack and Telegram clients, using `PlainRenderer`.
pub fn harness_with(policy: &[i64], settings: EngineSettings) -> Harness {
    let db = open_db();
    let company = db.insert_company("Acme", policy).expect("insert_company");
    let db = Arc::new(db);
    let slack = RecordingChannel::new(ChannelKind::Slack);
    let telegram = RecordingChannel::new(ChannelKind::Telegram);
    let resolver = StubResolver::default()
        .with(company, slack.clone())
        .with(company, telegram.clone());
    let engine = ReminderEngine::new(
        db.clone(),
        Arc::new(resolver),
        Arc::new(PlainRenderer),
        settings,
    );
    Harness {
        db,
        engine,
        slack,
        telegram,
        company,
    }
}

impl Harness {
    /// A user reachable on Slack at `slack:<name>`.
    pub fn user(&self, name: &str) -> i64 {
        let id = self.db.insert_user(self.company, name).expect("insert_user");
        self.db
            .set_user_channel(id, ChannelKind::Slack, &slack_addr(name))
            .expect("set_user_channel");
        id
    }

    /// A user with no chat address at all.
    pub fn unreachable_user(&self, name: &str) -> i64 {
        self.db.insert_user(self.company, name).expect("insert_user")
    }

    pub fn task(&self, title: &str, deadline: Option<DateTime<Utc>>, assignees: &[i64]) -> i64 {
        let id = self
            .db
            .upsert_task(&NewTask {
                company_id: self.company,
                task_app: TaskApp::Trello,
                external_id: format!("card-{title}"),
                title: title.into(),
                deadline,
                done: false,
                closed: false,
            })
            .expect("upsert_task");
        self.db.set_task_assignees(id, assignees).expect("set_task_assignees");
        id
    }

    pub fn statuses(&self, user_id: i64) -> Vec<QueueStatus> {
        self.db
            .list_queue_for_user(user_id)
            .expect("list_queue_for_user")
            .into_iter()
            .map(|e| e.status)
            .collect()
    }

    pub fn awaiting_count(&self, user_id: i64) -> i64 {
        self.db
            .count_in_status(user_id, QueueStatus::AwaitingReply)
            .expect("count_in_status")
    }
}

pub fn slack_addr(name: &str) -> String {
    format!("slack:{name}")
}
