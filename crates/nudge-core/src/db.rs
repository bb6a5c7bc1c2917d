use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::sync::Mutex;

use crate::types::{
    Candidate, ChannelKind, ChatMessageRecord, Company, Direction, MessageKind, NewTask,
    QueueEntry, QueueError, QueueStatus, ReplyOutcome, Task, User,
};

const SCHEMA_SQL: &str = include_str!("../../../schema.sql");

const TASK_COLUMNS: &str = "t.id, t.company_id, t.task_app, t.external_id, t.title, t.deadline, \
     t.done, t.closed, t.reminded_count, t.delayed_count";

const QUEUE_COLUMNS: &str = "id, task_id, user_id, reminder_day, remind_days, status, message_id, \
     reply_message_id, created_at, updated_at";

pub struct Db {
    conn: Mutex<Connection>,
}

// ── Auxiliary types ───────────────────────────────────────────────────────

/// Outbound or inbound message about to be logged.
pub struct NewChatMessage<'a> {
    pub company_id: i64,
    pub user_id: i64,
    pub channel: ChannelKind,
    pub direction: Direction,
    pub kind: MessageKind,
    pub external_id: Option<&'a str>,
    pub content: &'a str,
}

// ── Timestamp helpers ─────────────────────────────────────────────────────

const TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const DAY_FORMAT: &str = "%Y-%m-%d";

fn parse_ts(s: &str) -> DateTime<Utc> {
    NaiveDateTime::parse_from_str(s, TS_FORMAT)
        .map(|ndt| ndt.and_utc())
        .unwrap_or_else(|_| Utc::now())
}

pub(crate) fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.format(TS_FORMAT).to_string()
}

fn fmt_day(day: NaiveDate) -> String {
    day.format(DAY_FORMAT).to_string()
}

fn conversion_error(idx: usize, e: anyhow::Error) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, e.into())
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(e, rusqlite::Error::SqliteFailure(f, _) if f.code == ErrorCode::ConstraintViolation)
}

// ── Row mappers ───────────────────────────────────────────────────────────

fn row_to_company(row: &rusqlite::Row<'_>) -> rusqlite::Result<Company> {
    let remind_days_json: String = row.get(2)?;
    let remind_days = serde_json::from_str(&remind_days_json)
        .map_err(|e| conversion_error(2, e.into()))?;
    Ok(Company {
        id: row.get(0)?,
        name: row.get(1)?,
        remind_days,
    })
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        company_id: row.get(1)?,
        name: row.get(2)?,
    })
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    let task_app: String = row.get(2)?;
    let deadline: Option<String> = row.get(5)?;
    Ok(Task {
        id: row.get(0)?,
        company_id: row.get(1)?,
        task_app: task_app.parse().map_err(|e| conversion_error(2, e))?,
        external_id: row.get(3)?,
        title: row.get(4)?,
        deadline: deadline.as_deref().map(parse_ts),
        done: row.get::<_, i64>(6)? != 0,
        closed: row.get::<_, i64>(7)? != 0,
        reminded_count: row.get(8)?,
        delayed_count: row.get(9)?,
    })
}

fn row_to_queue_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<QueueEntry> {
    let reminder_day: String = row.get(3)?;
    let status: String = row.get(5)?;
    let created_at: String = row.get(8)?;
    let updated_at: String = row.get(9)?;
    Ok(QueueEntry {
        id: row.get(0)?,
        task_id: row.get(1)?,
        user_id: row.get(2)?,
        reminder_day: NaiveDate::parse_from_str(&reminder_day, DAY_FORMAT)
            .map_err(|e| conversion_error(3, e.into()))?,
        remind_days: row.get(4)?,
        status: status.parse().map_err(|e| conversion_error(5, e))?,
        message_id: row.get(6)?,
        reply_message_id: row.get(7)?,
        created_at: parse_ts(&created_at),
        updated_at: parse_ts(&updated_at),
    })
}

fn row_to_chat_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChatMessageRecord> {
    let created_at: String = row.get(8)?;
    Ok(ChatMessageRecord {
        id: row.get(0)?,
        company_id: row.get(1)?,
        user_id: row.get(2)?,
        channel: row.get(3)?,
        direction: row.get(4)?,
        kind: row.get(5)?,
        external_id: row.get(6)?,
        content: row.get(7)?,
        created_at: parse_ts(&created_at),
    })
}

// ── Db impl ───────────────────────────────────────────────────────────────

impl Db {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open SQLite database at {path:?}"))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .context("failed to set PRAGMAs")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn migrate(&mut self) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute_batch(SCHEMA_SQL)
            .context("failed to apply schema migrations")?;
        Ok(())
    }

    // ── Companies & users ─────────────────────────────────────────────────

    pub fn insert_company(&self, name: &str, remind_days: &[i64]) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let policy = serde_json::to_string(remind_days)?;
        conn.execute(
            "INSERT INTO companies (name, remind_days) VALUES (?1, ?2)",
            params![name, policy],
        )
        .context("insert_company")?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_company(&self, id: i64) -> Result<Option<Company>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row(
            "SELECT id, name, remind_days FROM companies WHERE id = ?1",
            params![id],
            row_to_company,
        )
        .optional()
        .context("get_company")
    }

    pub fn list_companies(&self) -> Result<Vec<Company>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt =
            conn.prepare("SELECT id, name, remind_days FROM companies ORDER BY id ASC")?;
        let companies = stmt
            .query_map([], row_to_company)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_companies")?;
        Ok(companies)
    }

    pub fn insert_user(&self, company_id: i64, name: &str) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO users (company_id, name) VALUES (?1, ?2)",
            params![company_id, name],
        )
        .context("insert_user")?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_user(&self, id: i64) -> Result<Option<User>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row(
            "SELECT id, company_id, name FROM users WHERE id = ?1",
            params![id],
            row_to_user,
        )
        .optional()
        .context("get_user")
    }

    pub fn set_user_channel(&self, user_id: i64, channel: ChannelKind, address: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO user_channels (user_id, channel, address) VALUES (?1, ?2, ?3) \
             ON CONFLICT(user_id, channel) DO UPDATE SET address = excluded.address",
            params![user_id, channel.as_str(), address],
        )
        .context("set_user_channel")?;
        Ok(())
    }

    /// Registered addresses of a user, keyed by channel.
    pub fn user_channels(&self, user_id: i64) -> Result<Vec<(ChannelKind, String)>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT channel, address FROM user_channels WHERE user_id = ?1 ORDER BY channel",
        )?;
        let rows = stmt
            .query_map(params![user_id], |row| {
                let channel: String = row.get(0)?;
                Ok((
                    channel.parse().map_err(|e| conversion_error(0, e))?,
                    row.get(1)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("user_channels")?;
        Ok(rows)
    }

    pub fn find_user_by_address(&self, channel: ChannelKind, address: &str) -> Result<Option<User>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row(
            "SELECT u.id, u.company_id, u.name FROM users u \
             JOIN user_channels c ON c.user_id = u.id \
             WHERE c.channel = ?1 AND c.address = ?2",
            params![channel.as_str(), address],
            row_to_user,
        )
        .optional()
        .context("find_user_by_address")
    }

    pub fn set_company_channel(&self, company_id: i64, channel: ChannelKind, token: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO company_channels (company_id, channel, token) VALUES (?1, ?2, ?3) \
             ON CONFLICT(company_id, channel) DO UPDATE SET token = excluded.token",
            params![company_id, channel.as_str(), token],
        )
        .context("set_company_channel")?;
        Ok(())
    }

    /// All per-company chat credentials as (company_id, channel, token).
    pub fn list_company_channels(&self) -> Result<Vec<(i64, ChannelKind, String)>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT company_id, channel, token FROM company_channels ORDER BY company_id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                let channel: String = row.get(1)?;
                Ok((
                    row.get(0)?,
                    channel.parse().map_err(|e| conversion_error(1, e))?,
                    row.get(2)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_company_channels")?;
        Ok(rows)
    }

    // ── Reporting lines ───────────────────────────────────────────────────

    pub fn add_reporting_edge(&self, subordinate_id: i64, superior_id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT OR IGNORE INTO reporting_edges (subordinate_id, superior_id) VALUES (?1, ?2)",
            params![subordinate_id, superior_id],
        )
        .context("add_reporting_edge")?;
        Ok(())
    }

    /// Direct superiors only; no transitive walk.
    pub fn superiors_of(&self, user_id: i64) -> Result<Vec<User>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT u.id, u.company_id, u.name FROM reporting_edges e \
             JOIN users u ON u.id = e.superior_id \
             WHERE e.subordinate_id = ?1 ORDER BY u.id ASC",
        )?;
        let users = stmt
            .query_map(params![user_id], row_to_user)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("superiors_of")?;
        Ok(users)
    }

    // ── Tasks (read model) ────────────────────────────────────────────────

    /// Insert or refresh a task keyed by (task_app, external_id). Counters
    /// owned by the reminder engine are left untouched on update.
    pub fn upsert_task(&self, task: &NewTask) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let deadline = task.deadline.map(fmt_ts);
        conn.query_row(
            "INSERT INTO tasks (company_id, task_app, external_id, title, deadline, done, closed, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, datetime('now')) \
             ON CONFLICT(task_app, external_id) DO UPDATE SET \
               title = excluded.title, deadline = excluded.deadline, \
               done = excluded.done, closed = excluded.closed, updated_at = excluded.updated_at \
             RETURNING id",
            params![
                task.company_id,
                task.task_app.as_str(),
                task.external_id,
                task.title,
                deadline,
                task.done as i64,
                task.closed as i64,
            ],
            |row| row.get(0),
        )
        .context("upsert_task")
    }

    pub fn set_task_assignees(&self, task_id: i64, user_ids: &[i64]) -> Result<()> {
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM task_assignees WHERE task_id = ?1", params![task_id])?;
        for user_id in user_ids {
            tx.execute(
                "INSERT OR IGNORE INTO task_assignees (task_id, user_id) VALUES (?1, ?2)",
                params![task_id, user_id],
            )?;
        }
        tx.commit().context("set_task_assignees")?;
        Ok(())
    }

    pub fn get_task(&self, id: i64) -> Result<Option<Task>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row(
            &format!("SELECT {TASK_COLUMNS} FROM tasks t WHERE t.id = ?1"),
            params![id],
            row_to_task,
        )
        .optional()
        .context("get_task")
    }

    /// Open tasks of a company with a deadline in `[start, end)` and fewer
    /// than `max_reminded` reminders, one row per responsible user.
    /// Ordered by deadline so the most urgent task is queued first.
    pub fn open_tasks_in_window(
        &self,
        company_id: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        max_reminded: i64,
        only_user: Option<i64>,
    ) -> Result<Vec<(Task, i64)>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(&format!(
            "SELECT {TASK_COLUMNS}, a.user_id FROM tasks t \
             JOIN task_assignees a ON a.task_id = t.id \
             WHERE t.company_id = ?1 AND t.done = 0 AND t.closed = 0 \
               AND t.deadline IS NOT NULL AND t.deadline >= ?2 AND t.deadline < ?3 \
               AND t.reminded_count < ?4 \
               AND (?5 IS NULL OR a.user_id = ?5) \
             ORDER BY t.deadline ASC, t.id ASC, a.user_id ASC"
        ))?;
        let rows = stmt
            .query_map(
                params![company_id, fmt_ts(start), fmt_ts(end), max_reminded, only_user],
                |row| Ok((row_to_task(row)?, row.get(10)?)),
            )?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("open_tasks_in_window")?;
        Ok(rows)
    }

    pub fn mark_task_done(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE tasks SET done = 1, updated_at = datetime('now') WHERE id = ?1",
            params![id],
        )
        .context("mark_task_done")?;
        Ok(())
    }

    pub fn mark_task_closed(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE tasks SET closed = 1, updated_at = datetime('now') WHERE id = ?1",
            params![id],
        )
        .context("mark_task_closed")?;
        Ok(())
    }

    /// Count a sent reminder; overdue reminders also count as a delay.
    pub fn record_reminder_sent(&self, id: i64, overdue: bool) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE tasks SET reminded_count = reminded_count + 1, \
             delayed_count = delayed_count + ?2 WHERE id = ?1",
            params![id, overdue as i64],
        )
        .context("record_reminder_sent")?;
        Ok(())
    }

    // ── Chat message log ──────────────────────────────────────────────────

    pub fn insert_chat_message(&self, msg: &NewChatMessage<'_>, now: DateTime<Utc>) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO chat_messages \
             (company_id, user_id, channel, direction, kind, external_id, content, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                msg.company_id,
                msg.user_id,
                msg.channel.as_str(),
                msg.direction.as_str(),
                msg.kind.as_str(),
                msg.external_id,
                msg.content,
                fmt_ts(now),
            ],
        )
        .context("insert_chat_message")?;
        Ok(conn.last_insert_rowid())
    }

    /// Log an inbound message. Returns None when a message with the same
    /// channel and `external_id` was already logged.
    pub fn insert_inbound_message(
        &self,
        msg: &NewChatMessage<'_>,
        now: DateTime<Utc>,
    ) -> Result<Option<i64>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let changed = conn
            .execute(
                "INSERT OR IGNORE INTO chat_messages \
                 (company_id, user_id, channel, direction, kind, external_id, content, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    msg.company_id,
                    msg.user_id,
                    msg.channel.as_str(),
                    msg.direction.as_str(),
                    msg.kind.as_str(),
                    msg.external_id,
                    msg.content,
                    fmt_ts(now),
                ],
            )
            .context("insert_inbound_message")?;
        Ok((changed == 1).then(|| conn.last_insert_rowid()))
    }

    pub fn get_chat_message(&self, id: i64) -> Result<Option<ChatMessageRecord>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row(
            "SELECT id, company_id, user_id, channel, direction, kind, external_id, content, created_at \
             FROM chat_messages WHERE id = ?1",
            params![id],
            row_to_chat_message,
        )
        .optional()
        .context("get_chat_message")
    }

    pub fn list_chat_messages(&self, user_id: i64) -> Result<Vec<ChatMessageRecord>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT id, company_id, user_id, channel, direction, kind, external_id, content, created_at \
             FROM chat_messages WHERE user_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map(params![user_id], row_to_chat_message)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_chat_messages")?;
        Ok(rows)
    }

    // ── Reminder queue ────────────────────────────────────────────────────

    /// Insert-or-ignore one WAITING entry per candidate for `day`. A WAITING
    /// entry left over from an earlier day for the same task and user is
    /// superseded (TIMEOUT_NOT_SENT). Returns the number of rows created.
    pub fn create_queue_entries(
        &self,
        candidates: &[Candidate],
        day: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let tx = conn.transaction()?;
        let day = fmt_day(day);
        let now = fmt_ts(now);
        let mut created = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO reminder_queue \
                 (task_id, user_id, reminder_day, remind_days, status, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, 'waiting', ?5, ?5)",
            )?;
            let mut supersede = tx.prepare(
                "UPDATE reminder_queue SET status = 'timeout_not_sent', updated_at = ?4 \
                 WHERE task_id = ?1 AND user_id = ?2 AND status = 'waiting' AND reminder_day < ?3",
            )?;
            for c in candidates {
                created += stmt.execute(params![c.task.id, c.user_id, day, c.remind_days, now])?;
                supersede.execute(params![c.task.id, c.user_id, day, now])?;
            }
        }
        tx.commit().context("create_queue_entries")?;
        Ok(created)
    }

    pub fn get_queue_entry(&self, id: i64) -> Result<Option<QueueEntry>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row(
            &format!("SELECT {QUEUE_COLUMNS} FROM reminder_queue WHERE id = ?1"),
            params![id],
            row_to_queue_entry,
        )
        .optional()
        .context("get_queue_entry")
    }

    pub fn list_queue_for_user(&self, user_id: i64) -> Result<Vec<QueueEntry>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(&format!(
            "SELECT {QUEUE_COLUMNS} FROM reminder_queue WHERE user_id = ?1 ORDER BY id ASC"
        ))?;
        let entries = stmt
            .query_map(params![user_id], row_to_queue_entry)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_queue_for_user")?;
        Ok(entries)
    }

    pub fn count_in_status(&self, user_id: i64, status: QueueStatus) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row(
            "SELECT COUNT(*) FROM reminder_queue WHERE user_id = ?1 AND status = ?2",
            params![user_id, status.as_str()],
            |r| r.get(0),
        )
        .context("count_in_status")
    }

    /// The user's single in-flight entry, if any.
    pub fn awaiting_reply_entry(&self, user_id: i64) -> Result<Option<QueueEntry>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row(
            &format!(
                "SELECT {QUEUE_COLUMNS} FROM reminder_queue \
                 WHERE user_id = ?1 AND status = 'awaiting_reply'"
            ),
            params![user_id],
            row_to_queue_entry,
        )
        .optional()
        .context("awaiting_reply_entry")
    }

    /// Oldest WAITING entry of the user, by entry id.
    pub fn next_waiting_entry(&self, user_id: i64) -> Result<Option<QueueEntry>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row(
            &format!(
                "SELECT {QUEUE_COLUMNS} FROM reminder_queue \
                 WHERE user_id = ?1 AND status = 'waiting' \
                 ORDER BY id ASC LIMIT 1"
            ),
            params![user_id],
            row_to_queue_entry,
        )
        .optional()
        .context("next_waiting_entry")
    }

    /// Users with WAITING entries, optionally limited to a company.
    pub fn users_with_waiting(&self, company_id: Option<i64>) -> Result<Vec<i64>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT DISTINCT q.user_id FROM reminder_queue q \
             JOIN users u ON u.id = q.user_id \
             WHERE q.status = 'waiting' AND (?1 IS NULL OR u.company_id = ?1) \
             ORDER BY q.user_id ASC",
        )?;
        let ids = stmt
            .query_map(params![company_id], |r| r.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()
            .context("users_with_waiting")?;
        Ok(ids)
    }

    /// Conditional single-row status change. Returns false when the entry
    /// was no longer in `from` (another writer got there first).
    pub fn transition(
        &self,
        entry_id: i64,
        from: QueueStatus,
        to: QueueStatus,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        if !from.can_transition_to(to) {
            return Err(QueueError::IllegalTransition { entry_id, from, to }.into());
        }
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let result = conn.execute(
            "UPDATE reminder_queue SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4",
            params![to.as_str(), fmt_ts(now), entry_id, from.as_str()],
        );
        match result {
            Ok(changed) => Ok(changed == 1),
            Err(e) if is_constraint_violation(&e) => {
                let user_id = conn
                    .query_row(
                        "SELECT user_id FROM reminder_queue WHERE id = ?1",
                        params![entry_id],
                        |r| r.get(0),
                    )
                    .context("transition")?;
                Err(QueueError::InFlightConflict { user_id }.into())
            }
            Err(e) => Err(anyhow::Error::from(e).context("transition")),
        }
    }

    /// Put a WAITING entry in flight, but only if the user has nothing else
    /// awaiting a reply. A single statement, so the check and the write
    /// cannot interleave with another claim.
    pub fn claim_for_dispatch(&self, entry_id: i64, user_id: i64, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let result = conn.execute(
            "UPDATE reminder_queue SET status = 'awaiting_reply', updated_at = ?1 \
             WHERE id = ?2 AND user_id = ?3 AND status = 'waiting' \
               AND NOT EXISTS (SELECT 1 FROM reminder_queue q \
                               WHERE q.user_id = ?3 AND q.status = 'awaiting_reply')",
            params![fmt_ts(now), entry_id, user_id],
        );
        match result {
            Ok(changed) => Ok(changed == 1),
            Err(e) if is_constraint_violation(&e) => {
                Err(QueueError::InFlightConflict { user_id }.into())
            }
            Err(e) => Err(anyhow::Error::from(e).context("claim_for_dispatch")),
        }
    }

    pub fn attach_message(&self, entry_id: i64, message_id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE reminder_queue SET message_id = ?1 WHERE id = ?2",
            params![message_id, entry_id],
        )
        .context("attach_message")?;
        Ok(())
    }

    /// Mark a delivered in-flight entry REPLIED and apply the outcome to its
    /// task, atomically. Returns false, writing nothing, when the entry was
    /// not awaiting a reply on a delivered reminder.
    pub fn record_reply(
        &self,
        entry_id: i64,
        reply_message_id: i64,
        task_id: i64,
        outcome: ReplyOutcome,
        late: bool,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let tx = conn.transaction()?;
        let changed = tx
            .execute(
                "UPDATE reminder_queue SET status = 'replied', reply_message_id = ?1, updated_at = ?2 \
                 WHERE id = ?3 AND status = 'awaiting_reply' AND message_id IS NOT NULL",
                params![reply_message_id, fmt_ts(now), entry_id],
            )
            .context("record_reply")?;
        if changed == 0 {
            return Ok(false);
        }
        match outcome {
            ReplyOutcome::Done => {
                tx.execute("UPDATE tasks SET done = 1 WHERE id = ?1", params![task_id])?;
                if late {
                    // The overdue reminder already counted this delay.
                    tx.execute(
                        "UPDATE tasks SET delayed_count = MAX(delayed_count - 1, 0) WHERE id = ?1",
                        params![task_id],
                    )?;
                }
            }
            ReplyOutcome::Withdrawn => {
                tx.execute("UPDATE tasks SET closed = 1 WHERE id = ?1", params![task_id])?;
            }
            ReplyOutcome::InProgress | ReplyOutcome::Delayed => {}
        }
        tx.commit().context("record_reply")?;
        Ok(true)
    }

    /// AWAITING_REPLY entries sent before `cutoff` become TIMEOUT_NO_REPLY.
    /// Returns (entry_id, user_id) for each moved entry.
    pub fn expire_unanswered(
        &self,
        cutoff: DateTime<Utc>,
        only_user: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<Vec<(i64, i64)>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "UPDATE reminder_queue SET status = 'timeout_no_reply', updated_at = ?1 \
             WHERE status = 'awaiting_reply' AND updated_at < ?2 AND (?3 IS NULL OR user_id = ?3) \
             RETURNING id, user_id",
        )?;
        let moved = stmt
            .query_map(params![fmt_ts(now), fmt_ts(cutoff), only_user], |r| {
                Ok((r.get(0)?, r.get(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("expire_unanswered")?;
        Ok(moved)
    }

    /// WAITING entries that have been dispatchable since before `cutoff`
    /// become TIMEOUT_NOT_SENT. An entry is dispatchable from the later of
    /// its creation and the moment the user's previous in-flight entry was
    /// resolved; while another entry awaits a reply it does not age at all.
    /// A released claim does not restart the clock.
    pub fn expire_unsent(
        &self,
        cutoff: DateTime<Utc>,
        only_user: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<Vec<(i64, i64)>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "UPDATE reminder_queue SET status = 'timeout_not_sent', updated_at = ?1 \
             WHERE status = 'waiting' AND (?3 IS NULL OR user_id = ?3) \
               AND NOT EXISTS (SELECT 1 FROM reminder_queue o \
                               WHERE o.user_id = reminder_queue.user_id \
                                 AND o.status = 'awaiting_reply') \
               AND MAX(created_at, COALESCE( \
                     (SELECT MAX(o.updated_at) FROM reminder_queue o \
                      WHERE o.user_id = reminder_queue.user_id \
                        AND o.status IN ('replied', 'timeout_no_reply')), \
                     created_at)) < ?2 \
             RETURNING id, user_id",
        )?;
        let moved = stmt
            .query_map(params![fmt_ts(now), fmt_ts(cutoff), only_user], |r| {
                Ok((r.get(0)?, r.get(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("expire_unsent")?;
        Ok(moved)
    }

    // ── Daily intro markers ───────────────────────────────────────────────

    /// Record that the user's intro for `day` is being sent. Returns false
    /// if it was already recorded.
    pub fn mark_intro_sent(&self, user_id: i64, day: NaiveDate) -> Result<bool> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let changed = conn
            .execute(
                "INSERT OR IGNORE INTO reminder_intros (user_id, reminder_day) VALUES (?1, ?2)",
                params![user_id, fmt_day(day)],
            )
            .context("mark_intro_sent")?;
        Ok(changed == 1)
    }

    pub fn clear_intro(&self, user_id: i64, day: NaiveDate) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "DELETE FROM reminder_intros WHERE user_id = ?1 AND reminder_day = ?2",
            params![user_id, fmt_day(day)],
        )
        .context("clear_intro")?;
        Ok(())
    }

    // ── Config ────────────────────────────────────────────────────────────

    pub fn get_config(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row(
            "SELECT value FROM config WHERE key = ?1",
            params![key],
            |r| r.get(0),
        )
        .optional()
        .context("get_config")
    }

    pub fn set_config(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO config (key, value, updated_at) VALUES (?1, ?2, datetime('now')) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value],
        )
        .context("set_config")?;
        Ok(())
    }

    /// Insert config keys that are not present yet. Existing values win.
    pub fn seed_config(&self, entries: &[(&str, String)]) -> Result<()> {
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO config (key, value, updated_at) VALUES (?1, ?2, datetime('now'))",
            )?;
            for (key, value) in entries {
                stmt.execute(params![key, value])?;
            }
        }
        tx.commit().context("seed_config")?;
        Ok(())
    }
}
