use std::{collections::HashMap, path::Path};

use anyhow::{Context, Result};
use chrono_tz::Tz;

use crate::db::Db;

/// Full application configuration.
/// Non-sensitive fields are seeded to and loaded from the DB `config` table.
/// Chat tokens come from env/.env only.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: String,

    // Web
    pub web_bind: String,
    pub web_port: u16,

    // Reminder policy
    pub business_timezone: Tz,
    pub send_timeout_hours: i64,
    pub reply_timeout_hours: i64,
    pub max_reminders_per_task: i64,

    // Scheduler
    pub sweep_tick_s: u64,
    /// Local hour (business timezone) after which the daily sweep may run.
    pub daily_sweep_hour: u32,

    // Chat credentials (env only)
    pub telegram_token: String,
    pub slack_token: String,
    pub line_token: String,
}

fn parse_dotenv(path: &Path) -> HashMap<String, String> {
    let mut map = HashMap::new();
    let Ok(contents) = std::fs::read_to_string(path) else {
        return map;
    };
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((k, v)) = line.split_once('=') {
            map.insert(k.trim().to_string(), v.trim().to_string());
        }
    }
    map
}

fn get(key: &str, dotenv: &HashMap<String, String>) -> Option<String> {
    std::env::var(key).ok().or_else(|| dotenv.get(key).cloned())
}

fn get_str(key: &str, dotenv: &HashMap<String, String>, default: &str) -> String {
    get(key, dotenv).unwrap_or_else(|| default.to_string())
}

fn get_i64(key: &str, dotenv: &HashMap<String, String>, default: i64) -> i64 {
    get(key, dotenv)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn get_u32(key: &str, dotenv: &HashMap<String, String>, default: u32) -> u32 {
    get(key, dotenv)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn get_u64(key: &str, dotenv: &HashMap<String, String>, default: u64) -> u64 {
    get(key, dotenv)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn get_u16(key: &str, dotenv: &HashMap<String, String>, default: u16) -> u16 {
    get(key, dotenv)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_tz(name: &str) -> Result<Tz> {
    name.parse::<Tz>()
        .map_err(|e| anyhow::anyhow!("{e}"))
        .with_context(|| format!("invalid BUSINESS_TIMEZONE {name:?}"))
}

impl Config {
    /// Write all non-sensitive fields to DB if not already present (first-run seeding).
    pub fn seed_db(&self, db: &Db) -> Result<()> {
        let entries: &[(&str, String)] = &[
            ("data_dir", self.data_dir.clone()),
            ("web_bind", self.web_bind.clone()),
            ("web_port", self.web_port.to_string()),
            ("business_timezone", self.business_timezone.name().to_string()),
            ("send_timeout_hours", self.send_timeout_hours.to_string()),
            ("reply_timeout_hours", self.reply_timeout_hours.to_string()),
            (
                "max_reminders_per_task",
                self.max_reminders_per_task.to_string(),
            ),
            ("sweep_tick_s", self.sweep_tick_s.to_string()),
            ("daily_sweep_hour", self.daily_sweep_hour.to_string()),
        ];
        db.seed_config(entries)
    }

    /// Return a new Config with non-sensitive fields overridden from DB values.
    pub fn load_from_db(&self, db: &Db) -> Self {
        let mut c = self.clone();
        let get = |key: &str| db.get_config(key).ok().flatten();
        let get_str = |key: &str, cur: &str| get(key).unwrap_or_else(|| cur.to_string());
        macro_rules! load_num {
            ($key:expr, $field:expr) => {
                if let Some(v) = get($key).and_then(|s| s.parse().ok()) {
                    $field = v;
                }
            };
        }
        c.data_dir = get_str("data_dir", &c.data_dir);
        c.web_bind = get_str("web_bind", &c.web_bind);
        load_num!("web_port", c.web_port);
        load_num!("send_timeout_hours", c.send_timeout_hours);
        load_num!("reply_timeout_hours", c.reply_timeout_hours);
        load_num!("max_reminders_per_task", c.max_reminders_per_task);
        load_num!("sweep_tick_s", c.sweep_tick_s);
        load_num!("daily_sweep_hour", c.daily_sweep_hour);
        if let Some(tz) = get("business_timezone").and_then(|s| s.parse::<Tz>().ok()) {
            c.business_timezone = tz;
        }
        c
    }

    pub fn from_env() -> Result<Self> {
        Self::from_env_file(Path::new(".env"))
    }

    /// Same as `from_env`, reading fallbacks from an explicit dotenv path.
    pub fn from_env_file(dotenv_path: &Path) -> Result<Self> {
        let dotenv = parse_dotenv(dotenv_path);

        let business_timezone =
            parse_tz(&get_str("BUSINESS_TIMEZONE", &dotenv, "Asia/Tokyo"))?;

        Ok(Config {
            data_dir: get_str("DATA_DIR", &dotenv, "store"),
            web_bind: get_str("WEB_BIND", &dotenv, "127.0.0.1"),
            web_port: get_u16("WEB_PORT", &dotenv, 3232),
            business_timezone,
            send_timeout_hours: get_i64("SEND_TIMEOUT_HOURS", &dotenv, 24),
            reply_timeout_hours: get_i64("REPLY_TIMEOUT_HOURS", &dotenv, 24),
            max_reminders_per_task: get_i64("MAX_REMINDERS_PER_TASK", &dotenv, 10),
            sweep_tick_s: get_u64("SWEEP_TICK_S", &dotenv, 60),
            daily_sweep_hour: get_u32("DAILY_SWEEP_HOUR", &dotenv, 9).min(23),
            telegram_token: get_str("TELEGRAM_BOT_TOKEN", &dotenv, ""),
            slack_token: get_str("SLACK_BOT_TOKEN", &dotenv, ""),
            line_token: get_str("LINE_CHANNEL_TOKEN", &dotenv, ""),
        })
    }
}
