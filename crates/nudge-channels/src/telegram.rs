use anyhow::{Context, Result};
use async_trait::async_trait;
use nudge_core::{channel::ChatChannel, ChannelKind, OutboundMessage, ReplyOutcome};
use reqwest::Client;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::{info, warn};

use crate::split_text;

const MESSAGE_LIMIT: usize = 4000;

/// An incoming private Telegram text message.
#[derive(Debug, Clone)]
pub struct TgMessage {
    pub message_id: i64,
    pub chat_id: i64,
    pub chat_type: String,
    pub sender_id: i64,
    pub sender_name: String,
    pub text: String,
    pub date: i64,
}

pub struct Telegram {
    pub token: String,
    pub bot_username: String,
    client: Client,
    last_update_id: AtomicI64,
}

impl Telegram {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            bot_username: String::new(),
            client: Client::new(),
            last_update_id: AtomicI64::new(0),
        }
    }

    fn api_url(&self, method: &str) -> String {
        format!("https://api.telegram.org/bot{}/{}", self.token, method)
    }

    /// Fetch bot info and set bot_username.
    pub async fn connect(&mut self) -> Result<()> {
        let resp: Value = self
            .client
            .get(self.api_url("getMe"))
            .send()
            .await?
            .json()
            .await?;

        if let Some(username) = resp["result"]["username"].as_str() {
            self.bot_username = username.to_string();
            info!("Telegram bot connected: @{}", username);
        }
        Ok(())
    }

    /// Long-poll for new messages with timeout=2s.
    pub async fn get_updates(&self) -> Result<Vec<TgMessage>> {
        let offset = self.last_update_id.load(Ordering::Relaxed) + 1;
        let url = format!(
            "{}?timeout=2&offset={}&allowed_updates=[\"message\"]",
            self.api_url("getUpdates"),
            offset
        );

        let resp: Value = self
            .client
            .get(&url)
            .timeout(std::time::Duration::from_secs(10))
            .send()
            .await
            .context("getUpdates request")?
            .json()
            .await
            .context("getUpdates parse")?;

        let Some(updates) = resp["result"].as_array() else {
            return Ok(vec![]);
        };

        let mut messages = Vec::new();
        for update in updates {
            let update_id = update["update_id"].as_i64().unwrap_or(0);
            if update_id > self.last_update_id.load(Ordering::Relaxed) {
                self.last_update_id.store(update_id, Ordering::Relaxed);
            }
            if let Some(msg) = parse_message(update) {
                messages.push(msg);
            }
        }
        Ok(messages)
    }

    /// Send text to a chat, offering `actions` as a one-time reply keyboard
    /// on the last chunk. Returns the id of the last message sent.
    pub async fn send_message(&self, chat_id: i64, text: &str, actions: &[ReplyOutcome]) -> Result<i64> {
        let chunks = split_text(text, MESSAGE_LIMIT);
        let last = chunks.len().saturating_sub(1);
        let mut message_id = 0;
        for (i, chunk) in chunks.iter().enumerate() {
            let keyboard: &[ReplyOutcome] = if i == last { actions } else { &[] };
            let resp: Value = self
                .client
                .post(self.api_url("sendMessage"))
                .json(&send_body(chat_id, chunk, keyboard))
                .send()
                .await
                .context("sendMessage request")?
                .json()
                .await
                .context("sendMessage parse")?;

            if resp["ok"] != true {
                warn!("Telegram sendMessage failed: {:?}", resp["description"]);
                anyhow::bail!("telegram sendMessage rejected: {}", resp["description"]);
            }
            message_id = resp["result"]["message_id"].as_i64().unwrap_or(0);
        }
        Ok(message_id)
    }
}

#[async_trait]
impl ChatChannel for Telegram {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Telegram
    }

    async fn send(&self, address: &str, message: &OutboundMessage) -> Result<Option<String>> {
        let chat_id: i64 = address
            .parse()
            .with_context(|| format!("invalid telegram chat id {address:?}"))?;
        let id = self.send_message(chat_id, &message.text, &message.actions).await?;
        Ok(Some(id.to_string()))
    }
}

fn send_body(chat_id: i64, text: &str, actions: &[ReplyOutcome]) -> Value {
    let mut body = json!({
        "chat_id": chat_id,
        "text": text,
    });
    if !actions.is_empty() {
        // Buttons send the action id back as plain text.
        let row: Vec<Value> = actions.iter().map(|a| json!({ "text": a.as_str() })).collect();
        body["reply_markup"] = json!({
            "keyboard": [row],
            "one_time_keyboard": true,
            "resize_keyboard": true,
        });
    }
    body
}

/// Extract a private text message from one update. Group chats are
/// ignored: replies are only matched one-to-one.
fn parse_message(update: &Value) -> Option<TgMessage> {
    let msg = &update["message"];
    let text = msg["text"].as_str()?.to_string();
    let chat_type = msg["chat"]["type"].as_str().unwrap_or("private").to_string();
    if chat_type != "private" {
        return None;
    }
    let first = msg["from"]["first_name"].as_str().unwrap_or("");
    let last = msg["from"]["last_name"].as_str().unwrap_or("");
    let sender_name = if last.is_empty() {
        first.to_string()
    } else {
        format!("{} {}", first, last)
    };
    Some(TgMessage {
        message_id: msg["message_id"].as_i64().unwrap_or(0),
        chat_id: msg["chat"]["id"].as_i64().unwrap_or(0),
        chat_type,
        sender_id: msg["from"]["id"].as_i64().unwrap_or(0),
        sender_name,
        text,
        date: msg["date"].as_i64().unwrap_or(0),
    })
}
