use anyhow::{Context, Result};
use async_trait::async_trait;
use nudge_core::{channel::ChatChannel, ChannelKind, OutboundMessage};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::split_text;

const PUSH_URL: &str = "https://api.line.me/v2/bot/message/push";
const MESSAGE_LIMIT: usize = 5000;
/// The push API accepts at most five message objects per request.
const MAX_MESSAGES: usize = 5;

/// LINE Messaging API push client for one channel access token.
pub struct Line {
    token: String,
    client: Client,
}

impl Line {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            client: Client::new(),
        }
    }
}

#[derive(Deserialize)]
struct PushResponse {
    #[serde(default, rename = "sentMessages")]
    sent_messages: Vec<SentMessage>,
}

#[derive(Deserialize)]
struct SentMessage {
    id: String,
}

#[async_trait]
impl ChatChannel for Line {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Line
    }

    async fn send(&self, address: &str, message: &OutboundMessage) -> Result<Option<String>> {
        let resp = self
            .client
            .post(PUSH_URL)
            .bearer_auth(&self.token)
            .json(&push_body(address, message))
            .send()
            .await
            .context("LINE push request")?;

        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            anyhow::bail!("LINE push rejected ({status}): {detail}");
        }
        let parsed: PushResponse = resp.json().await.unwrap_or(PushResponse {
            sent_messages: Vec::new(),
        });
        Ok(parsed.sent_messages.into_iter().last().map(|m| m.id))
    }
}

fn push_body(to: &str, message: &OutboundMessage) -> Value {
    let chunks = split_text(&message.text, MESSAGE_LIMIT);
    let take = chunks.len().min(MAX_MESSAGES);
    let mut messages: Vec<Value> = chunks
        .into_iter()
        .take(take)
        .map(|text| json!({ "type": "text", "text": text }))
        .collect();

    if let Some(last) = messages.last_mut() {
        if !message.actions.is_empty() {
            let items: Vec<Value> = message
                .actions
                .iter()
                .map(|a| {
                    json!({
                        "type": "action",
                        "action": { "type": "message", "label": a.label(), "text": a.as_str() },
                    })
                })
                .collect();
            last["quickReply"] = json!({ "items": items });
        }
    }
    json!({ "to": to, "messages": messages })
}

#[cfg(test)]
mod tests {
    use super::*;
    use nudge_core::ReplyOutcome;

    #[test]
    fn quick_reply_on_last_message() {
        let msg = OutboundMessage {
            text: "x".repeat(MESSAGE_LIMIT + 10),
            actions: ReplyOutcome::ALL.to_vec(),
        };
        let body = push_body("Uabc", &msg);
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert!(messages[0].get("quickReply").is_none());
        let items = messages[1]["quickReply"]["items"].as_array().unwrap();
        assert_eq!(items.len(), 4);
        assert_eq!(items[2]["action"]["text"], "delayed");
    }

    #[test]
    fn caps_message_count() {
        let msg = OutboundMessage::text("y".repeat(MESSAGE_LIMIT * 7));
        let body = push_body("Uabc", &msg);
        assert_eq!(body["messages"].as_array().unwrap().len(), MAX_MESSAGES);
    }
}
