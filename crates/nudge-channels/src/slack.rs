use anyhow::{Context, Result};
use async_trait::async_trait;
use nudge_core::{channel::ChatChannel, ChannelKind, OutboundMessage};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};

const API_BASE: &str = "https://slack.com/api";

/// Posts to Slack via the Web API with a bot token.
pub struct Slack {
    token: String,
    client: Client,
}

impl Slack {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            client: Client::new(),
        }
    }
}

#[derive(Deserialize)]
struct PostMessageResponse {
    ok: bool,
    #[serde(default)]
    ts: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[async_trait]
impl ChatChannel for Slack {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Slack
    }

    /// `address` is a user or DM channel id; Slack opens the DM itself.
    async fn send(&self, address: &str, message: &OutboundMessage) -> Result<Option<String>> {
        let resp: PostMessageResponse = self
            .client
            .post(format!("{API_BASE}/chat.postMessage"))
            .bearer_auth(&self.token)
            .json(&post_body(address, message))
            .send()
            .await
            .context("chat.postMessage request")?
            .json()
            .await
            .context("chat.postMessage parse")?;

        if !resp.ok {
            anyhow::bail!(
                "slack chat.postMessage rejected: {}",
                resp.error.unwrap_or_default()
            );
        }
        Ok(resp.ts)
    }
}

fn post_body(channel: &str, message: &OutboundMessage) -> Value {
    let mut body = json!({
        "channel": channel,
        "text": message.text,
    });
    if !message.actions.is_empty() {
        let buttons: Vec<Value> = message
            .actions
            .iter()
            .map(|a| {
                json!({
                    "type": "button",
                    "text": { "type": "plain_text", "text": a.label() },
                    "action_id": a.as_str(),
                    "value": a.as_str(),
                })
            })
            .collect();
        body["blocks"] = json!([
            { "type": "section", "text": { "type": "mrkdwn", "text": message.text } },
            { "type": "actions", "elements": buttons },
        ]);
    }
    body
}
