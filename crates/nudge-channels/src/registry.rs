use std::{collections::HashMap, sync::Arc};

use anyhow::Result;
use nudge_core::{
    channel::{ChannelResolver, ChatChannel},
    config::Config,
    db::Db,
    ChannelKind,
};
use tracing::info;

use crate::{line::Line, slack::Slack, telegram::Telegram};

/// Chat clients per (company, channel), with process-wide fallbacks for
/// companies that have no credentials of their own.
#[derive(Default)]
pub struct ChannelRegistry {
    clients: HashMap<(i64, ChannelKind), Arc<dyn ChatChannel>>,
    defaults: HashMap<ChannelKind, Arc<dyn ChatChannel>>,
}

/// Build the HTTP client for a channel token.
pub fn client_for(kind: ChannelKind, token: &str) -> Arc<dyn ChatChannel> {
    match kind {
        ChannelKind::Slack => Arc::new(Slack::new(token)),
        ChannelKind::Telegram => Arc::new(Telegram::new(token)),
        ChannelKind::Line => Arc::new(Line::new(token)),
    }
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Per-company clients from `company_channels`, env tokens as defaults.
    /// `telegram` replaces the default Telegram client so the poller and the
    /// sender share one bot.
    pub fn load(db: &Db, config: &Config, telegram: Option<Arc<Telegram>>) -> Result<Self> {
        let mut registry = Self::new();
        for (kind, token) in [
            (ChannelKind::Slack, &config.slack_token),
            (ChannelKind::Telegram, &config.telegram_token),
            (ChannelKind::Line, &config.line_token),
        ] {
            if !token.is_empty() {
                registry.set_default(client_for(kind, token));
            }
        }
        if let Some(tg) = telegram {
            registry.set_default(tg);
        }
        for (company_id, kind, token) in db.list_company_channels()? {
            registry.insert(company_id, client_for(kind, &token));
        }
        info!(
            companies = registry.clients.len(),
            defaults = registry.defaults.len(),
            "chat channel registry loaded"
        );
        Ok(registry)
    }

    pub fn insert(&mut self, company_id: i64, client: Arc<dyn ChatChannel>) {
        self.clients.insert((company_id, client.kind()), client);
    }

    pub fn set_default(&mut self, client: Arc<dyn ChatChannel>) {
        self.defaults.insert(client.kind(), client);
    }
}

impl ChannelResolver for ChannelRegistry {
    fn client(&self, company_id: i64, kind: ChannelKind) -> Option<Arc<dyn ChatChannel>> {
        self.clients
            .get(&(company_id, kind))
            .or_else(|| self.defaults.get(&kind))
            .cloned()
    }
}
