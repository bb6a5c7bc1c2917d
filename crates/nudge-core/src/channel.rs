use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::db::{Db, NewChatMessage};
use crate::types::{ChannelKind, Direction, MessageKind, OutboundMessage, User};

/// A chat platform client able to push a message to one address.
#[async_trait]
pub trait ChatChannel: Send + Sync {
    fn kind(&self) -> ChannelKind;

    /// Deliver `message` to `address`. Returns the platform's message id
    /// when the API reports one.
    async fn send(&self, address: &str, message: &OutboundMessage) -> Result<Option<String>>;
}

/// Looks up the chat client configured for a company on a given channel.
pub trait ChannelResolver: Send + Sync {
    fn client(&self, company_id: i64, kind: ChannelKind) -> Option<Arc<dyn ChatChannel>>;
}

/// A deliverable destination for one user.
#[derive(Clone)]
pub struct Route {
    pub kind: ChannelKind,
    pub address: String,
    pub client: Arc<dyn ChatChannel>,
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("kind", &self.kind)
            .field("address", &self.address)
            .finish()
    }
}

/// First registered address of `user`, in channel preference order, whose
/// channel has a client for the user's company.
pub fn resolve_route(db: &Db, channels: &dyn ChannelResolver, user: &User) -> Result<Option<Route>> {
    let registered = db.user_channels(user.id)?;
    for kind in ChannelKind::PREFERENCE {
        let Some((_, address)) = registered.iter().find(|(k, _)| *k == kind) else {
            continue;
        };
        if let Some(client) = channels.client(user.company_id, kind) {
            return Ok(Some(Route {
                kind,
                address: address.clone(),
                client,
            }));
        }
    }
    Ok(None)
}

/// Send over `route` and log the outbound message. Returns the new
/// `chat_messages` row id.
pub async fn deliver(
    db: &Db,
    route: &Route,
    user: &User,
    kind: MessageKind,
    message: &OutboundMessage,
    now: DateTime<Utc>,
) -> Result<i64> {
    let external_id = route
        .client
        .send(&route.address, message)
        .await
        .with_context(|| format!("{} send to user #{} failed", route.kind, user.id))?;
    db.insert_chat_message(
        &NewChatMessage {
            company_id: user.company_id,
            user_id: user.id,
            channel: route.kind,
            direction: Direction::Outbound,
            kind,
            external_id: external_id.as_deref(),
            content: &message.text,
        },
        now,
    )
}
