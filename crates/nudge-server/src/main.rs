mod logging;
mod routes;
mod scheduler;

use axum::{
    routing::{get, post},
    Router,
};
use chrono::Utc;
use nudge_channels::{telegram::Telegram, ChannelRegistry};
use nudge_core::{
    config::Config,
    db::Db,
    engine::{EngineSettings, ReminderEngine},
    render::PlainRenderer,
    ChannelKind, ReplyOutcome,
};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::logging::BroadcastLayer;
use crate::routes::*;
use crate::scheduler::Scheduler;

const DEFAULT_LOG_FILTER: &str =
    "nudge_server=info,nudge_core=info,nudge_channels=info,tower_http=debug";

// ── AppState ──────────────────────────────────────────────────────────────

pub(crate) struct AppState {
    pub engine: Arc<ReminderEngine>,
    pub scheduler: Arc<Scheduler>,
    pub start_time: Instant,
    pub log_tx: broadcast::Sender<String>,
    pub log_ring: Arc<std::sync::Mutex<VecDeque<String>>>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let (log_tx, _log_rx) = broadcast::channel::<String>(256);
    let log_ring = Arc::new(std::sync::Mutex::new(VecDeque::new()));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(BroadcastLayer {
            tx: log_tx.clone(),
            ring: Arc::clone(&log_ring),
        })
        .init();

    let config = Config::from_env()?;

    std::fs::create_dir_all(&config.data_dir)?;
    let db_path = format!("{}/nudge.db", config.data_dir);
    let mut db = Db::open(&db_path)?;
    db.migrate()?;
    config.seed_db(&db)?;
    let config = config.load_from_db(&db);

    let db = Arc::new(db);

    let telegram = if config.telegram_token.is_empty() {
        None
    } else {
        let mut tg = Telegram::new(config.telegram_token.clone());
        if let Err(e) = tg.connect().await {
            tracing::warn!("Telegram connect failed: {e}");
        }
        Some(Arc::new(tg))
    };

    let registry = ChannelRegistry::load(&db, &config, telegram.clone())?;
    let engine = Arc::new(ReminderEngine::new(
        Arc::clone(&db),
        Arc::new(registry),
        Arc::new(PlainRenderer),
        EngineSettings::from_config(&config),
    ));

    // Scheduler tick loop
    let scheduler = Arc::new(Scheduler::new(Arc::clone(&engine), config.daily_sweep_hour));
    Arc::clone(&scheduler).spawn(config.sweep_tick_s);

    // Telegram polling loop
    if let Some(tg) = telegram {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            loop {
                match tg.get_updates().await {
                    Ok(messages) => {
                        for msg in messages {
                            let Some(outcome) = ReplyOutcome::classify(&msg.text) else {
                                tracing::debug!(
                                    chat_id = msg.chat_id,
                                    "ignoring unclassified message"
                                );
                                continue;
                            };
                            let address = msg.chat_id.to_string();
                            let event_id = format!("{}:{}", msg.chat_id, msg.message_id);
                            match engine
                                .resolve_reply(
                                    ChannelKind::Telegram,
                                    &address,
                                    Some(event_id.as_str()),
                                    outcome,
                                    &msg.text,
                                    Utc::now(),
                                )
                                .await
                            {
                                Ok(resolution) => {
                                    tracing::debug!(
                                        chat_id = msg.chat_id,
                                        ?resolution,
                                        "telegram reply handled"
                                    )
                                }
                                Err(e) => tracing::error!("telegram reply error: {e:#}"),
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Telegram poll error: {e}");
                        tokio::time::sleep(tokio::time::Duration::from_secs(2)).await;
                    }
                }
            }
        });
    }

    let state = Arc::new(AppState {
        engine,
        scheduler,
        start_time: Instant::now(),
        log_tx,
        log_ring,
    });

    let app = Router::new()
        .route("/api/health", get(health))
        // Webhook ingress
        .route("/api/replies", post(post_reply))
        // On-demand triggers
        .route("/api/companies/:id/sweep", post(sweep_company))
        .route("/api/users/:id/remind", post(remind_user))
        .route("/api/timeouts/sweep", post(sweep_timeouts))
        // Audit
        .route("/api/users/:id/queue", get(user_queue))
        // SSE logs
        .route("/api/logs", get(sse_logs))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let bind = config.web_bind.clone();
    let port = config.web_port;
    let addr = format!("{bind}:{port}");

    info!("Listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
