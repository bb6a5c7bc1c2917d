use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        Json,
    },
};
use chrono::Utc;
use nudge_core::{ChannelKind, ReplyOutcome};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;

use crate::AppState;

// ── Error helper ──────────────────────────────────────────────────────────

pub(crate) fn internal(e: impl std::fmt::Display) -> StatusCode {
    tracing::error!("internal error: {e}");
    StatusCode::INTERNAL_SERVER_ERROR
}

// ── Request body types ────────────────────────────────────────────────────

#[derive(Deserialize)]
pub(crate) struct ReplyBody {
    pub channel: ChannelKind,
    pub address: String,
    /// Action id from a button; free text in `content` is classified when absent.
    pub outcome: Option<ReplyOutcome>,
    pub content: Option<String>,
    /// Platform id of the inbound event, used to drop redeliveries.
    pub event_id: Option<String>,
}

#[derive(Deserialize, Default)]
pub(crate) struct TimeoutSweepBody {
    pub user_id: Option<i64>,
}

// ── Handlers ──────────────────────────────────────────────────────────────

pub(crate) async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "uptime_s": state.start_time.elapsed().as_secs(),
    }))
}

pub(crate) async fn post_reply(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ReplyBody>,
) -> Result<Json<Value>, StatusCode> {
    let content = body.content.unwrap_or_default();
    let Some(outcome) = body.outcome.or_else(|| ReplyOutcome::classify(&content)) else {
        return Err(StatusCode::UNPROCESSABLE_ENTITY);
    };
    let resolution = state
        .engine
        .resolve_reply(
            body.channel,
            &body.address,
            body.event_id.as_deref(),
            outcome,
            &content,
            Utc::now(),
        )
        .await
        .map_err(internal)?;
    Ok(Json(json!(resolution)))
}

pub(crate) async fn sweep_company(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, StatusCode> {
    if state.engine.db().get_company(id).map_err(internal)?.is_none() {
        return Err(StatusCode::NOT_FOUND);
    }
    match state.scheduler.sweep_company(id, Utc::now()).await.map_err(internal)? {
        Some(report) => Ok(Json(json!(report))),
        None => Err(StatusCode::CONFLICT),
    }
}

pub(crate) async fn remind_user(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, StatusCode> {
    if state.engine.db().get_user(id).map_err(internal)?.is_none() {
        return Err(StatusCode::NOT_FOUND);
    }
    let report = state
        .engine
        .run_for_user(id, Utc::now())
        .await
        .map_err(internal)?;
    Ok(Json(json!(report)))
}

pub(crate) async fn sweep_timeouts(
    State(state): State<Arc<AppState>>,
    body: Option<Json<TimeoutSweepBody>>,
) -> Result<Json<Value>, StatusCode> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let report = state
        .engine
        .sweep_timeouts(body.user_id, Utc::now())
        .await
        .map_err(internal)?;
    Ok(Json(json!(report)))
}

pub(crate) async fn user_queue(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, StatusCode> {
    let db = state.engine.db();
    if db.get_user(id).map_err(internal)?.is_none() {
        return Err(StatusCode::NOT_FOUND);
    }
    let entries = db.list_queue_for_user(id).map_err(internal)?;
    let messages = db.list_chat_messages(id).map_err(internal)?;
    Ok(Json(json!({ "entries": entries, "messages": messages })))
}

// SSE logs: replays ring buffer history then streams live events

pub(crate) async fn sse_logs(
    State(state): State<Arc<AppState>>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, std::convert::Infallible>>> {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    // Subscribe before snapshotting ring to avoid race
    let live_rx = state.log_tx.subscribe();
    let history: Vec<String> = state
        .log_ring
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .iter()
        .cloned()
        .collect();
    tokio::spawn(async move {
        for line in history {
            if tx.send(line).is_err() {
                return;
            }
        }
        let mut live_rx = live_rx;
        loop {
            match live_rx.recv().await {
                Ok(line) => {
                    if tx.send(line).is_err() {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
    });
    let stream = UnboundedReceiverStream::new(rx)
        .map(|data| Ok::<_, std::convert::Infallible>(Event::default().data(data)));
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(std::time::Duration::from_secs(15))
            .text("ping"),
    )
}
