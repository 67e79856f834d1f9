use super::{ApiError, AppState};
use crate::db::models::ConversationTurn;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatBody {
    message: String,
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryQuery {
    session_id: String,
}

/// Streams `message`, `done` and `error` events. A client disconnect drops
/// the stream and with it the upstream completion.
pub async fn chat(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<ChatBody>, JsonRejection>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, ApiError> {
    let Json(body) = payload?;
    let message = body.message.trim().to_string();
    if message.is_empty() {
        return Err(ApiError::bad_request("message must not be empty"));
    }
    let guide = state.guides.concierge_guide(&id)?;

    let events = state
        .chat
        .stream_chat(guide, message, body.session_id)
        .map(|event| Event::default().event(event.name()).json_data(&event));
    Ok(Sse::new(events).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keepalive"),
    ))
}

pub async fn history(
    State(state): State<AppState>,
    Path(id): Path<String>,
    query: Result<Query<HistoryQuery>, QueryRejection>,
) -> Result<Json<Vec<ConversationTurn>>, ApiError> {
    let Query(query) = query?;
    let guide = state.guides.published_guide(&id)?;
    Ok(Json(state.chat.history(&guide.id, &query.session_id)?))
}
