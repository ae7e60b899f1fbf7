use axum::{debug_handler, extract::{Path, Query, State}, http::StatusCode, Json};
use serde::Deserialize;
use uuid::Uuid;

use crate::{chat::ChatStream, model::{ChatMessage, HistoryOrder}, AppResult, AppState};

#[derive(Deserialize)]
pub(crate) struct SendMessageBody {
    sender_id: Uuid,
    text: String,
}

#[derive(Deserialize)]
pub(crate) struct OrderQuery {
    #[serde(default)]
    pub(crate) order: HistoryOrder,
}

#[debug_handler(state = AppState)]
pub(crate) async fn send_msg(
    State(chat): State<ChatStream>,
    Path(ride_id): Path<Uuid>,
    Json(SendMessageBody { sender_id, text }): Json<SendMessageBody>,
) -> AppResult<(StatusCode, Json<ChatMessage>)> {
    let msg = chat.append(ride_id, sender_id, &text).await?;
    Ok((StatusCode::CREATED, Json(msg)))
}

#[debug_handler(state = AppState)]
pub(crate) async fn history(
    State(chat): State<ChatStream>,
    Path(ride_id): Path<Uuid>,
    Query(OrderQuery { order }): Query<OrderQuery>,
) -> AppResult<Json<Vec<ChatMessage>>> {
    Ok(Json(chat.history(ride_id, order).await?))
}
