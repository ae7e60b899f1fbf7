use axum::{
    debug_handler,
    extract::{
        ws::{close_code, CloseFrame, Message, Utf8Bytes, WebSocketUpgrade},
        Path, Query, State,
    },
    response::{IntoResponse, Response},
};
use futures_util::{Sink, SinkExt, StreamExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    chat::{ChatStream, Subscription},
    AppResult, AppState,
};

use super::msg::OrderQuery;

/// Streams a ride's chat: backlog first, then live messages. The server
/// closes the socket once the ride is cancelled. Inbound frames other than
/// close are ignored; messages are sent over `POST /rides/{id}/messages`.
#[debug_handler(state = AppState)]
pub(crate) async fn ride_ws(
    State(chat): State<ChatStream>,
    Path(ride_id): Path<Uuid>,
    Query(OrderQuery { order }): Query<OrderQuery>,
    ws: WebSocketUpgrade,
) -> AppResult<Response> {
    let subscription = chat.subscribe(ride_id, order).await?;

    Ok(ws.on_upgrade(move |stream| async move {
        let (sender, mut receiver) = stream.split();

        let mut feed_task = tokio::spawn(feed(ride_id, subscription, sender));

        let mut recv_task = tokio::spawn(async move {
            while let Some(Ok(msg)) = receiver.next().await {
                if let Message::Close(_) = msg {
                    break;
                }
            }
        });

        tokio::select! {
            _ = &mut feed_task => {
                debug!(%ride_id, "chat feed finished");
                recv_task.abort();
            }
            _ = &mut recv_task => {
                info!(%ride_id, "chat client disconnected");
                feed_task.abort();
            }
        }
    }).into_response())
}

/// Writes every message as a JSON text frame, then a normal close frame
/// once the chat ends. Stops early if the client goes away.
async fn feed<S>(ride_id: Uuid, mut subscription: Subscription, mut sender: S)
where
    S: Sink<Message> + Unpin,
{
    while let Some(msg) = subscription.next().await {
        let json = match serde_json::to_string(&msg) {
            Ok(json) => json,
            Err(err) => {
                warn!(%ride_id, message_id = %msg.id, error = %err, "could not encode message");
                continue;
            }
        };
        if sender.send(Message::Text(json.into())).await.is_err() {
            return;
        }
    }

    let _ = sender
        .send(Message::Close(Some(CloseFrame {
            code: close_code::NORMAL,
            reason: Utf8Bytes::from_static("ride closed"),
        })))
        .await;
}
