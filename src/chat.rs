use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, PoisonError},
};

use sqlx::SqlitePool;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::{RideError, RideResult},
    membership::RideLocks,
    model::{from_millis, parse_uuid, to_millis, ChatMessage, HistoryOrder, RideStatus},
    registry::Registry,
};

pub const MAX_TEXT_LEN: usize = 2000;

type MessageRow = (String, String, String, i64);

/// Live fan-out, one broadcast channel per ride with listeners. A ride
/// without listeners has no entry.
#[derive(Clone)]
pub struct ChatHub {
    channels: Arc<Mutex<HashMap<Uuid, broadcast::Sender<ChatMessage>>>>,
    capacity: usize,
}

impl ChatHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Arc::default(),
            capacity: capacity.max(1),
        }
    }

    fn subscribe(&self, ride_id: Uuid) -> broadcast::Receiver<ChatMessage> {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        channels
            .entry(ride_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    fn publish(&self, msg: ChatMessage) {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = channels.get(&msg.ride_id) {
            let ride_id = msg.ride_id;
            if tx.send(msg).is_err() {
                channels.remove(&ride_id);
            }
        }
    }

    /// Drops the sender so every listener ends after what it already has.
    /// Callers hold the ride lock, so no new listener can attach to a
    /// cancelled ride afterwards.
    fn close(&self, ride_id: Uuid) {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        channels.remove(&ride_id);
    }

    /// Forgets the ride's channel once its last listener is gone.
    fn release(&self, ride_id: Uuid) {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        if channels.get(&ride_id).is_some_and(|tx| tx.receiver_count() == 0) {
            channels.remove(&ride_id);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Append-only per-ride chat with live subscriptions.
#[derive(Clone)]
pub struct ChatStream {
    registry: Registry,
    hub: ChatHub,
    locks: RideLocks,
}

impl ChatStream {
    pub fn new(registry: Registry, hub: ChatHub, locks: RideLocks) -> Self {
        Self { registry, hub, locks }
    }

    pub async fn append(
        &self,
        ride_id: Uuid,
        sender_id: Uuid,
        text: &str,
    ) -> RideResult<ChatMessage> {
        let text = text.trim();
        if text.is_empty() {
            return Err(RideError::validation("message must not be empty"));
        }
        if text.chars().count() > MAX_TEXT_LEN {
            return Err(RideError::validation(format!(
                "message is longer than {MAX_TEXT_LEN} characters"
            )));
        }

        let _guard = self.locks.lock(ride_id).await;

        let ride = self.registry.get(ride_id).await?;
        if ride.status == RideStatus::Cancelled {
            return Err(RideError::Closed);
        }
        if !ride.is_participant(sender_id) {
            return Err(RideError::NotAuthorized);
        }

        let (last,): (Option<i64>,) =
            sqlx::query_as("SELECT MAX(sent_at) FROM messages WHERE ride_id=?")
                .bind(ride_id.to_string())
                .fetch_one(self.db_pool())
                .await?;
        let now = to_millis(self.registry.now());
        let sent_at = last.map_or(now, |last| now.max(last + 1));

        let msg = ChatMessage {
            id: Uuid::now_v7(),
            ride_id,
            sender_id,
            text: text.to_owned(),
            sent_at: from_millis(sent_at),
        };

        sqlx::query("INSERT INTO messages (id,ride_id,sender_id,text,sent_at) VALUES (?,?,?,?,?)")
            .bind(msg.id.to_string())
            .bind(ride_id.to_string())
            .bind(sender_id.to_string())
            .bind(&msg.text)
            .bind(sent_at)
            .execute(self.db_pool())
            .await?;

        debug!(%ride_id, %sender_id, message_id = %msg.id, "message appended");
        self.hub.publish(msg.clone());
        Ok(msg)
    }

    /// Everything said on the ride so far. Readable after cancellation.
    pub async fn history(
        &self,
        ride_id: Uuid,
        order: HistoryOrder,
    ) -> RideResult<Vec<ChatMessage>> {
        self.registry.get(ride_id).await?;
        let sql = match order {
            HistoryOrder::Oldest => {
                "SELECT id,sender_id,text,sent_at FROM messages WHERE ride_id=?
                 ORDER BY sent_at ASC, id ASC"
            }
            HistoryOrder::Newest => {
                "SELECT id,sender_id,text,sent_at FROM messages WHERE ride_id=?
                 ORDER BY sent_at DESC, id DESC"
            }
        };
        let rows: Vec<MessageRow> = sqlx::query_as(sql)
            .bind(ride_id.to_string())
            .fetch_all(self.db_pool())
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| message_from_row(ride_id, row))
            .collect::<Result<_, _>>()?)
    }

    /// History first, in the requested order, then live messages oldest to
    /// newest until the subscription is dropped or the ride is cancelled.
    pub async fn subscribe(
        &self,
        ride_id: Uuid,
        order: HistoryOrder,
    ) -> RideResult<Subscription> {
        // Listen before reading history so nothing falls in between.
        let rx = {
            let _guard = self.locks.lock(ride_id).await;
            match self.registry.get(ride_id).await?.status {
                RideStatus::Cancelled => None,
                _ => Some(self.hub.subscribe(ride_id)),
            }
        };
        let history = self.history(ride_id, order).await?;
        let last_seen = history.iter().map(ChatMessage::order_key).max();

        info!(
            %ride_id,
            backlog = history.len(),
            live = rx.is_some(),
            "chat subscription opened"
        );
        Ok(Subscription {
            ride_id,
            hub: self.hub.clone(),
            db_pool: self.db_pool().clone(),
            pending: history.into(),
            rx,
            last_seen,
        })
    }

    pub(crate) fn close(&self, ride_id: Uuid) {
        self.hub.close(ride_id);
    }

    fn db_pool(&self) -> &SqlitePool {
        self.registry.db_pool()
    }
}

/// A live feed for one ride. Dropping it releases the listener.
pub struct Subscription {
    ride_id: Uuid,
    hub: ChatHub,
    db_pool: SqlitePool,
    pending: VecDeque<ChatMessage>,
    rx: Option<broadcast::Receiver<ChatMessage>>,
    last_seen: Option<(i64, Uuid)>,
}

impl Subscription {
    /// Next message, or `None` once the chat is closed and drained.
    pub async fn next(&mut self) -> Option<ChatMessage> {
        loop {
            if let Some(msg) = self.pending.pop_front() {
                return Some(msg);
            }

            let rx = self.rx.as_mut()?;
            match rx.recv().await {
                Ok(msg) => {
                    let key = msg.order_key();
                    if self.last_seen.is_some_and(|seen| key <= seen) {
                        continue;
                    }
                    self.last_seen = Some(key);
                    return Some(msg);
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(ride_id = %self.ride_id, skipped, "subscriber lagged, catching up");
                    if let Err(err) = self.catch_up().await {
                        warn!(ride_id = %self.ride_id, error = %err, "catch-up failed");
                        self.detach();
                    }
                }
                Err(RecvError::Closed) => {
                    debug!(ride_id = %self.ride_id, "chat closed");
                    self.rx = None;
                }
            }
        }
    }

    fn detach(&mut self) {
        if let Some(rx) = self.rx.take() {
            drop(rx);
            self.hub.release(self.ride_id);
        }
    }

    async fn catch_up(&mut self) -> RideResult<()> {
        let after = self.last_seen.map_or(i64::MIN, |(sent_at, _)| sent_at);
        let rows: Vec<MessageRow> = sqlx::query_as(
            "SELECT id,sender_id,text,sent_at FROM messages WHERE ride_id=? AND sent_at>?
             ORDER BY sent_at ASC, id ASC",
        )
        .bind(self.ride_id.to_string())
        .bind(after)
        .fetch_all(&self.db_pool)
        .await?;

        for row in rows {
            let msg = message_from_row(self.ride_id, row)?;
            self.last_seen = Some(msg.order_key());
            self.pending.push_back(msg);
        }
        Ok(())
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach();
        debug!(ride_id = %self.ride_id, "chat subscription released");
    }
}

fn message_from_row(ride_id: Uuid, row: MessageRow) -> Result<ChatMessage, sqlx::Error> {
    let (id, sender_id, text, sent_at) = row;
    Ok(ChatMessage {
        id: parse_uuid(&id)?,
        ride_id,
        sender_id: parse_uuid(&sender_id)?,
        text,
        sent_at: from_millis(sent_at),
    })
}
