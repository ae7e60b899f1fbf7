use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    chat::ChatStream,
    error::{is_unique_violation, RideError, RideResult},
    model::{to_millis, Gender, Ride, RideStatus},
    registry::Registry,
};

/// Attempts a membership write gets before giving up with `Conflict`.
const MAX_ATTEMPTS: usize = 3;

/// Idle entries are only pruned once the table grows past this.
const PRUNE_THRESHOLD: usize = 256;

/// One async mutex per ride. Writers to different rides never wait on each
/// other.
#[derive(Clone, Default)]
pub struct RideLocks {
    locks: Arc<Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>>,
}

impl RideLocks {
    pub async fn lock(&self, ride_id: Uuid) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            if locks.len() > PRUNE_THRESHOLD {
                locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            }
            locks.entry(ride_id).or_default().clone()
        };
        lock.lock_owned().await
    }
}

/// Join, leave and delete rules. Every write is a version compare-and-swap
/// on the ride row, issued while holding that ride's lock.
#[derive(Clone)]
pub struct Coordinator {
    registry: Registry,
    chat: ChatStream,
    locks: RideLocks,
}

impl Coordinator {
    pub fn new(registry: Registry, chat: ChatStream, locks: RideLocks) -> Self {
        Self { registry, chat, locks }
    }

    pub async fn join(&self, ride_id: Uuid, user_id: Uuid) -> RideResult<Ride> {
        let _guard = self.locks.lock(ride_id).await;

        let mut ride = self.registry.get(ride_id).await?;
        let gender = self.registry.users().gender_of(user_id).await?;

        for attempt in 1..=MAX_ATTEMPTS {
            check_joinable(&ride, user_id, gender)?;

            if self.try_join(&ride, user_id).await? {
                info!(%ride_id, %user_id, "joined ride");
                return self.registry.get(ride_id).await;
            }

            debug!(%ride_id, %user_id, attempt, "lost join race, retrying");
            ride = self.registry.get(ride_id).await?;
        }

        Err(RideError::Conflict)
    }

    pub async fn join_by_code(&self, code: &str, user_id: Uuid) -> RideResult<Ride> {
        let ride_id = self.registry.resolve_code(code).await?;
        self.join(ride_id, user_id).await
    }

    pub async fn leave(&self, ride_id: Uuid, user_id: Uuid) -> RideResult<Ride> {
        let _guard = self.locks.lock(ride_id).await;

        for attempt in 1..=MAX_ATTEMPTS {
            let ride = self.registry.get(ride_id).await?;
            if !ride.members.contains(&user_id) {
                return Err(RideError::NotMember);
            }
            if !ride.status.is_active() {
                return Err(RideError::Closed);
            }

            if self.try_leave(&ride, user_id).await? {
                info!(%ride_id, %user_id, "left ride");
                return self.registry.get(ride_id).await;
            }

            debug!(%ride_id, %user_id, attempt, "lost leave race, retrying");
        }

        Err(RideError::Conflict)
    }

    /// Cancels the ride, drops its members and closes its chat for writing.
    pub async fn delete(&self, ride_id: Uuid, requester_id: Uuid) -> RideResult<()> {
        let _guard = self.locks.lock(ride_id).await;

        let ride = self.registry.get(ride_id).await?;
        if ride.host_id != requester_id {
            return Err(RideError::Forbidden);
        }
        if !ride.status.is_active() {
            return Err(RideError::Closed);
        }

        self.registry.update_status(ride_id, RideStatus::Cancelled).await?;
        self.chat.close(ride_id);

        info!(%ride_id, dropped_members = ride.members.len(), "ride cancelled by host");
        Ok(())
    }

    async fn try_join(&self, ride: &Ride, user_id: Uuid) -> RideResult<bool> {
        let next = if ride.members.len() + 1 >= ride.seat_capacity as usize {
            RideStatus::Full
        } else {
            RideStatus::Open
        };

        let mut tx = self.registry.db_pool().begin().await?;
        let done = sqlx::query(
            "UPDATE rides SET status=?, version=version+1
             WHERE id=? AND version=? AND status IN ('open','full')",
        )
        .bind(next.as_str())
        .bind(ride.id.to_string())
        .bind(ride.version)
        .execute(&mut *tx)
        .await?;
        if done.rows_affected() == 0 {
            return Ok(false);
        }

        let inserted =
            sqlx::query("INSERT INTO ride_members (ride_id,user_id,joined_at) VALUES (?,?,?)")
                .bind(ride.id.to_string())
                .bind(user_id.to_string())
                .bind(to_millis(self.registry.now()))
                .execute(&mut *tx)
                .await;
        match inserted {
            Ok(_) => {}
            Err(err) if is_unique_violation(&err) => return Err(RideError::AlreadyMember),
            Err(err) => return Err(err.into()),
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn try_leave(&self, ride: &Ride, user_id: Uuid) -> RideResult<bool> {
        let mut tx = self.registry.db_pool().begin().await?;
        let done = sqlx::query(
            "UPDATE rides SET status=?, version=version+1 WHERE id=? AND version=?",
        )
        .bind(RideStatus::Open.as_str())
        .bind(ride.id.to_string())
        .bind(ride.version)
        .execute(&mut *tx)
        .await?;
        if done.rows_affected() == 0 {
            return Ok(false);
        }

        sqlx::query("DELETE FROM ride_members WHERE ride_id=? AND user_id=?")
            .bind(ride.id.to_string())
            .bind(user_id.to_string())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }
}

fn check_joinable(ride: &Ride, user_id: Uuid, gender: Gender) -> RideResult<()> {
    if !ride.status.is_active() {
        return Err(RideError::Closed);
    }
    if ride.is_participant(user_id) {
        return Err(RideError::AlreadyMember);
    }
    if ride.is_female_only && gender != Gender::Female {
        return Err(RideError::Ineligible);
    }
    if ride.members.len() >= ride.seat_capacity as usize {
        return Err(RideError::Full);
    }
    Ok(())
}
