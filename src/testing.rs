use std::sync::{
    atomic::{AtomicI64, AtomicUsize, Ordering},
    Arc,
};

use sqlx::SqlitePool;
use time::{macros::datetime, Duration, OffsetDateTime};
use tokio::runtime::Handle;
use uuid::Uuid;

use crate::{
    chat::ChatStream,
    clock::Clock,
    db,
    membership::Coordinator,
    model::{from_millis, to_millis, Gender, Ride, User, VehicleType},
    registry::{Registry, RideSpec},
    reviews::ReviewLedger,
    users::UserDirectory,
    AppState,
};

const START: OffsetDateTime = datetime!(2025-03-22 12:00 UTC);

/// Fresh in-memory service with a clock that only moves when told to.
pub(crate) struct Fixture {
    pub(crate) users: UserDirectory,
    pub(crate) registry: Registry,
    pub(crate) coordinator: Coordinator,
    pub(crate) chat: ChatStream,
    pub(crate) reviews: ReviewLedger,
    now: Arc<AtomicI64>,
}

impl Fixture {
    pub(crate) async fn new() -> Self {
        Self::with_chat_buffer(64).await
    }

    pub(crate) async fn with_chat_buffer(chat_buffer: usize) -> Self {
        Self::build(chat_buffer, None).await
    }

    /// Every clock read made while `interleave` is above zero uses one unit
    /// of it to bump every ride's version, as a writer in another process
    /// would between our read and our compare-and-swap. Needs the
    /// multi-threaded runtime.
    pub(crate) async fn contended(interleave: Arc<AtomicUsize>) -> Self {
        Self::build(64, Some(interleave)).await
    }

    async fn build(chat_buffer: usize, interleave: Option<Arc<AtomicUsize>>) -> Self {
        let db_pool = db::memory().await.unwrap();
        let now = Arc::new(AtomicI64::new(to_millis(START)));
        let clock = {
            let (now, db_pool) = (now.clone(), db_pool.clone());
            Clock::from_fn(move || {
                let armed = interleave.as_ref().is_some_and(|left| {
                    left.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                        .is_ok()
                });
                if armed {
                    bump_versions(&db_pool);
                }
                from_millis(now.load(Ordering::SeqCst))
            })
        };

        let AppState { users, registry, coordinator, chat, reviews } =
            AppState::new(db_pool, clock, chat_buffer);

        Self { users, registry, coordinator, chat, reviews, now }
    }

    pub(crate) fn advance(&self, by: Duration) {
        self.now.fetch_add(by.whole_milliseconds() as i64, Ordering::SeqCst);
    }

    pub(crate) async fn user(&self, first_name: &str, gender: Gender) -> User {
        let user = User {
            id: Uuid::now_v7(),
            first_name: first_name.to_owned(),
            last_name: "Rahman".to_owned(),
            gender,
        };
        self.users.upsert(&user).await.unwrap();
        user
    }

    /// Leaves in three hours, NSU Gate to Banani.
    pub(crate) fn spec(&self, host_id: Uuid, vehicle_type: VehicleType) -> RideSpec {
        RideSpec {
            host_id,
            vehicle_type,
            pickup_name: "NSU Gate".to_owned(),
            destination_name: "Banani".to_owned(),
            departure_time: self.registry.now() + Duration::hours(3),
            total_fare: 150.0,
            seat_capacity: None,
            is_female_only: false,
        }
    }

    pub(crate) async fn ride(&self, host_id: Uuid, vehicle_type: VehicleType) -> Ride {
        self.registry.create(self.spec(host_id, vehicle_type)).await.unwrap()
    }

    pub(crate) async fn ride_with_seats(&self, host_id: Uuid, seats: u32) -> Ride {
        let mut spec = self.spec(host_id, VehicleType::Car);
        spec.seat_capacity = Some(seats);
        self.registry.create(spec).await.unwrap()
    }
}

fn bump_versions(db_pool: &SqlitePool) {
    tokio::task::block_in_place(|| {
        Handle::current().block_on(async {
            sqlx::query("UPDATE rides SET version=version+1")
                .execute(db_pool)
                .await
                .unwrap();
        })
    });
}
