pub mod appresult;
pub mod chat;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod log;
pub mod membership;
pub mod model;
pub mod profiles;
pub mod registry;
pub mod reviews;
pub mod rides;
pub mod users;

#[cfg(test)]
mod testing;

use axum::{extract::FromRef, Router};
use sqlx::SqlitePool;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

pub use appresult::{AppError, AppResult};

use chat::{ChatHub, ChatStream};
use clock::Clock;
use membership::{Coordinator, RideLocks};
use registry::Registry;
use reviews::ReviewLedger;
use users::UserDirectory;

#[derive(Clone, FromRef)]
pub struct AppState {
    pub users: UserDirectory,
    pub registry: Registry,
    pub coordinator: Coordinator,
    pub chat: ChatStream,
    pub reviews: ReviewLedger,
}

impl AppState {
    pub fn new(db_pool: SqlitePool, clock: Clock, chat_buffer: usize) -> Self {
        let users = UserDirectory::new(db_pool.clone());
        let registry = Registry::new(db_pool, clock, users.clone());

        // Membership changes and chat appends on one ride share a lock.
        let locks = RideLocks::default();
        let chat = ChatStream::new(registry.clone(), ChatHub::new(chat_buffer), locks.clone());
        let coordinator = Coordinator::new(registry.clone(), chat.clone(), locks);
        let reviews = ReviewLedger::new(registry.clone());

        AppState {
            users,
            registry,
            coordinator,
            chat,
            reviews,
        }
    }
}

pub fn app(app_state: AppState) -> Router {
    Router::new()
        .nest("/rides", rides::router())
        .nest("/codes", rides::codes_router())
        .nest("/users", profiles::router())
        .with_state(app_state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
