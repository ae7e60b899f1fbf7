mod page;

use axum::{routing::get, Router};

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/{id}", get(page::profile).put(page::save_user))
        .route("/{id}/reviews", get(page::reviews))
}
