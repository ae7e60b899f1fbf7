mod membership;
mod msg;
mod new;
mod review;
mod ride;
mod ws;

use axum::{routing::{get, post}, Router};
use serde::Serialize;

use crate::{model::Ride, AppState};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(ride::list_rides).post(new::new_ride))
        .route("/{id}", get(ride::ride).delete(membership::delete_ride))
        .route("/{id}/join", post(membership::join_ride))
        .route("/{id}/leave", post(membership::leave_ride))
        .route("/{id}/messages", get(msg::history).post(msg::send_msg))
        .route("/{id}/messages/ws", get(ws::ride_ws))
        .route("/{id}/reviews", post(review::submit_review))
}

pub fn codes_router() -> Router<AppState> {
    Router::new()
        .route("/{code}/join", post(membership::join_by_code))
}

/// What clients see of a ride.
#[derive(Serialize)]
pub(crate) struct RideView {
    #[serde(flatten)]
    ride: Ride,
    seats_available: u32,
}

impl From<Ride> for RideView {
    fn from(ride: Ride) -> Self {
        let seats_available = ride.seats_available();
        RideView { ride, seats_available }
    }
}
