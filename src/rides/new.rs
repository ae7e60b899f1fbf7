use axum::{debug_handler, extract::State, http::StatusCode, Json};

use crate::{registry::{Registry, RideSpec}, AppResult, AppState};

use super::RideView;

#[debug_handler(state = AppState)]
pub(crate) async fn new_ride(
    State(registry): State<Registry>,
    Json(spec): Json<RideSpec>,
) -> AppResult<(StatusCode, Json<RideView>)> {
    let ride = registry.create(spec).await?;
    Ok((StatusCode::CREATED, Json(ride.into())))
}
