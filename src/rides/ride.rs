use axum::{debug_handler, extract::{Path, Query, State}, Json};
use uuid::Uuid;

use crate::{registry::{Registry, RideFilter}, AppResult, AppState};

use super::RideView;

#[debug_handler(state = AppState)]
pub(crate) async fn ride(
    State(registry): State<Registry>,
    Path(ride_id): Path<Uuid>,
) -> AppResult<Json<RideView>> {
    Ok(Json(registry.get(ride_id).await?.into()))
}

#[debug_handler(state = AppState)]
pub(crate) async fn list_rides(
    State(registry): State<Registry>,
    Query(filter): Query<RideFilter>,
) -> AppResult<Json<Vec<RideView>>> {
    let rides = registry.list(&filter).await?;
    Ok(Json(rides.into_iter().map(RideView::from).collect()))
}
