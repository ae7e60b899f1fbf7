use axum::{debug_handler, extract::{Path, Query, State}, http::StatusCode, Json};
use serde::Deserialize;
use uuid::Uuid;

use crate::{membership::Coordinator, AppResult, AppState};

use super::RideView;

#[derive(Deserialize)]
pub(crate) struct MemberBody {
    user_id: Uuid,
}

#[derive(Deserialize)]
pub(crate) struct DeleteQuery {
    requester_id: Uuid,
}

#[debug_handler(state = AppState)]
pub(crate) async fn join_ride(
    State(coordinator): State<Coordinator>,
    Path(ride_id): Path<Uuid>,
    Json(MemberBody { user_id }): Json<MemberBody>,
) -> AppResult<Json<RideView>> {
    Ok(Json(coordinator.join(ride_id, user_id).await?.into()))
}

#[debug_handler(state = AppState)]
pub(crate) async fn join_by_code(
    State(coordinator): State<Coordinator>,
    Path(code): Path<String>,
    Json(MemberBody { user_id }): Json<MemberBody>,
) -> AppResult<Json<RideView>> {
    Ok(Json(coordinator.join_by_code(&code, user_id).await?.into()))
}

#[debug_handler(state = AppState)]
pub(crate) async fn leave_ride(
    State(coordinator): State<Coordinator>,
    Path(ride_id): Path<Uuid>,
    Json(MemberBody { user_id }): Json<MemberBody>,
) -> AppResult<Json<RideView>> {
    Ok(Json(coordinator.leave(ride_id, user_id).await?.into()))
}

#[debug_handler(state = AppState)]
pub(crate) async fn delete_ride(
    State(coordinator): State<Coordinator>,
    Path(ride_id): Path<Uuid>,
    Query(DeleteQuery { requester_id }): Query<DeleteQuery>,
) -> AppResult<StatusCode> {
    coordinator.delete(ride_id, requester_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
