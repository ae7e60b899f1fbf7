use axum::{debug_handler, extract::{Path, State}, Json};
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    model::{Gender, Review, User},
    reviews::ReviewLedger,
    users::{Profile, UserDirectory},
    AppResult, AppState,
};

#[derive(Deserialize)]
pub(crate) struct UserBody {
    first_name: String,
    #[serde(default)]
    last_name: String,
    gender: Gender,
}

#[debug_handler(state = AppState)]
pub(crate) async fn save_user(
    State(users): State<UserDirectory>,
    Path(id): Path<Uuid>,
    Json(UserBody { first_name, last_name, gender }): Json<UserBody>,
) -> AppResult<Json<User>> {
    let user = User { id, first_name, last_name, gender };
    users.upsert(&user).await?;
    Ok(Json(users.get(id).await?))
}

#[debug_handler(state = AppState)]
pub(crate) async fn profile(
    State(users): State<UserDirectory>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Profile>> {
    Ok(Json(users.profile(id).await?))
}

#[debug_handler(state = AppState)]
pub(crate) async fn reviews(
    State(reviews): State<ReviewLedger>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Vec<Review>>> {
    Ok(Json(reviews.reviews_for(id).await?))
}
