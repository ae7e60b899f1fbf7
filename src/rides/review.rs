use axum::{debug_handler, extract::{Path, State}, http::StatusCode, Json};
use serde::Deserialize;
use uuid::Uuid;

use crate::{model::Review, reviews::ReviewLedger, AppResult, AppState};

#[derive(Deserialize)]
pub(crate) struct ReviewBody {
    reviewer_id: Uuid,
    reviewee_id: Uuid,
    rating: i64,
    #[serde(default)]
    comment: Option<String>,
}

#[debug_handler(state = AppState)]
pub(crate) async fn submit_review(
    State(reviews): State<ReviewLedger>,
    Path(ride_id): Path<Uuid>,
    Json(ReviewBody { reviewer_id, reviewee_id, rating, comment }): Json<ReviewBody>,
) -> AppResult<(StatusCode, Json<Review>)> {
    let review = reviews
        .submit(ride_id, reviewer_id, reviewee_id, rating, comment)
        .await?;
    Ok((StatusCode::CREATED, Json(review)))
}
