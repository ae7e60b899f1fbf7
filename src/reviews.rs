use tracing::info;
use uuid::Uuid;

use crate::{
    error::{is_unique_violation, RideError, RideResult},
    model::{from_millis, parse_uuid, to_millis, Review, RideStatus},
    registry::Registry,
};

pub const MAX_COMMENT_LEN: usize = 1000;

type ReviewRow = (String, String, String, String, i64, Option<String>, i64);

/// At most one review per (ride, reviewer, reviewee), only after departure
/// and only between people who were on the ride.
#[derive(Clone)]
pub struct ReviewLedger {
    registry: Registry,
}

impl ReviewLedger {
    pub fn new(registry: Registry) -> Self {
        Self { registry }
    }

    pub async fn submit(
        &self,
        ride_id: Uuid,
        reviewer_id: Uuid,
        reviewee_id: Uuid,
        rating: i64,
        comment: Option<String>,
    ) -> RideResult<Review> {
        if !(1..=5).contains(&rating) {
            return Err(RideError::InvalidRating(rating));
        }
        let comment = comment.map(|c| c.trim().to_owned()).filter(|c| !c.is_empty());
        if comment.as_ref().is_some_and(|c| c.chars().count() > MAX_COMMENT_LEN) {
            return Err(RideError::validation(format!(
                "comment is longer than {MAX_COMMENT_LEN} characters"
            )));
        }
        if reviewer_id == reviewee_id {
            return Err(RideError::NotEligible("cannot review yourself".to_owned()));
        }

        let ride = self.registry.get(ride_id).await?;
        if ride.status != RideStatus::Departed {
            return Err(RideError::NotEligible("ride has not departed".to_owned()));
        }
        if !ride.is_participant(reviewer_id) || !ride.is_participant(reviewee_id) {
            return Err(RideError::NotEligible("both people must have been on the ride".to_owned()));
        }

        let review = Review {
            id: Uuid::now_v7(),
            ride_id,
            reviewer_id,
            reviewee_id,
            rating: rating as u8,
            comment,
            created_at: self.registry.now(),
        };

        let inserted = sqlx::query(
            "INSERT INTO reviews (id,ride_id,reviewer_id,reviewee_id,rating,comment,created_at)
             VALUES (?,?,?,?,?,?,?)",
        )
        .bind(review.id.to_string())
        .bind(ride_id.to_string())
        .bind(reviewer_id.to_string())
        .bind(reviewee_id.to_string())
        .bind(rating)
        .bind(review.comment.as_deref())
        .bind(to_millis(review.created_at))
        .execute(self.registry.db_pool())
        .await;

        match inserted {
            Ok(_) => {
                info!(%ride_id, %reviewer_id, %reviewee_id, rating, "review submitted");
                Ok(review)
            }
            Err(err) if is_unique_violation(&err) => Err(RideError::Duplicate),
            Err(err) => Err(err.into()),
        }
    }

    /// Reviews a user has received, newest first.
    pub async fn reviews_for(&self, reviewee_id: Uuid) -> RideResult<Vec<Review>> {
        self.registry.users().get(reviewee_id).await?;

        let rows: Vec<ReviewRow> = sqlx::query_as(
            "SELECT id,ride_id,reviewer_id,reviewee_id,rating,comment,created_at FROM reviews
             WHERE reviewee_id=? ORDER BY created_at DESC, id DESC",
        )
        .bind(reviewee_id.to_string())
        .fetch_all(self.registry.db_pool())
        .await?;

        let mut reviews = Vec::with_capacity(rows.len());
        for (id, ride_id, reviewer_id, reviewee_id, rating, comment, created_at) in rows {
            reviews.push(Review {
                id: parse_uuid(&id)?,
                ride_id: parse_uuid(&ride_id)?,
                reviewer_id: parse_uuid(&reviewer_id)?,
                reviewee_id: parse_uuid(&reviewee_id)?,
                rating: rating as u8,
                comment,
                created_at: from_millis(created_at),
            });
        }
        Ok(reviews)
    }
}
