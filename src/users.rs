use serde::Serialize;
use sqlx::SqlitePool;
use tracing::info;
use uuid::Uuid;

use crate::{
    error::{RideError, RideResult},
    model::{parse_column, Gender, RideStatus, User},
};

/// Who riders are. Identity itself is owned by the auth provider; this only
/// keeps the attributes ride rules depend on.
#[derive(Clone)]
pub struct UserDirectory {
    db_pool: SqlitePool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Profile {
    #[serde(flatten)]
    pub user: User,
    pub average_rating: Option<f64>,
    pub total_reviews: i64,
    pub total_rides: i64,
}

impl UserDirectory {
    pub fn new(db_pool: SqlitePool) -> Self {
        Self { db_pool }
    }

    pub async fn upsert(&self, user: &User) -> RideResult<()> {
        if user.first_name.trim().is_empty() {
            return Err(RideError::validation("first_name must not be empty"));
        }

        sqlx::query(
            "INSERT INTO users (id,first_name,last_name,gender) VALUES (?,?,?,?)
             ON CONFLICT(id) DO UPDATE SET first_name=excluded.first_name,
                last_name=excluded.last_name, gender=excluded.gender",
        )
        .bind(user.id.to_string())
        .bind(user.first_name.trim())
        .bind(user.last_name.trim())
        .bind(user.gender.as_str())
        .execute(&self.db_pool)
        .await?;

        info!(user_id = %user.id, "user saved");
        Ok(())
    }

    pub async fn find(&self, id: Uuid) -> RideResult<Option<User>> {
        let row: Option<(String, String, String)> =
            sqlx::query_as("SELECT first_name,last_name,gender FROM users WHERE id=?")
                .bind(id.to_string())
                .fetch_optional(&self.db_pool)
                .await?;

        let Some((first_name, last_name, gender)) = row else {
            return Ok(None);
        };

        Ok(Some(User {
            id,
            first_name,
            last_name,
            gender: parse_column(&gender)?,
        }))
    }

    pub async fn get(&self, id: Uuid) -> RideResult<User> {
        self.find(id).await?.ok_or(RideError::NotFound("user"))
    }

    pub async fn gender_of(&self, id: Uuid) -> RideResult<Gender> {
        Ok(self.get(id).await?.gender)
    }

    /// The user plus what other riders think of them.
    pub async fn profile(&self, id: Uuid) -> RideResult<Profile> {
        let user = self.get(id).await?;

        let (average_rating, total_reviews): (Option<f64>, i64) =
            sqlx::query_as("SELECT AVG(rating), COUNT(*) FROM reviews WHERE reviewee_id=?")
                .bind(id.to_string())
                .fetch_one(&self.db_pool)
                .await?;

        let (total_rides,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM rides r
             WHERE r.status=?
               AND (r.host_id=? OR EXISTS (
                   SELECT 1 FROM ride_members m WHERE m.ride_id=r.id AND m.user_id=?))",
        )
        .bind(RideStatus::Departed.as_str())
        .bind(id.to_string())
        .bind(id.to_string())
        .fetch_one(&self.db_pool)
        .await?;

        Ok(Profile {
            user,
            average_rating,
            total_reviews,
            total_rides,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn rider(first_name: &str, gender: Gender) -> User {
        User {
            id: Uuid::now_v7(),
            first_name: first_name.to_owned(),
            last_name: "Rahman".to_owned(),
            gender,
        }
    }

    #[tokio::test]
    async fn upsert_then_get() {
        let users = UserDirectory::new(db::memory().await.unwrap());
        let mut ayesha = rider("Ayesha", Gender::Female);
        users.upsert(&ayesha).await.unwrap();
        assert_eq!(users.get(ayesha.id).await.unwrap(), ayesha);

        ayesha.last_name = "Karim".to_owned();
        users.upsert(&ayesha).await.unwrap();
        assert_eq!(users.get(ayesha.id).await.unwrap().last_name, "Karim");
    }

    #[tokio::test]
    async fn unknown_user_is_not_found() {
        let users = UserDirectory::new(db::memory().await.unwrap());
        let err = users.get(Uuid::now_v7()).await.unwrap_err();
        assert!(matches!(err, RideError::NotFound("user")));
    }

    #[tokio::test]
    async fn blank_name_is_rejected() {
        let users = UserDirectory::new(db::memory().await.unwrap());
        let err = users.upsert(&rider("  ", Gender::Male)).await.unwrap_err();
        assert!(matches!(err, RideError::Validation(_)));
    }

    #[tokio::test]
    async fn fresh_profile_has_no_rating() {
        let users = UserDirectory::new(db::memory().await.unwrap());
        let sarah = rider("Sarah", Gender::Female);
        users.upsert(&sarah).await.unwrap();

        let profile = users.profile(sarah.id).await.unwrap();
        assert_eq!(profile.average_rating, None);
        assert_eq!(profile.total_reviews, 0);
        assert_eq!(profile.total_rides, 0);
    }
}
