use thiserror::Error;

pub type RideResult<T> = Result<T, RideError>;

/// Everything a ride session operation can refuse with.
#[derive(Debug, Error)]
pub enum RideError {
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("ride is full")]
    Full,

    #[error("user is not eligible for this ride")]
    Ineligible,

    #[error("user is already part of this ride")]
    AlreadyMember,

    #[error("user is not a member of this ride")]
    NotMember,

    #[error("ride is closed")]
    Closed,

    #[error("only the host may do that")]
    Forbidden,

    #[error("sender is not part of this ride")]
    NotAuthorized,

    /// Concurrent membership updates kept winning the version race.
    #[error("ride was modified concurrently, try again")]
    Conflict,

    #[error("rating {0} is outside 1..=5")]
    InvalidRating(i64),

    #[error("review not allowed: {0}")]
    NotEligible(String),

    #[error("review already submitted")]
    Duplicate,

    #[error("storage error")]
    Storage(#[from] sqlx::Error),
}

impl RideError {
    /// Stable identifier sent to clients.
    pub fn kind(&self) -> &'static str {
        use RideError::*;
        match self {
            Validation(_) => "validation_error",
            NotFound(_) => "not_found",
            Full => "full",
            Ineligible => "ineligible",
            AlreadyMember => "already_member",
            NotMember => "not_member",
            Closed => "closed",
            Forbidden => "forbidden",
            NotAuthorized => "not_authorized",
            Conflict => "conflict",
            InvalidRating(_) => "invalid_rating",
            NotEligible(_) => "not_eligible",
            Duplicate => "duplicate",
            Storage(_) => "internal",
        }
    }

    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        RideError::Validation(msg.into())
    }
}

/// True when the database refused a write because of a UNIQUE constraint.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .map(|e| e.is_unique_violation())
        .unwrap_or(false)
}
