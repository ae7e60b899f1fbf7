use axum::{http::StatusCode, response::{IntoResponse, Response}, Json};
use serde::Serialize;

use crate::error::RideError;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug)]
pub struct AppError(pub RideError);

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

fn status_of(err: &RideError) -> StatusCode {
    use RideError::*;
    match err {
        Validation(_) | InvalidRating(_) => StatusCode::BAD_REQUEST,
        Forbidden | NotAuthorized | Ineligible => StatusCode::FORBIDDEN,
        NotFound(_) => StatusCode::NOT_FOUND,
        Full | AlreadyMember | NotMember | Closed | NotEligible(_) | Duplicate => {
            StatusCode::CONFLICT
        }
        Conflict => StatusCode::SERVICE_UNAVAILABLE,
        Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = status_of(&self.0);
        if status.is_server_error() {
            tracing::error!(error = ?self.0, "request failed");
        }
        let body = ErrorBody {
            error: self.0.kind(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<RideError> for AppError {
    fn from(err: RideError) -> Self {
        Self(err)
    }
}
