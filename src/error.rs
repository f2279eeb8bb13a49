//! Error taxonomy for the auth API.
//!
//! Every failure leaving a handler is one of four kinds, each with a fixed
//! status code. Internal causes are logged server-side and replaced by a
//! generic message before reaching the client.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

use crate::users::DirectoryError;

pub const INTERNAL_ERROR_MESSAGE: &str = "Internal server error, something went wrong";

/// Why a request was not authenticated.
///
/// Variants stay distinct server-side; `InvalidCredentials` deliberately covers
/// both "no such user" and "wrong password".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    InvalidCredentials,
    SocialLoginOnly,
    NotAuthenticated,
    InvalidToken,
    UserNotFound,
}

impl AuthFailure {
    pub fn message(self) -> &'static str {
        match self {
            Self::InvalidCredentials => "Invalid credentials",
            Self::SocialLoginOnly => {
                "This account uses Google sign-in. Please log in with Google"
            }
            Self::NotAuthenticated => "Not authenticated",
            Self::InvalidToken => "Invalid token",
            Self::UserNotFound => "User not found",
        }
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{}", .0.message())]
    Authentication(AuthFailure),

    #[error("internal error: {0:#}")]
    Internal(#[from] anyhow::Error),
}

impl AuthError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Authentication(_) => StatusCode::UNAUTHORIZED,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to show the caller.
    pub fn client_message(&self) -> String {
        match self {
            Self::Internal(_) => INTERNAL_ERROR_MESSAGE.to_string(),
            _ => self.to_string(),
        }
    }
}

impl From<AuthFailure> for AuthError {
    fn from(failure: AuthFailure) -> Self {
        Self::Authentication(failure)
    }
}

impl From<DirectoryError> for AuthError {
    fn from(err: DirectoryError) -> Self {
        match err {
            DirectoryError::EmailTaken => Self::Conflict("Email already exists".into()),
            other => Self::Internal(anyhow::Error::new(other).context("user directory")),
        }
    }
}

/// JSON body of every API error.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        if let Self::Internal(e) = &self {
            error!(error = ?e, "request failed");
        }
        let status = self.status_code();
        (
            status,
            Json(ErrorBody {
                error: self.client_message(),
            }),
        )
            .into_response()
    }
}
