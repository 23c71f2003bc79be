use std::convert::Infallible;

use log::error;
use serde::Serialize;
use thiserror::Error;
use warp::http::StatusCode;
use warp::{Rejection, Reply};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("Invalid {key} value: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Duplicate entry")]
    Duplicate,
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[cfg(test)]
    #[error("Store unavailable")]
    Unavailable,
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("Unknown event: {0}")]
    UnknownEvent(String),
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("{0}")]
    InvalidInput(String),
    #[error("Not logged in.")]
    Unauthorized,
    #[error("Username or password is incorrect.")]
    InvalidCredentials,
    #[error("Username is not available.")]
    UsernameUnavailable,
    #[error("Too many attempts. Try again later.")]
    RateLimited,
    #[error("Password hashing failed")]
    Hashing,
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl warp::reject::Reject for AppError {}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            AppError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized | AppError::InvalidCredentials => StatusCode::UNAUTHORIZED,
            AppError::UsernameUnavailable => StatusCode::CONFLICT,
            AppError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            AppError::Hashing | AppError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message shown to the client. Internal failures stay generic.
    fn public_message(&self) -> String {
        match self {
            AppError::Hashing | AppError::Store(_) => "Something went wrong. Please try again.".to_string(),
            other => other.to_string(),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    success: bool,
    message: String,
}

pub async fn handle_rejection(err: Rejection) -> Result<impl Reply, Infallible> {
    let (status, message) = if let Some(app) = err.find::<AppError>() {
        if app.status() == StatusCode::INTERNAL_SERVER_ERROR {
            error!("Request failed: {app}");
        }
        (app.status(), app.public_message())
    } else if err.is_not_found() {
        (StatusCode::NOT_FOUND, "Not found.".to_string())
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        (StatusCode::METHOD_NOT_ALLOWED, "Method not allowed.".to_string())
    } else if err.find::<warp::filters::body::BodyDeserializeError>().is_some()
        || err.find::<warp::reject::UnsupportedMediaType>().is_some()
        || err.find::<warp::reject::InvalidQuery>().is_some()
    {
        (StatusCode::BAD_REQUEST, "Malformed request.".to_string())
    } else {
        error!("Unhandled rejection: {err:?}");
        (StatusCode::INTERNAL_SERVER_ERROR, "Something went wrong. Please try again.".to_string())
    };

    let body = warp::reply::json(&ErrorBody {
        success: false,
        message,
    });
    Ok(warp::reply::with_status(body, status))
}
