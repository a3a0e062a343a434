use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::fmt;
use warp::http::StatusCode;
use warp::reject;
use warp::Rejection;
use log;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Unauthenticated,
    Forbidden,
    NotFound,
    NotImplemented,
    Upstream,
}

impl ErrorKind {
    pub fn status(&self) -> StatusCode {
        match self {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::Unauthenticated => StatusCode::UNAUTHORIZED,
            ErrorKind::Forbidden => StatusCode::FORBIDDEN,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::NotImplemented => StatusCode::NOT_IMPLEMENTED,
            ErrorKind::Upstream => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Route-boundary failure. The message is shown to the caller as is, so
/// upstream failures should only ever carry a generic text.
#[derive(Debug)]
pub struct ApiRejection {
    pub kind: ErrorKind,
    pub message: String,
}

impl reject::Reject for ApiRejection {}

impl fmt::Display for ApiRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl ApiRejection {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Rejection {
        warp::reject::custom(ApiRejection {
            kind,
            message: message.into(),
        })
    }

    pub fn validation(message: impl Into<String>) -> Rejection {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn unauthenticated(message: impl Into<String>) -> Rejection {
        Self::new(ErrorKind::Unauthenticated, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Rejection {
        Self::new(ErrorKind::Forbidden, message)
    }

    pub fn not_found(message: impl Into<String>) -> Rejection {
        Self::new(ErrorKind::NotFound, message)
    }

    /// Logs the cause and hides it from the caller.
    pub fn upstream(cause: impl fmt::Display) -> Rejection {
        log::error!("Upstream failure: {}", cause);
        Self::new(ErrorKind::Upstream, "Internal server error")
    }
}

pub fn success<T: Serialize>(data: T) -> warp::reply::Json {
    warp::reply::json(&serde_json::json!({
        "success": true,
        "data": data,
    }))
}

pub fn success_message(message: &str) -> warp::reply::Json {
    warp::reply::json(&serde_json::json!({
        "success": true,
        "message": message,
    }))
}

fn failure(code: StatusCode, message: &str) -> warp::reply::WithStatus<warp::reply::Json> {
    warp::reply::with_status(
        warp::reply::json(&serde_json::json!({
            "success": false,
            "error": message,
        })),
        code,
    )
}

pub async fn handle_rejection(err: Rejection) -> Result<impl warp::Reply, std::convert::Infallible> {
    let (code, message) = if let Some(e) = err.find::<ApiRejection>() {
        log::info!("Api rejection: {}", e);
        (e.kind.status(), e.message.clone())
    } else if err.find::<warp::reject::MissingCookie>().is_some() {
        (StatusCode::UNAUTHORIZED, "Not authenticated".to_string())
    } else if err.is_not_found() || err.find::<warp::reject::MethodNotAllowed>().is_some() {
        log::info!("Not Found error");
        (StatusCode::NOT_FOUND, "Resource not found".to_string())
    } else if let Some(e) = err.find::<warp::body::BodyDeserializeError>() {
        log::info!("Body deserialization error: {}", e);
        (StatusCode::BAD_REQUEST, clean_error_message(&e.to_string()))
    } else if err.find::<warp::reject::UnsupportedMediaType>().is_some()
        || err.find::<warp::reject::InvalidQuery>().is_some()
        || err.find::<warp::reject::LengthRequired>().is_some()
    {
        (StatusCode::BAD_REQUEST, "Invalid request body".to_string())
    } else {
        log::error!("Unhandled rejection: {:?}", err);
        (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
    };

    log::info!("Sending error response: {} - {}", code.as_u16(), message);

    Ok(failure(code, &message))
}

static POSITION_SUFFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r" at line \d+ column \d+").expect("static regex"));

/// Strips serde position details and keeps the part of a deserialization
/// error a caller can act on (e.g. `missing field `title``).
pub fn clean_error_message(message: &str) -> String {
    let cleaned = POSITION_SUFFIX.replace_all(message, "").into_owned();

    let cleaned = cleaned
        .strip_prefix("Request body deserialize error: ")
        .map(str::to_string)
        .unwrap_or(cleaned);

    if cleaned.trim().is_empty() {
        "Invalid request body".to_string()
    } else {
        cleaned
    }
}
