use axum::http::header::{CONTENT_TYPE, WWW_AUTHENTICATE};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use std::fmt;
use tracing::{debug, error};

use crate::units::format_bytes;

/// Failures that end a request before the rule's own response is rendered.
#[derive(Debug)]
pub enum DispatchError {
    /// Missing or wrong basic-auth credentials.
    Unauthorised,
    /// Body larger than the rule allows. `observed` is unknown for streamed bodies.
    EntityTooLarge { observed: Option<u64>, limit: u64 },
    /// The request body could not be parsed.
    BadRequest(String),
    Internal(anyhow::Error),
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchError::Unauthorised => write!(f, "Unauthorised"),
            DispatchError::EntityTooLarge {
                observed: Some(observed),
                limit,
            } => write!(
                f,
                "Request entity too large. {} sent exceeds limit of {}",
                format_bytes(*observed),
                format_bytes(*limit)
            ),
            DispatchError::EntityTooLarge { observed: None, limit } => {
                write!(f, "Request entity too large. Body exceeds limit of {}", format_bytes(*limit))
            }
            DispatchError::BadRequest(msg) => write!(f, "{}", msg),
            DispatchError::Internal(e) => write!(f, "{:#}", e),
        }
    }
}

impl std::error::Error for DispatchError {}

impl From<anyhow::Error> for DispatchError {
    fn from(e: anyhow::Error) -> Self {
        DispatchError::Internal(e)
    }
}

impl DispatchError {
    pub fn status(&self) -> StatusCode {
        match self {
            DispatchError::Unauthorised => StatusCode::UNAUTHORIZED,
            DispatchError::EntityTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            DispatchError::BadRequest(_) => StatusCode::BAD_REQUEST,
            DispatchError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Builds the plain text error response. Internal error details are only sent
    /// to the client when `expose_errors` is set.
    pub fn into_http(self, expose_errors: bool) -> Response {
        let status = self.status();
        let body = match &self {
            DispatchError::Internal(e) => {
                error!("Internal Server Error: {:#}", e);
                if expose_errors {
                    format!("{:#}\n", e)
                } else {
                    "internal server error\n".to_string()
                }
            }
            other => {
                debug!(status = status.as_u16(), "request rejected: {}", other);
                format!("{}\n", other)
            }
        };

        let mut response = (status, [(CONTENT_TYPE, "text/plain; charset=utf-8")], body).into_response();
        if matches!(self, DispatchError::Unauthorised) {
            response
                .headers_mut()
                .insert(WWW_AUTHENTICATE, HeaderValue::from_static(r#"Basic realm="httpe""#));
        }
        response
    }
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        self.into_http(false)
    }
}
