use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Errors surfaced by the export server and import client.
///
/// Authentication failures map to 401, quota to 403, unknown resources to
/// 404, and malformed requests to 400.
#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("{0} has expired")]
    Expired(String),

    #[error("download limit reached")]
    Quota,

    #[error("no tokens available")]
    Exhausted,

    #[error("{0} not found")]
    NotFound(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Core(#[from] dse_core::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
}

impl TransportError {
    fn status(&self) -> StatusCode {
        match self {
            TransportError::Auth(_) | TransportError::Expired(_) => StatusCode::UNAUTHORIZED,
            TransportError::Quota | TransportError::Exhausted => StatusCode::FORBIDDEN,
            TransportError::NotFound(_) => StatusCode::NOT_FOUND,
            TransportError::Protocol(_) => StatusCode::BAD_REQUEST,
            TransportError::Core(inner) => match inner {
                dse_core::Error::Auth(_) => StatusCode::UNAUTHORIZED,
                dse_core::Error::Expired(_) => StatusCode::UNAUTHORIZED,
                dse_core::Error::Quota => StatusCode::FORBIDDEN,
                dse_core::Error::NotFound { .. } => StatusCode::NOT_FOUND,
                dse_core::Error::Protocol(_) => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            TransportError::Io(_) | TransportError::Http(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for TransportError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("internal error: {self:#}");
            return (status, Json(json!({ "error": "internal server error" }))).into_response();
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(
            TransportError::Auth("bad password".into()).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(TransportError::Quota.status(), StatusCode::FORBIDDEN);
        assert_eq!(TransportError::Exhausted.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            TransportError::NotFound("bundle".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            TransportError::Protocol("bad body".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            TransportError::Expired("token".into()).status(),
            StatusCode::UNAUTHORIZED
        );
    }
}
