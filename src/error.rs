use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Error taxonomy for the relay core and supervisor.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("channel {0} not found")]
    ChannelNotFound(u64),

    #[error("channel {0} is inactive")]
    ChannelInactive(u64),

    #[error("proxy already running (pid {0})")]
    AlreadyRunning(i32),

    #[error("proxy is not running")]
    NotRunning,

    #[error("upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    #[error("upstream timed out")]
    UpstreamTimeout,

    #[error("unknown health-check job {0}")]
    JobNotFound(Uuid),

    #[error("graceful stop exceeded {0:?}, escalating to forced kill")]
    ShutdownTimeout(Duration),
}

impl ProxyError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::ChannelNotFound(_) | Self::JobNotFound(_) => StatusCode::NOT_FOUND,
            Self::ChannelInactive(_) => StatusCode::FORBIDDEN,
            Self::AlreadyRunning(_) | Self::NotRunning => StatusCode::CONFLICT,
            Self::UpstreamUnreachable(_) => StatusCode::BAD_GATEWAY,
            Self::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            Self::ShutdownTimeout(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({
            "success": false,
            "error": self.to_string(),
        }));
        (self.status_code(), body).into_response()
    }
}
