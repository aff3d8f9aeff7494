//! Error taxonomy for the plugin execution host.
//!
//! Every failure a request can surface maps to a machine-readable code and
//! an HTTP status. Cold-start failures (extraction, spawn, readiness) are
//! fatal to the request but never to the host process; the gateway turns
//! them into structured JSON error bodies.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use uuid::Uuid;

/// All the ways serving a plugin asset can fail.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HostError {
    /// No packaged archive exists for the plugin (or the requested asset is gone).
    #[error("no archive found for plugin {plugin_id}")]
    NotFound {
        plugin_id: Uuid,
        /// Lookup paths that were attempted, for the error body.
        attempted: Vec<String>,
    },

    /// Malformed plugin ID or a path traversal attempt.
    #[error("{0}")]
    InvalidRequest(String),

    /// The archive could not be downloaded or unpacked.
    #[error("extraction failed: {0}")]
    ExtractionFailed(String),

    /// The port scan exhausted its attempt budget.
    #[error("no free port available for plugin instance")]
    NoPortAvailable,

    /// The static server process died repeatedly before becoming reachable.
    #[error("instance failed to start: {0}")]
    StartupFailed(String),

    /// The instance never answered the readiness poll.
    #[error("instance on port {port} not ready after {attempts} attempts")]
    ReadinessTimeout { port: u16, attempts: u32 },

    /// A cached instance was unreachable even after one cold-start retry.
    #[error("proxy to instance failed: {0}")]
    ProxyFailure(String),

    /// Anything else (I/O on the scratch area, join errors, ...).
    #[error("{0}")]
    Internal(String),
}

impl HostError {
    /// Machine-readable code included in the JSON error body.
    pub fn code(&self) -> &'static str {
        match self {
            HostError::NotFound { .. } => "not_found",
            HostError::InvalidRequest(_) => "invalid_request",
            HostError::ExtractionFailed(_) => "extraction_failed",
            HostError::NoPortAvailable => "no_port_available",
            HostError::StartupFailed(_) => "startup_failed",
            HostError::ReadinessTimeout { .. } => "readiness_timeout",
            HostError::ProxyFailure(_) => "proxy_failure",
            HostError::Internal(_) => "internal",
        }
    }

    /// HTTP status the gateway responds with.
    pub fn status(&self) -> StatusCode {
        match self {
            HostError::NotFound { .. } => StatusCode::NOT_FOUND,
            HostError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            HostError::ExtractionFailed(_)
            | HostError::NoPortAvailable
            | HostError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            HostError::StartupFailed(_)
            | HostError::ReadinessTimeout { .. }
            | HostError::ProxyFailure(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// True for failures the embedding UI may retry (transient cold-start
    /// trouble), false for permanent ones like a missing archive.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            HostError::ReadinessTimeout { .. }
                | HostError::ProxyFailure(_)
                | HostError::StartupFailed(_)
                | HostError::NoPortAvailable
        )
    }
}

impl IntoResponse for HostError {
    fn into_response(self) -> Response {
        let mut body = serde_json::json!({
            "code": self.code(),
            "error": self.to_string(),
            "retryable": self.retryable(),
        });
        if let HostError::NotFound { plugin_id, attempted } = &self {
            body["pluginId"] = serde_json::json!(plugin_id);
            body["attemptedPaths"] = serde_json::json!(attempted);
        }
        (self.status(), Json(body)).into_response()
    }
}
