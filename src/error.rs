// ===========================================
// shardmesh - PostgreSQL sharding platform
// ===========================================

use thiserror::Error;

/// Stable error kinds surfaced to callers, per the wire error contract
/// `{code, message, details?}`. Variant names double as the `code`.
#[derive(Error, Debug)]
pub enum Error {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("routing stale: {0}")]
    RoutingStale(String),

    #[error("pool exhausted: {0}")]
    PoolExhausted(String),

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("deadline exceeded: {0}")]
    Timeout(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("internal error [{correlation_id}]: {message}")]
    Internal {
        message: String,
        correlation_id: uuid::Uuid,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("metadata store error: {0}")]
    MetadataStore(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("pool build error: {0}")]
    PoolBuild(#[from] deadpool_postgres::BuildError),

    #[error("pool create error: {0}")]
    PoolCreate(#[from] deadpool_postgres::CreatePoolError),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Stable string code for the wire `{code, message}` envelope.
    pub fn code(&self) -> &'static str {
        match self {
            Error::BadRequest(_) => "bad_request",
            Error::NotFound(_) => "not_found",
            Error::RoutingStale(_) => "routing_stale",
            Error::PoolExhausted(_) => "pool_exhausted",
            Error::BackendUnavailable(_) => "backend_unavailable",
            Error::Timeout(_) => "timeout",
            Error::Conflict(_) => "conflict",
            Error::Internal { .. } => "internal",
            Error::Config(_) => "config",
            Error::MetadataStore(_) => "metadata_store",
            Error::Io(_) => "internal",
            Error::Postgres(_) => "backend_unavailable",
            Error::PoolBuild(_) | Error::PoolCreate(_) => "pool_exhausted",
        }
    }

    /// Build an `internal` error, logging with a fresh correlation id so it
    /// can be traced through the log stream without panicking the caller.
    pub fn internal(message: impl Into<String>) -> Self {
        let correlation_id = uuid::Uuid::new_v4();
        let message = message.into();
        tracing::error!(%correlation_id, %message, "internal invariant violation");
        Error::Internal { message, correlation_id }
    }
}

/// Trace-and-pass-through extension, mirroring the teacher's `ResultExt`.
pub trait ResultExt<T> {
    fn trace_err(self) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn trace_err(self) -> Result<T> {
        if let Err(ref e) = self {
            tracing::error!(error = %e, code = e.code(), "operation failed");
        }
        self
    }
}

impl axum::response::IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;
        use axum::Json;

        let status = match &self {
            Error::BadRequest(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::RoutingStale(_) => StatusCode::CONFLICT,
            Error::PoolExhausted(_) | Error::PoolBuild(_) | Error::PoolCreate(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Error::BackendUnavailable(_) | Error::Postgres(_) => StatusCode::BAD_GATEWAY,
            Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::Internal { .. } | Error::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Config(_) | Error::MetadataStore(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = serde_json::json!({
            "code": self.code(),
            "message": self.to_string(),
        });

        (status, Json(body)).into_response()
    }
}
