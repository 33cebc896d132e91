use sqlx::Error as SqlxError;
use tracing::error;

/// Error category, mirroring the RPC status codes the frontend maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed input (bad port, expired timestamp ordering, ...).
    InvalidArgument,
    /// Unknown or expired join token.
    Unauthenticated,
    /// Unknown node/request/operation id.
    NotFound,
    /// State-machine violation (re-resolving a join request, completing
    /// a terminal operation with conflicting data).
    FailedPrecondition,
    /// Explicit id collision.
    AlreadyExists,
    /// Watcher queue overflow.
    ResourceExhausted,
    /// Agent dispatch timed out.
    DeadlineExceeded,
    /// Storage failure or broken invariant.
    Internal,
}

impl ErrorKind {
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::Unauthenticated => "unauthenticated",
            ErrorKind::NotFound => "not_found",
            ErrorKind::FailedPrecondition => "failed_precondition",
            ErrorKind::AlreadyExists => "already_exists",
            ErrorKind::ResourceExhausted => "resource_exhausted",
            ErrorKind::DeadlineExceeded => "deadline_exceeded",
            ErrorKind::Internal => "internal",
        }
    }
}

/// Application error type for service operations.
///
/// Carries a human-readable message suitable for display without
/// further lookup, alongside the structured kind.
#[derive(Debug)]
pub struct AppError {
    pub kind: ErrorKind,
    pub message: String,
}

pub type ApiResult<T> = std::result::Result<T, AppError>;

const DB_FAILURE_MESSAGE: &str = "storage temporarily unavailable";

impl AppError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::InvalidArgument,
            message: msg.into(),
        }
    }

    pub fn unauthenticated(msg: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Unauthenticated,
            message: msg.into(),
        }
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::NotFound,
            message: msg.into(),
        }
    }

    pub fn failed_precondition(msg: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::FailedPrecondition,
            message: msg.into(),
        }
    }

    pub fn already_exists(msg: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::AlreadyExists,
            message: msg.into(),
        }
    }

    pub fn resource_exhausted(msg: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::ResourceExhausted,
            message: msg.into(),
        }
    }

    pub fn deadline_exceeded(msg: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::DeadlineExceeded,
            message: msg.into(),
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Internal,
            message: msg.into(),
        }
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.code(), self.message)
    }
}

impl std::error::Error for AppError {}

fn map_sqlx_error(err: &SqlxError) -> Option<AppError> {
    match err {
        SqlxError::RowNotFound => Some(AppError::not_found("resource not found")),
        SqlxError::PoolTimedOut | SqlxError::PoolClosed | SqlxError::Io(_) => {
            Some(AppError::internal(DB_FAILURE_MESSAGE))
        }
        _ => None,
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        if let Some(mapped) = err
            .chain()
            .find_map(|cause| cause.downcast_ref::<SqlxError>())
            .and_then(map_sqlx_error)
        {
            crate::telemetry::record_internal_error(&err);
            error!(?err, "internal error");
            return mapped;
        }

        crate::telemetry::record_internal_error(&err);
        error!(?err, "internal error");
        AppError::internal("internal error")
    }
}

impl From<SqlxError> for AppError {
    fn from(err: SqlxError) -> Self {
        AppError::from(anyhow::Error::from(err))
    }
}
