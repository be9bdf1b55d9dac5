// =============================================================================
// Error taxonomy — every operational failure carries a machine-readable kind
// =============================================================================
//
// Kinds:
//   validation     — malformed request, bad enum, out-of-range number
//   auth           — missing/invalid credential, decryption failure
//   not_supported  — venue doesn't support the requested symbol/operation
//   transient      — network timeout, 5xx from a venue
//   risk           — one-sided exposure, rollback failure (mirrored into the
//                    risk ledger by the caller)
//   internal       — programmer errors, unexpected shapes
//
// HTTP responses serialise as `{ "detail": ..., "kind": ... }`.
// =============================================================================

use axum::{http::StatusCode, response::IntoResponse, response::Response, Json};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Kind
// ---------------------------------------------------------------------------

/// Classification of an operational failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Auth,
    NotSupported,
    Transient,
    Risk,
    Internal,
}

impl ErrorKind {
    /// Whether a data-path operation may retry after this failure.
    /// Order-path operations never retry on the strength of this flag alone.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Transient)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Validation => "validation",
            Self::Auth => "auth",
            Self::NotSupported => "not_supported",
            Self::Transient => "transient",
            Self::Risk => "risk",
            Self::Internal => "internal",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// EngineError
// ---------------------------------------------------------------------------

/// The crate-wide operational error: a kind tag plus a human-readable detail.
#[derive(Debug, Clone, Serialize)]
pub struct EngineError {
    pub kind: ErrorKind,
    pub detail: String,
}

pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    pub fn validation(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, detail)
    }

    pub fn auth(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Auth, detail)
    }

    pub fn not_supported(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotSupported, detail)
    }

    pub fn transient(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, detail)
    }

    pub fn risk(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Risk, detail)
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, detail)
    }

    /// Prefix the detail with additional context, keeping the kind.
    pub fn context(self, ctx: &str) -> Self {
        Self {
            kind: self.kind,
            detail: format!("{ctx}: {}", self.detail),
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.kind, self.detail)
    }
}

impl std::error::Error for EngineError {}

impl From<reqwest::Error> for EngineError {
    fn from(e: reqwest::Error) -> Self {
        // Timeouts and connection failures are transient; anything else from
        // the HTTP client layer (body decode, builder misuse) is internal.
        if e.is_timeout() || e.is_connect() || e.is_request() {
            Self::transient(format!("http: {e}"))
        } else {
            Self::internal(format!("http: {e}"))
        }
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        Self::internal(format!("db: {e}"))
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        Self::internal(format!("json: {e}"))
    }
}

// ---------------------------------------------------------------------------
// HTTP mapping
// ---------------------------------------------------------------------------

/// Wire shape for HTTP error bodies.
#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    detail: &'a str,
    kind: ErrorKind,
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = match self.kind {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::Auth => StatusCode::UNAUTHORIZED,
            ErrorKind::NotSupported => StatusCode::NOT_FOUND,
            ErrorKind::Transient => StatusCode::BAD_GATEWAY,
            ErrorKind::Risk => StatusCode::CONFLICT,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorBody {
            detail: &self.detail,
            kind: self.kind,
        };
        (status, Json(body)).into_response()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_serialises_snake_case() {
        assert_eq!(
            serde_json::to_string(&ErrorKind::NotSupported).unwrap(),
            "\"not_supported\""
        );
        assert_eq!(
            serde_json::to_string(&ErrorKind::Transient).unwrap(),
            "\"transient\""
        );
    }

    #[test]
    fn only_transient_is_retryable() {
        assert!(ErrorKind::Transient.is_retryable());
        assert!(!ErrorKind::Auth.is_retryable());
        assert!(!ErrorKind::Validation.is_retryable());
        assert!(!ErrorKind::Risk.is_retryable());
    }

    #[test]
    fn context_keeps_kind() {
        let e = EngineError::auth("missing credential").context("open BTCUSDT");
        assert_eq!(e.kind, ErrorKind::Auth);
        assert!(e.detail.starts_with("open BTCUSDT: "));
    }

    #[test]
    fn display_includes_kind_tag() {
        let e = EngineError::risk("rollback failed");
        assert_eq!(format!("{e}"), "[risk] rollback failed");
    }
}
