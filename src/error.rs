// =============================================================================
// Error Taxonomy — stable, matchable error kinds
// =============================================================================
//
// Internal plumbing still returns `anyhow::Result` (the teacher's idiom
// throughout `binance/client.rs`, `strategy.rs`, etc.); at the boundary where
// a tool call or HTTP handler needs to hand a caller something it can branch
// on, that `anyhow::Error` is mapped into one of the kinds below. This is the
// same two-tier shape the teacher uses implicitly — library code bubbles
// `anyhow::Error`, and `api/auth.rs`'s `AuthRejection` is the one place it
// hand-rolls a typed boundary error; this module generalizes that boundary
// to every kind the tool surface and façade need.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    #[error("missing or invalid configuration")]
    Config,
    #[error("exchange rejected credentials")]
    Auth,
    #[error("exchange rate limit reached")]
    RateLimited,
    #[error("symbol not supported by the venue")]
    SymbolUnsupported,
    #[error("insufficient balance for this operation")]
    InsufficientBalance,
    #[error("network or transport failure")]
    Network,
    #[error("trading mode not supported by the venue")]
    ModeUnsupported,
    #[error("strategy input window too short")]
    StrategyInput,
    #[error("internal invariant violated")]
    Invariant,
    #[error("persistence layer unavailable")]
    Storage,
    #[error("unknown tool name")]
    UnknownTool,
    #[error("invalid tool arguments")]
    ToolArgs,
}

impl ErrorKind {
    /// Whether this kind is recoverable inside the adapter (retried with
    /// backoff) rather than surfaced immediately, per spec §7.
    pub fn is_transient(&self) -> bool {
        matches!(self, ErrorKind::RateLimited | ErrorKind::Network)
    }

    fn http_status(&self) -> StatusCode {
        match self {
            ErrorKind::Config | ErrorKind::Invariant | ErrorKind::Storage => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ErrorKind::Auth => StatusCode::UNAUTHORIZED,
            ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::SymbolUnsupported
            | ErrorKind::ModeUnsupported
            | ErrorKind::StrategyInput
            | ErrorKind::UnknownTool
            | ErrorKind::ToolArgs => StatusCode::BAD_REQUEST,
            ErrorKind::InsufficientBalance => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::Network => StatusCode::BAD_GATEWAY,
        }
    }
}

/// A tagged error carrying both the stable kind and a human-readable message.
/// This is the type that crosses the tool-surface and HTTP boundaries.
#[derive(Debug, Clone, Error, Serialize)]
#[error("{kind}: {message}")]
pub struct FleetError {
    pub kind: ErrorKind,
    pub message: String,
}

impl FleetError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<ErrorKind> for FleetError {
    fn from(kind: ErrorKind) -> Self {
        let message = kind.to_string();
        Self { kind, message }
    }
}

/// Adapt an internal `anyhow::Error` (from within a tool handler or adapter
/// call site that didn't already produce a `FleetError`) into `ErrStorage` /
/// `ErrNetwork` as a conservative default — call sites that know better
/// should construct a `FleetError` directly instead of relying on this.
impl From<anyhow::Error> for FleetError {
    fn from(err: anyhow::Error) -> Self {
        FleetError::new(ErrorKind::Network, err.to_string())
    }
}

impl IntoResponse for FleetError {
    fn into_response(self) -> Response {
        let status = self.kind.http_status();
        let body = serde_json::json!({
            "error_kind": self.kind,
            "message": self.message,
        });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_kinds() {
        assert!(ErrorKind::RateLimited.is_transient());
        assert!(ErrorKind::Network.is_transient());
        assert!(!ErrorKind::Auth.is_transient());
    }

    #[test]
    fn from_error_kind_uses_display_message() {
        let e: FleetError = ErrorKind::UnknownTool.into();
        assert_eq!(e.kind, ErrorKind::UnknownTool);
        assert!(e.message.contains("unknown tool"));
    }
}
