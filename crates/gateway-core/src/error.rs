use bytes::Bytes;
use gateway_keypool::FailureClass as KeyReturnClass;
use http::StatusCode;
use serde::Serialize;

/// Whether the orchestrator is allowed to retry the same failed attempt, and
/// if so under what constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    Never,
    OnceDifferentKeyPreByte,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    PrincipalRejected,
    AdmissionTimeout,
    NoKeyAvailable,
    RateLimited,
    Upstream5xx,
    AuthRejected,
    RequestTimeout,
    ClientDisconnect,
    MalformedResponse,
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::PrincipalRejected => "principal_rejected",
            ErrorKind::AdmissionTimeout => "admission_timeout",
            ErrorKind::NoKeyAvailable => "no_key_available",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Upstream5xx => "upstream_5xx",
            ErrorKind::AuthRejected => "auth_rejected",
            ErrorKind::RequestTimeout => "request_timeout",
            ErrorKind::ClientDisconnect => "client_disconnect",
            ErrorKind::MalformedResponse => "malformed_response",
            ErrorKind::Internal => "internal",
        }
    }

    pub fn status_code(self) -> StatusCode {
        match self {
            ErrorKind::PrincipalRejected => StatusCode::UNAUTHORIZED,
            ErrorKind::AdmissionTimeout => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::NoKeyAvailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::Upstream5xx => StatusCode::BAD_GATEWAY,
            ErrorKind::AuthRejected => StatusCode::BAD_GATEWAY,
            ErrorKind::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            // 499 has no `http::StatusCode` constant; constructed from_u16 at
            // the call site that needs the literal, kept here as the nearest
            // named status for anything reusing this method.
            ErrorKind::ClientDisconnect => StatusCode::BAD_REQUEST,
            ErrorKind::MalformedResponse => StatusCode::BAD_GATEWAY,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn retry_policy(self) -> RetryPolicy {
        match self {
            ErrorKind::RateLimited | ErrorKind::Upstream5xx => RetryPolicy::OnceDifferentKeyPreByte,
            _ => RetryPolicy::Never,
        }
    }

    /// Key-return classification for this error; `None` means no lease was
    /// ever held (the error occurred before `KeyPool::acquire`). `retry_after`
    /// is whatever the upstream's `Retry-After`/`x-ratelimit-reset` header
    /// parsed to, if any; it only affects the `RateLimited` variant.
    pub fn key_return_class(self, retry_after: Option<std::time::Duration>) -> Option<KeyReturnClass> {
        match self {
            ErrorKind::RateLimited => Some(KeyReturnClass::RateLimited { retry_after }),
            ErrorKind::Upstream5xx => Some(KeyReturnClass::Upstream5xx),
            ErrorKind::AuthRejected => Some(KeyReturnClass::AuthRejected),
            ErrorKind::RequestTimeout
            | ErrorKind::ClientDisconnect
            | ErrorKind::Internal => Some(KeyReturnClass::TransientClientOrNetwork),
            ErrorKind::MalformedResponse => Some(KeyReturnClass::Upstream5xx),
            ErrorKind::PrincipalRejected | ErrorKind::AdmissionTimeout | ErrorKind::NoKeyAvailable => None,
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error_kind: &'static str,
    message: String,
}

/// Error surfaced from the orchestrator to the HTTP layer. Carries its own
/// status and a pre-rendered JSON body so `gateway-router` never has to know
/// the taxonomy's mapping rules.
#[derive(Debug)]
pub struct GatewayError {
    pub kind: ErrorKind,
    pub status: StatusCode,
    pub body: Bytes,
}

impl GatewayError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        let body = serde_json::to_vec(&ErrorBody {
            error_kind: kind.as_str(),
            message: message.into(),
        })
        .unwrap_or_else(|_| b"{}".to_vec());
        Self {
            kind,
            status: kind.status_code(),
            body: Bytes::from(body),
        }
    }

    pub fn client_disconnect() -> Self {
        let mut err = Self::new(ErrorKind::ClientDisconnect, "client disconnected mid-stream");
        err.status = StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST);
        err
    }
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.kind.as_str(), self.status)
    }
}

impl std::error::Error for GatewayError {}
