//! # Errors
//!
//! Tenancy errors are structured values that travel inside `anyhow::Error`,
//! the same way every boundary in this workspace returns `anyhow::Result`.
//!
//! A `TenancyError` carries a coarse [`ErrorKind`] plus the backend's own
//! error code, which is enough to decide between retrying, stopping and
//! staying silent. Adapters decide how their failures map onto kinds.

use std::fmt;

use anyhow::Error as AnyError;

/// A convenience result type for tenancy APIs.
pub type TenancyResult<T> = std::result::Result<T, AnyError>;

/// Postgres `insufficient_privilege`.
pub const PERMISSION_DENIED_CODE: &str = "42501";

/// PostgREST codes for a rejected or expired JWT.
pub const JWT_REJECTED_CODES: &[&str] = &["PGRST301", "PGRST302", "PGRST303"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    BadRequest,
    NotAuthenticated,
    Forbidden,
    NotFound,
    Timeout,
    /// Superseded or cancelled work. Never surfaced as a user-facing error.
    Aborted,
    GeneralError,
    BadGateway,
    Unavailable,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::BadRequest => "bad-request",
            ErrorKind::NotAuthenticated => "not-authenticated",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::NotFound => "not-found",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Aborted => "aborted",
            ErrorKind::GeneralError => "general-error",
            ErrorKind::BadGateway => "bad-gateway",
            ErrorKind::Unavailable => "unavailable",
        }
    }

    /// Kinds that usually clear up on their own.
    pub fn is_transient(&self) -> bool {
        matches!(self, ErrorKind::Unavailable | ErrorKind::Timeout | ErrorKind::BadGateway)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A structured tenancy error that can live inside `anyhow::Error`.
///
/// `code` carries the backend's own error code when there is one
/// (e.g. a Postgres SQLSTATE or a PostgREST code), which is what the
/// retry policy inspects alongside `kind`.
#[derive(Debug)]
pub struct TenancyError {
    pub kind: ErrorKind,
    pub message: String,
    pub code: Option<String>,
    pub source: Option<AnyError>,
}

impl TenancyError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            code: None,
            source: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_source(mut self, source: AnyError) -> Self {
        self.source = Some(source);
        self
    }

    /// Convert into `anyhow::Error` so it flows through `TenancyResult`.
    pub fn into_anyhow(self) -> AnyError {
        AnyError::new(self)
    }

    /// Downcast an `anyhow::Error` to a `TenancyError` if possible.
    pub fn from_anyhow(err: &AnyError) -> Option<&TenancyError> {
        err.downcast_ref::<TenancyError>()
    }

    /// Turn any error into a TenancyError:
    /// - if it's already a TenancyError, keep it (lossless)
    /// - otherwise wrap as GeneralError
    pub fn normalize(err: AnyError) -> TenancyError {
        match err.downcast::<TenancyError>() {
            Ok(e) => e,
            Err(other) => TenancyError::new(ErrorKind::GeneralError, other.to_string()).with_source(other),
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.kind == ErrorKind::Aborted
    }

    /// True for failures that retrying cannot fix: rejected credentials,
    /// a JWT marker in the message, or a permission-denied code.
    pub fn is_auth_failure(&self) -> bool {
        if matches!(self.kind, ErrorKind::NotAuthenticated | ErrorKind::Forbidden) {
            return true;
        }
        if let Some(code) = self.code.as_deref() {
            if code == PERMISSION_DENIED_CODE || JWT_REJECTED_CODES.contains(&code) {
                return true;
            }
        }
        let lower = self.message.to_lowercase();
        lower.contains("jwt") || lower.contains("permission denied")
    }

    pub fn is_retryable(&self) -> bool {
        !self.is_aborted() && !self.is_auth_failure()
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadRequest, msg)
    }
    pub fn not_authenticated(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotAuthenticated, msg)
    }
    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Forbidden, msg)
    }
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, msg)
    }
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, msg)
    }
    pub fn aborted(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Aborted, msg)
    }
    pub fn general_error(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::GeneralError, msg)
    }
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unavailable, msg)
    }
}

impl fmt::Display for TenancyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{}: {} [{}]", self.kind, self.message, code),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for TenancyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// Convenience helper for "bail with TenancyError".
#[macro_export]
macro_rules! bail_tenancy {
    ($ctor:ident, $msg:expr) => {
        return Err($crate::errors::TenancyError::$ctor($msg).into_anyhow());
    };
    ($ctor:ident, $fmt:expr, $($arg:tt)*) => {
        return Err($crate::errors::TenancyError::$ctor(format!($fmt, $($arg)*)).into_anyhow());
    };
}
