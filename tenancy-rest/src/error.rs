use serde::Deserialize;
use tenancy_core::errors::PERMISSION_DENIED_CODE;
use tenancy_core::{ErrorKind, TenancyError};
use thiserror::Error;

/// Result type for HTTP adapter internals
pub type RestResult<T> = Result<T, RestError>;

/// Transport-level failures, converted to [`TenancyError`] at the trait boundary
#[derive(Error, Debug)]
pub enum RestError {
    #[error("Request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("{message}")]
    Api {
        status: u16,
        code: Option<String>,
        message: String,
    },

    #[error("Unexpected response: {0}")]
    Decode(String),

    #[error("Auth session missing!")]
    NoSession,

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl RestError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RestError::Transport(e) if e.is_timeout() => ErrorKind::Timeout,
            RestError::Transport(e) => match e.status() {
                Some(status) => kind_for_status(status.as_u16(), None),
                None => ErrorKind::Unavailable,
            },
            RestError::Api { status, code, .. } => kind_for_status(*status, code.as_deref()),
            RestError::Decode(_) => ErrorKind::GeneralError,
            RestError::NoSession => ErrorKind::NotAuthenticated,
            RestError::Config(_) => ErrorKind::BadRequest,
        }
    }

    pub fn into_anyhow(self) -> anyhow::Error {
        TenancyError::from(self).into_anyhow()
    }
}

impl From<RestError> for TenancyError {
    fn from(err: RestError) -> Self {
        let kind = err.kind();
        match err {
            RestError::Api { code, message, .. } => {
                let mapped = TenancyError::new(kind, message);
                match code {
                    Some(code) => mapped.with_code(code),
                    None => mapped,
                }
            }
            other => {
                let message = other.to_string();
                TenancyError::new(kind, message).with_source(anyhow::Error::new(other))
            }
        }
    }
}

fn kind_for_status(status: u16, code: Option<&str>) -> ErrorKind {
    if code == Some(PERMISSION_DENIED_CODE) {
        return ErrorKind::Forbidden;
    }
    match status {
        401 => ErrorKind::NotAuthenticated,
        403 => ErrorKind::Forbidden,
        500..=599 => ErrorKind::Unavailable,
        _ => ErrorKind::BadRequest,
    }
}

/// Union of the PostgREST and GoTrue error body shapes.
#[derive(Deserialize, Default)]
struct ErrorBody {
    #[serde(default)]
    code: Option<serde_json::Value>,
    #[serde(default)]
    error_code: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Build an [`RestError::Api`] from a non-success response.
pub fn map_error_body(status: u16, body: &str) -> RestError {
    let parsed: ErrorBody = serde_json::from_str(body).unwrap_or_default();

    // PostgREST sends a string code; GoTrue sends the HTTP status as a number
    // and the symbolic code in `error_code`.
    let code = match parsed.code {
        Some(serde_json::Value::String(code)) => Some(code),
        _ => parsed.error_code,
    };
    let message = parsed
        .message
        .or(parsed.msg)
        .or(parsed.error_description)
        .or(parsed.error)
        .filter(|m| !m.trim().is_empty())
        .unwrap_or_else(|| {
            let trimmed = body.trim();
            if trimmed.is_empty() {
                format!("HTTP {status}")
            } else {
                trimmed.to_string()
            }
        });

    RestError::Api { status, code, message }
}
