//! Tagged domain errors with an HTTP status and a JSON body (spec.md §7).

use std::fmt;

use serde::Serialize;

/// A domain error the server core knows how to turn into a response.
///
/// Anything that isn't a `BareError` is folded into `BareError::Unknown`
/// by the server's error funnel (see `server::BareServer::dispatch`).
#[derive(Debug)]
pub enum BareError {
    MissingBareHeader { name: String },
    InvalidBareHeader { detail: String },
    ForbiddenBareHeader { name: String },
    HostNotFound { detail: String },
    ConnectionRefused { detail: String },
    ConnectionReset { detail: String },
    ConnectionTimeout { detail: String },
    ConnectionLimitExceeded,
    UpgradeUnexpected,
    NotFound,
    Unknown { message: String, stack: Option<String> },
}

impl BareError {
    pub fn missing(name: impl Into<String>) -> Self {
        Self::MissingBareHeader { name: name.into() }
    }

    pub fn invalid(detail: impl Into<String>) -> Self {
        Self::InvalidBareHeader { detail: detail.into() }
    }

    pub fn forbidden(name: impl Into<String>) -> Self {
        Self::ForbiddenBareHeader { name: name.into() }
    }

    pub fn unknown(err: &(dyn std::error::Error + 'static)) -> Self {
        Self::Unknown {
            message: err.to_string(),
            stack: None,
        }
    }

    /// HTTP status this error should be surfaced as.
    pub fn status(&self) -> u16 {
        match self {
            Self::MissingBareHeader { .. }
            | Self::InvalidBareHeader { .. }
            | Self::ForbiddenBareHeader { .. } => 400,
            Self::NotFound => 404,
            Self::ConnectionLimitExceeded => 429,
            Self::HostNotFound { .. }
            | Self::ConnectionRefused { .. }
            | Self::ConnectionReset { .. }
            | Self::ConnectionTimeout { .. }
            | Self::UpgradeUnexpected
            | Self::Unknown { .. } => 500,
        }
    }

    /// Stable machine-readable code, matches spec.md §7 kind names.
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingBareHeader { .. } => "MISSING_BARE_HEADER",
            Self::InvalidBareHeader { .. } => "INVALID_BARE_HEADER",
            Self::ForbiddenBareHeader { .. } => "FORBIDDEN_BARE_HEADER",
            Self::HostNotFound { .. } => "HOST_NOT_FOUND",
            Self::ConnectionRefused { .. } => "CONNECTION_REFUSED",
            Self::ConnectionReset { .. } => "CONNECTION_RESET",
            Self::ConnectionTimeout { .. } => "CONNECTION_TIMEOUT",
            Self::ConnectionLimitExceeded => "CONNECTION_LIMIT_EXCEEDED",
            Self::UpgradeUnexpected => "UPGRADE_UNEXPECTED",
            Self::NotFound => "NOT_FOUND",
            Self::Unknown { .. } => "UNKNOWN",
        }
    }

    /// Dotted identifier, e.g. `request.headers.x-bare-host`.
    pub fn id(&self) -> String {
        match self {
            Self::MissingBareHeader { name } => format!("request.headers.{name}"),
            Self::ForbiddenBareHeader { name } => format!("request.headers.{name}"),
            Self::ConnectionLimitExceeded => "error.TooManyConnections".to_string(),
            Self::NotFound => "request.notfound".to_string(),
            other => format!("error.{}", other.code().to_ascii_lowercase()),
        }
    }

    /// Body shape from spec.md §7: `{code, id, message?, stack?}`.
    pub fn body(&self, include_stack: bool) -> BareErrorBody {
        let message = match self {
            Self::MissingBareHeader { name } => Some(format!("Header {name} was not specified")),
            Self::InvalidBareHeader { detail } => Some(detail.clone()),
            Self::ForbiddenBareHeader { name } => Some(format!("Header {name} is forbidden")),
            Self::HostNotFound { detail }
            | Self::ConnectionRefused { detail }
            | Self::ConnectionReset { detail }
            | Self::ConnectionTimeout { detail } => Some(detail.clone()),
            Self::ConnectionLimitExceeded => Some("Too many connections".to_string()),
            Self::UpgradeUnexpected => Some("Remote unexpectedly upgraded".to_string()),
            Self::NotFound => None,
            Self::Unknown { message, .. } => Some(message.clone()),
        };
        let stack = if include_stack {
            match self {
                Self::Unknown { stack, .. } => stack.clone(),
                _ => None,
            }
        } else {
            None
        };
        BareErrorBody {
            code: self.code().to_string(),
            id: self.id(),
            message,
            stack,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct BareErrorBody {
    pub code: String,
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl fmt::Display for BareError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code(), self.body(false).message.unwrap_or_default())
    }
}

impl std::error::Error for BareError {}

impl From<std::io::Error> for BareError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::ConnectionRefused => Self::ConnectionRefused { detail: err.to_string() },
            ErrorKind::ConnectionReset => Self::ConnectionReset { detail: err.to_string() },
            ErrorKind::TimedOut => Self::ConnectionTimeout { detail: err.to_string() },
            ErrorKind::NotFound | ErrorKind::AddrNotAvailable => {
                Self::HostNotFound { detail: err.to_string() }
            }
            _ => Self::Unknown { message: err.to_string(), stack: None },
        }
    }
}

impl From<crate::shutdown::Cancelled> for BareError {
    fn from(_: crate::shutdown::Cancelled) -> Self {
        Self::ConnectionReset { detail: "exchange cancelled".to_string() }
    }
}

pub type BareResult<T> = Result<T, BareError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_header_id_and_status() {
        let e = BareError::missing("x-bare-host");
        assert_eq!(e.status(), 400);
        assert_eq!(e.id(), "request.headers.x-bare-host");
    }

    #[test]
    fn rate_limit_status_and_id() {
        let e = BareError::ConnectionLimitExceeded;
        assert_eq!(e.status(), 429);
        assert_eq!(e.id(), "error.TooManyConnections");
    }

    #[test]
    fn unknown_hides_stack_unless_opted_in() {
        let e = BareError::Unknown { message: "boom".into(), stack: Some("trace".into()) };
        assert_eq!(e.body(false).stack, None);
        assert_eq!(e.body(true).stack, Some("trace".into()));
    }
}
