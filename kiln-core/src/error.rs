use std::fmt;
use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Which request constraint a [`ClientError`] reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientErrorKind {
    UnsupportedFormat,
    PayloadTooLarge,
    OutOfRange,
    Empty,
    TooLong,
    InvalidChoice,
    Missing,
    Malformed,
}

impl fmt::Display for ClientErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::UnsupportedFormat => "unsupported_format",
            Self::PayloadTooLarge => "payload_too_large",
            Self::OutOfRange => "out_of_range",
            Self::Empty => "empty",
            Self::TooLong => "too_long",
            Self::InvalidChoice => "invalid_choice",
            Self::Missing => "missing",
            Self::Malformed => "malformed",
        };
        f.write_str(name)
    }
}

/// A request that violates one of the service's documented constraints.
///
/// `detail` is safe to hand back to the caller verbatim: it names the field
/// and the allowed range or set, nothing about server internals.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{detail}")]
pub struct ClientError {
    pub kind: ClientErrorKind,
    pub field: &'static str,
    pub detail: String,
}

impl ClientError {
    pub fn new(kind: ClientErrorKind, field: &'static str, detail: impl Into<String>) -> Self {
        Self {
            kind,
            field,
            detail: detail.into(),
        }
    }

    pub fn malformed(field: &'static str, detail: impl Into<String>) -> Self {
        Self::new(ClientErrorKind::Malformed, field, detail)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("{0} not initialized, call initialize() first")]
    NotInitialized(String),
    #[error("{0} has been stopped")]
    Stopped(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("hub authentication failed: {0}")]
    Hub(#[from] hf_hub::api::tokio::ApiError),
    #[error("inference failed: {0:#}")]
    Inference(anyhow::Error),
    #[error("generation timed out after {0:?}")]
    Timeout(Duration),
    #[error("inference pool is closed")]
    PoolClosed,
    #[error("inference task panicked or was cancelled: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl Error {
    /// True for errors caused by the request rather than the server.
    pub fn is_client(&self) -> bool {
        matches!(self, Self::Client(_))
    }

    pub fn as_client(&self) -> Option<&ClientError> {
        match self {
            Self::Client(err) => Some(err),
            _ => None,
        }
    }
}
