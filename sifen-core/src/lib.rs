//! Rust toolkit for Paraguay's SIFEN e-invoicing web services (certificate loading,
//! XML signing, QR embedding, packaging, submission and lookups).
//!
//! # Examples
//! ```rust
//! use sifen_core::config::{Config, Environment};
//!
//! let config = Config::new(Environment::Test);
//! assert!(config.endpoint(sifen_core::config::Service::BatchSubmission).ends_with("/recibe-lote"));
//! ```
pub mod api;
pub mod cdc;
pub mod certificate;
pub mod config;
pub mod document;
pub mod hash;
pub mod pipeline;
pub mod query;
pub mod response;

use serde::Serialize;
use thiserror::Error;

/// Legacy result code for a document without the element to sign.
pub const NODE_NOT_FOUND_CODE: &str = "10001";
/// Legacy result code for every other pipeline failure.
pub const PIPELINE_FAILURE_CODE: &str = "10002";

/// Top-level error wrapper for core operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Certificate(#[from] certificate::CertificateError),
    #[error(transparent)]
    Signing(#[from] document::SigningError),
    #[error(transparent)]
    Qr(#[from] document::QrError),
    #[error(transparent)]
    Package(#[from] document::PackageError),
    #[error(transparent)]
    Transport(#[from] api::TransportError),
    #[error(transparent)]
    Response(#[from] response::ResponseError),
    #[error(transparent)]
    Query(#[from] query::QueryError),
    #[error(transparent)]
    Cdc(#[from] cdc::CdcError),
}

/// Failure classes callers act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    NodeNotFound,
    CertificateLoadFailure,
    KeyExtractionFailure,
    SigningFailure,
    InvalidInput,
    TransportFailure,
    HttpError { status: u16 },
    ResponseParseFailure,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        use certificate::CertificateError;
        use document::{PackageError, QrError, SigningError};

        match self {
            Error::Certificate(CertificateError::KeyExtraction { .. }) => {
                ErrorKind::KeyExtractionFailure
            }
            Error::Certificate(_) => ErrorKind::CertificateLoadFailure,
            Error::Signing(SigningError::NodeNotFound { .. }) => ErrorKind::NodeNotFound,
            Error::Signing(SigningError::MissingId { .. }) => ErrorKind::InvalidInput,
            Error::Signing(_) => ErrorKind::SigningFailure,
            Error::Qr(QrError::Xml(_)) => ErrorKind::SigningFailure,
            Error::Qr(_) => ErrorKind::InvalidInput,
            Error::Package(PackageError::Empty) => ErrorKind::InvalidInput,
            Error::Package(_) => ErrorKind::SigningFailure,
            Error::Transport(api::TransportError::Http { status, .. }) => {
                ErrorKind::HttpError { status: *status }
            }
            Error::Transport(api::TransportError::Identity(_)) => ErrorKind::CertificateLoadFailure,
            Error::Transport(_) => ErrorKind::TransportFailure,
            Error::Response(_) => ErrorKind::ResponseParseFailure,
            Error::Query(_) | Error::Cdc(_) => ErrorKind::InvalidInput,
        }
    }

    /// Transport failures and 5xx responses may succeed when retried unchanged.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Transport(err) => err.is_retryable(),
            _ => false,
        }
    }

    pub fn result_code(&self) -> &'static str {
        match self.kind() {
            ErrorKind::NodeNotFound => NODE_NOT_FOUND_CODE,
            _ => PIPELINE_FAILURE_CODE,
        }
    }

    /// Raw response body for HTTP and parse failures.
    pub fn raw_response(&self) -> Option<&str> {
        match self {
            Error::Transport(err) => err.body(),
            Error::Response(err) => Some(err.raw()),
            _ => None,
        }
    }
}
