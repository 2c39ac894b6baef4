//! Electronic documents: preparation, signing, QR embedding and packaging.
pub mod package;
pub mod qr;
pub mod sign;
pub mod xml;

pub use package::{EnvelopeKind, PackageError, SubmissionEnvelope, package, request_id_at};
pub use qr::{QrEmbedder, QrError, QrHashScope, QrPayload};
pub use sign::{
    PreparedDocument, SignatureArtifact, SignedDocument, SigningError, VerifiedSignature,
    XmlSigner, verify_signed_document,
};

use crate::config::Service;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

/// Kind of document handed to the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentKind {
    /// Electronic document (`DE`) submitted in a batch.
    Invoice,
    /// Event (`rEve`) such as a cancellation or disagreement.
    Event,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DocumentKindParseError {
    #[error("invalid document kind: {input}")]
    Invalid { input: String },
}

impl FromStr for DocumentKind {
    type Err = DocumentKindParseError;
    fn from_str(kind: &str) -> Result<Self, Self::Err> {
        match kind.trim().to_ascii_lowercase().as_str() {
            "1" | "invoice" | "de" => Ok(DocumentKind::Invoice),
            "2" | "event" | "reve" => Ok(DocumentKind::Event),
            _ => Err(DocumentKindParseError::Invalid {
                input: kind.to_string(),
            }),
        }
    }
}

impl DocumentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentKind::Invoice => "invoice",
            DocumentKind::Event => "event",
        }
    }

    /// Local name of the element that receives the signature.
    pub fn target_element(&self) -> &'static str {
        match self {
            DocumentKind::Invoice => "DE",
            DocumentKind::Event => "rEve",
        }
    }

    pub fn service(&self) -> Service {
        match self {
            DocumentKind::Invoice => Service::BatchSubmission,
            DocumentKind::Event => Service::Event,
        }
    }

    /// Invoices carry a `dCarQR` field that is rewritten after signing.
    pub fn expects_qr(&self) -> bool {
        matches!(self, DocumentKind::Invoice)
    }
}

/// Strips a leading BOM, zero-width spaces and anything before the first `<`.
pub fn normalize_input(raw: &str) -> &str {
    let trimmed = raw.trim_start_matches(['\u{feff}', '\u{200b}']);
    match trimmed.find('<') {
        Some(start) => &trimmed[start..],
        None => trimmed,
    }
}
