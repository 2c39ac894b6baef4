use super::DocumentKind;
use super::xml::constants::{
    BATCH_ENVELOPE_TEMPLATE, DOCUMENT_ENVELOPE_TEMPLATE, EVENT_ENVELOPE_TEMPLATE, PAYLOAD_SLOT,
    REQUEST_ID_SLOT,
};
use base64ct::{Base64, Encoding};
use chrono::{DateTime, TimeZone};
use quick_xml::escape::escape;
use serde::Serialize;
use std::io::{Cursor, Read, Write};
use thiserror::Error;
use tracing::debug;
use zip::{CompressionMethod, ZipArchive, ZipWriter, write::SimpleFileOptions};

/// Name of the single entry inside a batch archive.
pub const ARCHIVE_ENTRY: &str = "compressed.txt";

#[derive(Debug, Error)]
pub enum PackageError {
    #[error("document to package is empty")]
    Empty,
    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),
    #[error("archive I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid base64 payload: {0}")]
    Base64(String),
    #[error("archive must hold exactly one entry, found {0}")]
    EntryCount(usize),
}

/// SOAP body flavour used for a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EnvelopeKind {
    /// `rEnvioLote`: one zipped, base64 encoded document.
    Batch,
    /// `rEnviDe`: one document sent inline to the synchronous service.
    Document,
    /// `rEnviEventoDe`: one event sent inline.
    Event,
}

impl EnvelopeKind {
    fn template(&self) -> &'static str {
        match self {
            EnvelopeKind::Batch => BATCH_ENVELOPE_TEMPLATE,
            EnvelopeKind::Document => DOCUMENT_ENVELOPE_TEMPLATE,
            EnvelopeKind::Event => EVENT_ENVELOPE_TEMPLATE,
        }
    }

    pub fn compresses(&self) -> bool {
        matches!(self, EnvelopeKind::Batch)
    }
}

impl From<DocumentKind> for EnvelopeKind {
    fn from(kind: DocumentKind) -> Self {
        match kind {
            DocumentKind::Invoice => EnvelopeKind::Batch,
            DocumentKind::Event => EnvelopeKind::Event,
        }
    }
}

/// A request body ready for the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmissionEnvelope {
    kind: EnvelopeKind,
    request_id: String,
    payload: String,
    body: String,
}

impl SubmissionEnvelope {
    pub fn kind(&self) -> EnvelopeKind {
        self.kind
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Text placed inside the envelope: the base64 archive or the signed document itself.
    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn into_body(self) -> String {
        self.body
    }
}

/// Zips `text` as [`ARCHIVE_ENTRY`] and base64-encodes the archive.
pub fn compress(text: &str) -> Result<String, PackageError> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    writer.start_file(ARCHIVE_ENTRY, options)?;
    writer.write_all(text.as_bytes())?;
    let archive = writer.finish()?.into_inner();
    Ok(Base64::encode_string(&archive))
}

/// Inverse of [`compress`].
pub fn decompress(payload: &str) -> Result<String, PackageError> {
    let bytes = Base64::decode_vec(payload.trim())
        .map_err(|e| PackageError::Base64(e.to_string()))?;
    let mut archive = ZipArchive::new(Cursor::new(bytes))?;
    if archive.len() != 1 {
        return Err(PackageError::EntryCount(archive.len()));
    }
    let mut entry = archive.by_index(0)?;
    let mut text = String::new();
    entry.read_to_string(&mut text)?;
    Ok(text)
}

/// Payload for `signed` as the given envelope expects it.
pub fn payload_for(signed: &str, kind: EnvelopeKind) -> Result<String, PackageError> {
    if signed.trim().is_empty() {
        return Err(PackageError::Empty);
    }
    if kind.compresses() {
        compress(signed)
    } else {
        Ok(signed.to_string())
    }
}

/// Wraps `payload` in the envelope template for `kind`.
pub fn wrap(kind: EnvelopeKind, request_id: &str, payload: &str) -> String {
    kind.template()
        .replace(REQUEST_ID_SLOT, &escape(request_id))
        .replace(PAYLOAD_SLOT, payload)
}

/// Builds the submission envelope for a signed document.
pub fn package(
    signed: &str,
    kind: impl Into<EnvelopeKind>,
    request_id: &str,
) -> Result<SubmissionEnvelope, PackageError> {
    let kind = kind.into();
    let payload = payload_for(signed, kind)?;
    let body = wrap(kind, request_id, &payload);
    debug!(?kind, request_id, payload_len = payload.len(), "envelope built");
    Ok(SubmissionEnvelope {
        kind,
        request_id: request_id.to_string(),
        payload,
        body,
    })
}

/// Request identifier: local timestamp to the second plus two sub-second digits.
pub fn request_id_at<Tz: TimeZone>(time: DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    // a leap second reports 1000..=1999 ms
    let centis = (time.timestamp_subsec_millis() / 10).min(99);
    format!("{}{:02}", time.format("%Y%m%d%H%M%S"), centis)
}
