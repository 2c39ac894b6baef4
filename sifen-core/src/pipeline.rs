//! End-to-end flows: sign, embed the QR, package, submit and read the acknowledgement.
use crate::{
    Error,
    api::{TransportClient, TransportOptions},
    certificate::{CertificateHandle, CertificateLoader, CertificateSource, CertificateStore, MemoryStore},
    config::{Config, Service},
    document::{
        DocumentKind, EnvelopeKind, PreparedDocument, QrEmbedder, QrHashScope, SubmissionEnvelope,
        XmlSigner, package, request_id_at, verify_signed_document,
    },
    query::{QueryRequest, QueryResponse},
    response::parse_acknowledgement,
};
use chrono::Local;
use serde::Serialize;
use std::fmt;
use tracing::{debug, info};
use zeroize::Zeroizing;

/// Input of one signing or submission run.
#[derive(Clone)]
pub struct SigningRequest {
    document: String,
    certificate: CertificateSource,
    password: Zeroizing<String>,
    kind: DocumentKind,
    envelope: Option<EnvelopeKind>,
    endpoint_url: Option<String>,
    qr_base_url: Option<String>,
}

impl fmt::Debug for SigningRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningRequest")
            .field("document_len", &self.document.len())
            .field("certificate", &self.certificate)
            .field("password", &"<redacted>")
            .field("kind", &self.kind)
            .field("envelope", &self.envelope)
            .field("endpoint_url", &self.endpoint_url)
            .field("qr_base_url", &self.qr_base_url)
            .finish()
    }
}

impl SigningRequest {
    pub fn new(
        document: impl Into<String>,
        certificate: impl Into<CertificateSource>,
        password: impl Into<String>,
        kind: DocumentKind,
    ) -> Self {
        Self {
            document: document.into(),
            certificate: certificate.into(),
            password: Zeroizing::new(password.into()),
            kind,
            envelope: None,
            endpoint_url: None,
            qr_base_url: None,
        }
    }

    /// Sends invoices through the synchronous single-document service instead of a batch.
    pub fn with_envelope(mut self, envelope: EnvelopeKind) -> Self {
        self.envelope = Some(envelope);
        self
    }

    pub fn with_endpoint_url(mut self, url: impl Into<String>) -> Self {
        self.endpoint_url = Some(url.into());
        self
    }

    pub fn with_qr_base_url(mut self, url: impl Into<String>) -> Self {
        self.qr_base_url = Some(url.into());
        self
    }

    pub fn kind(&self) -> DocumentKind {
        self.kind
    }

    pub fn envelope(&self) -> EnvelopeKind {
        self.envelope.unwrap_or_else(|| self.kind.into())
    }
}

/// Certificate metadata reported alongside a signed document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CertificateSummary {
    pub subject: String,
    pub serial_number: String,
    pub thumbprint: String,
    pub profile: String,
}

impl From<&CertificateHandle> for CertificateSummary {
    fn from(handle: &CertificateHandle) -> Self {
        Self {
            subject: handle.subject().to_string(),
            serial_number: handle.serial_number().to_string(),
            thumbprint: handle.thumbprint().to_string(),
            profile: handle.profile().to_string(),
        }
    }
}

/// Everything up to, but excluding, the network round trip.
#[derive(Debug, Clone, Serialize)]
pub struct PreparedSubmission {
    pub endpoint: String,
    pub reference_id: String,
    pub digest_value: String,
    pub qr_url: Option<String>,
    pub signed_document: String,
    pub envelope: SubmissionEnvelope,
    pub certificate: CertificateSummary,
}

/// Outcome of a submission accepted for processing by the authority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmissionResult {
    pub result_code: String,
    pub result_message: String,
    pub qr_url: Option<String>,
    pub batch_protocol_id: Option<String>,
    pub signed_document: String,
    pub raw_response: String,
}

/// Client for the SIFEN web services.
///
/// # Examples
/// ```rust,no_run
/// use sifen_core::config::Config;
/// use sifen_core::document::DocumentKind;
/// use sifen_core::pipeline::{SifenClient, SigningRequest};
///
/// # async fn run() -> Result<(), sifen_core::Error> {
/// let client = SifenClient::new(Config::default());
/// let xml = std::fs::read_to_string("factura.xml").expect("document");
/// let request = SigningRequest::new(xml, std::path::PathBuf::from("firma.p12"), "secret", DocumentKind::Invoice);
/// let result = client.submit(&request).await?;
/// println!("{} {}", result.result_code, result.result_message);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct SifenClient<S = MemoryStore> {
    config: Config,
    loader: CertificateLoader<S>,
    qr_hash_scope: QrHashScope,
}

impl SifenClient<MemoryStore> {
    pub fn new(config: Config) -> Self {
        Self::with_loader(config, CertificateLoader::new())
    }
}

impl<S: CertificateStore> SifenClient<S> {
    pub fn with_loader(config: Config, loader: CertificateLoader<S>) -> Self {
        Self {
            config,
            loader,
            qr_hash_scope: QrHashScope::default(),
        }
    }

    pub fn with_qr_hash_scope(mut self, scope: QrHashScope) -> Self {
        self.qr_hash_scope = scope;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn loader(&self) -> &CertificateLoader<S> {
        &self.loader
    }

    fn endpoint_for(&self, request: &SigningRequest) -> String {
        if let Some(url) = &request.endpoint_url {
            return url.clone();
        }
        let service = match request.envelope() {
            EnvelopeKind::Batch => Service::BatchSubmission,
            EnvelopeKind::Document => Service::DocumentSubmission,
            EnvelopeKind::Event => Service::Event,
        };
        self.config.endpoint(service)
    }

    /// Signs, embeds the QR URL, verifies and packages the document.
    ///
    /// The target element is located before the certificate is touched, so a document
    /// without it fails with `NodeNotFound` and no store access.
    pub fn prepare_submission(&self, request: &SigningRequest) -> Result<PreparedSubmission, Error> {
        let kind = request.kind;
        let prepared = PreparedDocument::parse(&request.document, kind.target_element())?;
        debug!(element = kind.target_element(), id = prepared.target_id(), "target located");

        let bundle = request.certificate.read()?;
        let certificate = self.loader.load(&bundle, &request.password)?;
        let mut signed = XmlSigner::new(&certificate).sign_prepared(prepared)?;
        let digest_value = signed.artifact().digest_value().to_string();
        let reference_id = signed.artifact().reference_id().to_string();

        let qr_url = if kind.expects_qr() {
            let qr_base = request
                .qr_base_url
                .as_deref()
                .unwrap_or_else(|| self.config.qr_base_url());
            let digest_hex = signed.artifact().digest_value_hex();
            let payloads = QrEmbedder::new(qr_base)
                .with_hash_scope(self.qr_hash_scope)
                .embed(signed.document_mut(), &digest_hex)?;
            payloads.first().map(|payload| payload.final_url().to_string())
        } else {
            None
        };

        let signed_document = signed.to_xml();
        verify_signed_document(&signed_document)?;

        let request_id = request_id_at(Local::now());
        let envelope = package(&signed_document, request.envelope(), &request_id)?;
        let endpoint = self.endpoint_for(request);
        debug!(%endpoint, request_id, bytes = envelope.body().len(), "submission prepared");

        Ok(PreparedSubmission {
            endpoint,
            reference_id,
            digest_value,
            qr_url,
            signed_document,
            envelope,
            certificate: CertificateSummary::from(&certificate),
        })
    }

    /// Runs [`Self::prepare_submission`] and posts the envelope.
    pub async fn submit(&self, request: &SigningRequest) -> Result<SubmissionResult, Error> {
        let prepared = self.prepare_submission(request)?;
        let bundle = request.certificate.read()?;
        let transport = TransportClient::with_pkcs12(
            &bundle,
            &request.password,
            &TransportOptions::from(&self.config),
        )?;
        let raw_response = transport
            .send(&prepared.endpoint, prepared.envelope.body())
            .await?;
        let ack = parse_acknowledgement(&raw_response)?;
        info!(
            reference = %prepared.reference_id,
            result_code = %ack.result_code,
            batch_protocol = ack.batch_protocol_id.as_deref().unwrap_or("-"),
            "submission acknowledged"
        );

        Ok(SubmissionResult {
            result_code: ack.result_code,
            result_message: ack.result_message,
            qr_url: prepared.qr_url,
            batch_protocol_id: ack.batch_protocol_id,
            signed_document: prepared.signed_document,
            raw_response,
        })
    }

    /// Posts a lookup authenticated with the given client certificate.
    pub async fn query(
        &self,
        request: &QueryRequest,
        certificate: &CertificateSource,
        password: &str,
    ) -> Result<QueryResponse, Error> {
        let bundle = certificate.read()?;
        let transport =
            TransportClient::with_pkcs12(&bundle, password, &TransportOptions::from(&self.config))?;
        let endpoint = self.config.endpoint(request.kind().service());
        debug!(%endpoint, kind = ?request.kind(), "sending lookup");
        let raw_response = transport.send(&endpoint, &request.envelope()).await?;
        let response = QueryResponse::parse(request, raw_response);
        info!(
            kind = ?request.kind(),
            result_code = response.result_code.as_deref().unwrap_or("-"),
            "lookup answered"
        );
        Ok(response)
    }
}
