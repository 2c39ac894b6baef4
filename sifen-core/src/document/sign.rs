use super::normalize_input;
use super::xml::{
    self,
    constants::{
        DS_NS, EXC_C14N_ALGORITHM, RSA_SHA256_ALGORITHM, SHA256_DIGEST_ALGORITHM,
        SIGNATURE_TEMPLATE, SIGNED_INFO_TEMPLATE,
    },
};
use crate::certificate::CertificateHandle;
use crate::hash::{sha256_base64, to_hex};
use base64ct::{Base64, Encoding};
use libxml::tree::{Document, Node};
use openssl::{
    hash::MessageDigest,
    pkey::{PKey, Private},
    sign::{Signer, Verifier},
    x509::X509,
};
use quick_xml::escape::escape;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum SigningError {
    #[error("element <{element}> not found in document")]
    NodeNotFound { element: String },
    #[error("element <{element}> has no Id attribute")]
    MissingId { element: String },
    #[error("Signing error: {0}")]
    SigningError(String),
    #[error("signature verification failed: {0}")]
    Verification(String),
}

/// A parsed document with prior signatures removed and its target element located.
pub struct PreparedDocument {
    doc: Document,
    target: String,
    target_id: String,
    removed_signatures: usize,
}

impl PreparedDocument {
    pub fn parse(raw: &str, target: &str) -> Result<Self, SigningError> {
        let doc = xml::parse(normalize_input(raw)).map_err(SigningError::SigningError)?;

        let existing = xml::elements_named(&doc, "Signature").map_err(SigningError::SigningError)?;
        let removed_signatures = xml::remove_all(existing);
        if removed_signatures > 0 {
            debug!(removed_signatures, "removed existing signatures");
        }

        let targets = xml::elements_named(&doc, target).map_err(SigningError::SigningError)?;
        let node = targets
            .first()
            .ok_or_else(|| SigningError::NodeNotFound {
                element: target.to_string(),
            })?;
        if targets.len() > 1 {
            warn!(target, count = targets.len(), "several target elements; signing the first");
        }
        let target_id = node
            .get_attribute("Id")
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .ok_or_else(|| SigningError::MissingId {
                element: target.to_string(),
            })?;
        let with_id = xml::elements_with_id(&doc, &target_id).map_err(SigningError::SigningError)?;
        if with_id.len() != 1 {
            return Err(SigningError::SigningError(format!(
                "Id '{target_id}' is carried by {} elements",
                with_id.len()
            )));
        }

        Ok(Self {
            doc,
            target: target.to_string(),
            target_id,
            removed_signatures,
        })
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    pub fn removed_signatures(&self) -> usize {
        self.removed_signatures
    }
}

/// Values produced for the single `Reference` of an enveloped signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SignatureArtifact {
    reference_uri: String,
    digest_value: String,
    signature_value: String,
    certificate: String,
}

impl SignatureArtifact {
    pub fn reference_uri(&self) -> &str {
        &self.reference_uri
    }

    pub fn reference_id(&self) -> &str {
        self.reference_uri.trim_start_matches('#')
    }

    /// Base64 SHA-256 of the canonical target element.
    pub fn digest_value(&self) -> &str {
        &self.digest_value
    }

    /// Hex of the ASCII bytes of [`Self::digest_value`], the form the QR payload carries.
    pub fn digest_value_hex(&self) -> String {
        to_hex(self.digest_value.as_bytes())
    }

    pub fn digest_bytes(&self) -> Result<Vec<u8>, SigningError> {
        Base64::decode_vec(&self.digest_value)
            .map_err(|e| SigningError::SigningError(format!("Invalid digest value: {e}")))
    }

    pub fn signature_value(&self) -> &str {
        &self.signature_value
    }

    /// Base64 DER of the signing certificate as written to `KeyInfo`.
    pub fn certificate(&self) -> &str {
        &self.certificate
    }

    pub fn canonicalization_method(&self) -> &'static str {
        EXC_C14N_ALGORITHM
    }

    pub fn signature_method(&self) -> &'static str {
        RSA_SHA256_ALGORITHM
    }

    pub fn digest_method(&self) -> &'static str {
        SHA256_DIGEST_ALGORITHM
    }
}

/// A document carrying exactly one enveloped signature.
pub struct SignedDocument {
    doc: Document,
    target: String,
    artifact: SignatureArtifact,
}

impl SignedDocument {
    pub fn artifact(&self) -> &SignatureArtifact {
        &self.artifact
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn document(&self) -> &Document {
        &self.doc
    }

    /// Mutable access for rewriting fields outside the signed element.
    pub fn document_mut(&mut self) -> &mut Document {
        &mut self.doc
    }

    pub fn to_xml(&self) -> String {
        xml::serialize(&self.doc)
    }

    /// Recomputes the reference digest over the current DOM.
    pub fn verify_digest(&self) -> Result<(), SigningError> {
        let id = self.artifact.reference_id();
        let computed = enveloped_digest(&self.doc, id)?;
        if computed != self.artifact.digest_value {
            return Err(SigningError::Verification(format!(
                "content of '{id}' changed after signing"
            )));
        }
        Ok(())
    }
}

/// Produces XMLDSig enveloped signatures with the loaded certificate.
///
/// # Examples
/// ```rust,no_run
/// use sifen_core::certificate::CertificateLoader;
/// use sifen_core::document::XmlSigner;
///
/// let bundle = std::fs::read("firma.p12")?;
/// let certificate = CertificateLoader::new().load(&bundle, "secret")?;
/// let xml = std::fs::read_to_string("de.xml")?;
/// let signed = XmlSigner::new(&certificate).sign(&xml, "DE")?;
/// println!("{}", signed.artifact().digest_value());
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct XmlSigner<'a> {
    certificate: &'a CertificateHandle,
}

impl<'a> XmlSigner<'a> {
    pub fn new(certificate: &'a CertificateHandle) -> Self {
        Self { certificate }
    }

    pub fn sign(&self, xml: &str, target: &str) -> Result<SignedDocument, SigningError> {
        self.sign_prepared(PreparedDocument::parse(xml, target)?)
    }

    pub fn sign_prepared(&self, prepared: PreparedDocument) -> Result<SignedDocument, SigningError> {
        let PreparedDocument {
            mut doc,
            target,
            target_id,
            ..
        } = prepared;

        let mut node = first_with_id(&doc, &target_id)?;
        let digest_value = reference_digest(&mut node)?;

        let signed_info = SIGNED_INFO_TEMPLATE
            .replace("{digest_value}", &digest_value)
            .replace("{reference_id}", &escape(target_id.as_str()));
        let canonical_signed_info = canonicalize_fragment(&signed_info)?;
        let signature_value =
            sign_rsa_sha256(self.certificate.private_key(), canonical_signed_info.as_bytes())?;
        let certificate = self
            .certificate
            .certificate_base64()
            .map_err(|e| SigningError::SigningError(e.to_string()))?;

        let signature_xml = SIGNATURE_TEMPLATE
            .replace("{signature_value}", &signature_value)
            .replace("{certificate}", &certificate)
            .replace("{signed_info}", &canonical_signed_info);
        let mut signature =
            xml::import_fragment(&mut doc, &signature_xml).map_err(SigningError::SigningError)?;
        node.add_next_sibling(&mut signature)
            .map_err(|e| SigningError::SigningError(e.to_string()))?;

        ensure_single_signature(&doc)?;
        info!(reference = %target_id, element = %target, "document signed");

        Ok(SignedDocument {
            doc,
            target,
            artifact: SignatureArtifact {
                reference_uri: format!("#{target_id}"),
                digest_value,
                signature_value,
                certificate,
            },
        })
    }
}

/// Result of a successful [`verify_signed_document`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifiedSignature {
    pub reference_id: String,
    pub digest_value: String,
    pub subject: String,
}

/// Checks the single enveloped signature of `xml`: algorithms, reference digest and
/// signature value against the embedded certificate.
pub fn verify_signed_document(xml: &str) -> Result<VerifiedSignature, SigningError> {
    let doc = xml::parse(normalize_input(xml)).map_err(SigningError::SigningError)?;
    ensure_single_signature(&doc)?;

    expect_algorithm(&doc, "CanonicalizationMethod", EXC_C14N_ALGORITHM)?;
    expect_algorithm(&doc, "SignatureMethod", RSA_SHA256_ALGORITHM)?;
    expect_algorithm(&doc, "DigestMethod", SHA256_DIGEST_ALGORITHM)?;

    let reference = required_element(&doc, "Reference")?;
    let uri = reference.get_attribute("URI").unwrap_or_default();
    let reference_id = uri
        .strip_prefix('#')
        .filter(|id| !id.is_empty())
        .ok_or_else(|| SigningError::Verification(format!("unsupported reference URI '{uri}'")))?
        .to_string();

    let expected_digest = required_text(&doc, "DigestValue")?;
    let digest_value = enveloped_digest(&doc, &reference_id)?;
    if digest_value != expected_digest {
        return Err(SigningError::Verification(format!(
            "digest mismatch for '{reference_id}'"
        )));
    }

    let mut signed_info = required_element(&doc, "SignedInfo")?;
    if signed_info.get_namespace().map(|ns| ns.get_href()).as_deref() != Some(DS_NS) {
        return Err(SigningError::Verification(
            "SignedInfo is not in the XMLDSig namespace".into(),
        ));
    }
    let canonical_signed_info =
        xml::canonicalize_node(&mut signed_info).map_err(SigningError::SigningError)?;
    let signature = decode_base64(&required_text(&doc, "SignatureValue")?)?;
    let certificate = X509::from_der(&decode_base64(&required_text(&doc, "X509Certificate")?)?)
        .map_err(|e| SigningError::Verification(format!("invalid X509Certificate: {e}")))?;
    let public_key = certificate
        .public_key()
        .map_err(|e| SigningError::Verification(e.to_string()))?;

    let valid = Verifier::new(MessageDigest::sha256(), &public_key)
        .and_then(|mut verifier| {
            verifier.update(canonical_signed_info.as_bytes())?;
            verifier.verify(&signature)
        })
        .map_err(|e| SigningError::Verification(e.to_string()))?;
    if !valid {
        return Err(SigningError::Verification(
            "signature value does not match SignedInfo".into(),
        ));
    }

    let subject = certificate
        .subject_name()
        .entries()
        .filter_map(|entry| entry.data().as_utf8().ok().map(|v| v.to_string()))
        .collect::<Vec<_>>()
        .join(", ");
    Ok(VerifiedSignature {
        reference_id,
        digest_value,
        subject,
    })
}

fn first_with_id(doc: &Document, id: &str) -> Result<Node, SigningError> {
    xml::elements_with_id(doc, id)
        .map_err(SigningError::SigningError)?
        .into_iter()
        .next()
        .ok_or_else(|| SigningError::SigningError(format!("element with Id '{id}' disappeared")))
}

fn reference_digest(node: &mut Node) -> Result<String, SigningError> {
    let canonical = xml::canonicalize_node(node).map_err(SigningError::SigningError)?;
    Ok(sha256_base64(canonical.as_bytes()))
}

/// Digest of the element with `Id="{id}"` after the enveloped-signature transform.
fn enveloped_digest(doc: &Document, id: &str) -> Result<String, SigningError> {
    let copy = doc
        .dup()
        .map_err(|e| SigningError::SigningError(format!("Failed to duplicate xml: {e:?}")))?;
    let nested = xml::descendants_named(&copy, id, "Signature").map_err(SigningError::SigningError)?;
    xml::remove_all(nested);
    let targets = xml::elements_with_id(&copy, id).map_err(SigningError::SigningError)?;
    if targets.len() != 1 {
        return Err(SigningError::Verification(format!(
            "reference '#{id}' resolves to {} elements",
            targets.len()
        )));
    }
    let mut node = first_with_id(&copy, id)?;
    reference_digest(&mut node)
}

fn canonicalize_fragment(fragment: &str) -> Result<String, SigningError> {
    let doc = xml::parse(fragment).map_err(SigningError::SigningError)?;
    xml::canonicalize_document(&doc).map_err(SigningError::SigningError)
}

fn sign_rsa_sha256(key: &PKey<Private>, data: &[u8]) -> Result<String, SigningError> {
    let mut signer = Signer::new(MessageDigest::sha256(), key)
        .map_err(|e| SigningError::SigningError(format!("Failed to create signer: {e}")))?;
    signer
        .update(data)
        .map_err(|e| SigningError::SigningError(format!("Failed to sign SignedInfo: {e}")))?;
    let signature = signer
        .sign_to_vec()
        .map_err(|e| SigningError::SigningError(format!("Failed to sign SignedInfo: {e}")))?;
    Ok(Base64::encode_string(&signature))
}

fn ensure_single_signature(doc: &Document) -> Result<(), SigningError> {
    for name in ["Signature", "Reference", "DigestValue", "SignatureValue"] {
        let count = xml::elements_named(doc, name)
            .map_err(SigningError::SigningError)?
            .len();
        if count != 1 {
            return Err(SigningError::Verification(format!(
                "expected exactly one {name}, found {count}"
            )));
        }
    }
    Ok(())
}

fn expect_algorithm(doc: &Document, element: &str, algorithm: &str) -> Result<(), SigningError> {
    let node = required_element(doc, element)?;
    match node.get_attribute("Algorithm") {
        Some(found) if found == algorithm => Ok(()),
        found => Err(SigningError::Verification(format!(
            "{element} uses {found:?}, expected {algorithm}"
        ))),
    }
}

fn required_element(doc: &Document, name: &str) -> Result<Node, SigningError> {
    xml::first_named(doc, name)
        .map_err(SigningError::SigningError)?
        .ok_or_else(|| SigningError::Verification(format!("missing {name}")))
}

fn required_text(doc: &Document, name: &str) -> Result<String, SigningError> {
    let value = required_element(doc, name)?.get_content().trim().to_string();
    if value.is_empty() {
        return Err(SigningError::Verification(format!("empty {name}")));
    }
    Ok(value)
}

fn decode_base64(value: &str) -> Result<Vec<u8>, SigningError> {
    let compact: String = value.chars().filter(|c| !c.is_whitespace()).collect();
    Base64::decode_vec(&compact)
        .map_err(|e| SigningError::Verification(format!("invalid base64: {e}")))
}
