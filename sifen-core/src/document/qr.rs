use super::xml;
use crate::hash::sha256_hex;
use libxml::tree::Document;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

/// Element holding the QR template before signing and the final URL after.
pub const QR_FIELD: &str = "dCarQR";

/// Token in the QR template that is replaced by the digest hex.
///
/// It is itself the hex of the ASCII text of a base64 digest.
pub const DIGEST_PLACEHOLDER: &str = "665569394474586a4f4a396970724970754f344c434a75706a457a73645766664846656d573270344c69593d";

/// Length of the CSC security code appended to the template after `IdCSC`.
pub const QR_SECURITY_CODE_LEN: usize = 32;

pub const HASH_PARAM: &str = "&cHashQR=";

#[derive(Debug, Error)]
pub enum QrError {
    #[error("QR template is {len} characters, shorter than the {suffix_len}-character security code")]
    TemplateTooShort { len: usize, suffix_len: usize },
    #[error("QR template cannot be split {suffix_len} characters from the end")]
    InvalidTemplate { suffix_len: usize },
    #[error("QR template has no digest placeholder")]
    MissingPlaceholder,
    #[error("QR field already holds a published URL; start again from the unsigned template")]
    AlreadyRewritten,
    #[error("QR XML error: {0}")]
    Xml(String),
}

pub type QrResult<T> = std::result::Result<T, QrError>;

/// Input covered by `cHashQR`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum QrHashScope {
    /// The full template after digest substitution, security code included.
    #[default]
    TemplateWithSecurityCode,
    /// The published URL preceding `&cHashQR=`.
    PublishedUrl,
}

/// One rewritten QR field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QrPayload {
    template: String,
    final_url: String,
    hash: String,
}

impl QrPayload {
    /// Template as found in the document, placeholder not yet substituted.
    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn final_url(&self) -> &str {
        &self.final_url
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }
}

/// Rewrites QR templates into the published consultation URL.
///
/// # Examples
/// ```rust
/// use sifen_core::document::qr::{DIGEST_PLACEHOLDER, QrEmbedder};
///
/// let template = format!("nVersion=150&DigestValue={DIGEST_PLACEHOLDER}&IdCSC=0001{}", "A".repeat(32));
/// let payload = QrEmbedder::new("https://ekuatia.set.gov.py/consultas-test/qr?")
///     .rewrite(&template, "abcd")?;
/// assert!(payload.final_url().contains("DigestValue=abcd&IdCSC=0001&cHashQR="));
/// # Ok::<(), sifen_core::document::QrError>(())
/// ```
#[derive(Debug, Clone)]
pub struct QrEmbedder {
    base_url: String,
    field: String,
    suffix_len: usize,
    scope: QrHashScope,
}

impl QrEmbedder {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            field: QR_FIELD.to_string(),
            suffix_len: QR_SECURITY_CODE_LEN,
            scope: QrHashScope::default(),
        }
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = field.into();
        self
    }

    pub fn with_suffix_len(mut self, suffix_len: usize) -> Self {
        self.suffix_len = suffix_len;
        self
    }

    pub fn with_hash_scope(mut self, scope: QrHashScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Builds the final URL for one template value.
    ///
    /// A value that is already a published URL cannot be rewritten again: its
    /// security code was cut off the first time.
    pub fn rewrite(&self, template: &str, digest_hex: &str) -> QrResult<QrPayload> {
        let published_before =
            !self.base_url.is_empty() && template.starts_with(self.base_url.as_str());
        if published_before || template.contains(HASH_PARAM) {
            return Err(QrError::AlreadyRewritten);
        }
        let value = template.replace(DIGEST_PLACEHOLDER, digest_hex);
        if value.len() < self.suffix_len {
            return Err(QrError::TemplateTooShort {
                len: value.len(),
                suffix_len: self.suffix_len,
            });
        }
        let cut = value.len() - self.suffix_len;
        let kept = value
            .get(..cut)
            .ok_or(QrError::InvalidTemplate {
                suffix_len: self.suffix_len,
            })?;
        if !template.contains(DIGEST_PLACEHOLDER) {
            return Err(QrError::MissingPlaceholder);
        }

        let published = format!("{}{}", self.base_url, kept);
        let hash = match self.scope {
            QrHashScope::TemplateWithSecurityCode => sha256_hex(&value),
            QrHashScope::PublishedUrl => sha256_hex(&published),
        };
        Ok(QrPayload {
            template: template.to_string(),
            final_url: format!("{published}{HASH_PARAM}{hash}"),
            hash,
        })
    }

    /// Rewrites every QR field of `doc` in place. A document without QR fields
    /// yields an empty list.
    pub fn embed(&self, doc: &mut Document, digest_hex: &str) -> QrResult<Vec<QrPayload>> {
        let nodes = xml::elements_named(doc, &self.field).map_err(QrError::Xml)?;
        if nodes.is_empty() {
            debug!(field = %self.field, "no QR field present");
        }
        let mut payloads = Vec::with_capacity(nodes.len());
        for mut node in nodes {
            let payload = self.rewrite(&node.get_content(), digest_hex)?;
            xml::replace_text(doc, &mut node, payload.final_url()).map_err(QrError::Xml)?;
            payloads.push(payload);
        }
        Ok(payloads)
    }

    /// String-in, string-out form of [`Self::embed`].
    pub fn embed_str(&self, xml: &str, digest_hex: &str) -> QrResult<(String, Vec<QrPayload>)> {
        let mut doc = xml::parse(super::normalize_input(xml)).map_err(QrError::Xml)?;
        let payloads = self.embed(&mut doc, digest_hex)?;
        Ok((xml::serialize(&doc), payloads))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = "https://ekuatia.set.gov.py/consultas-test/qr?";
    // hex of the ASCII text of sha256_base64("abc")
    const DIGEST_HEX: &str = "756e6757763438427a2b704251554465586134694937414459614f57463371637442442f596649414661303d";

    fn template() -> String {
        format!(
            "nVersion=150&Id=01800695631001001000000612021112917595714\
             &dFeEmiDE=323032312d31312d32395431323a30303a3030&dRucRec=80012345\
             &dTotGralOpe=110000&dTotIVA=10000&cItems=1&DigestValue={DIGEST_PLACEHOLDER}\
             &IdCSC=0001ABCD0000000000000000000000000000"
        )
    }

    const KEPT: &str = "nVersion=150&Id=01800695631001001000000612021112917595714&dFeEmiDE=323032312d31312d32395431323a30303a3030&dRucRec=80012345&dTotGralOpe=110000&dTotIVA=10000&cItems=1&DigestValue=756e6757763438427a2b704251554465586134694937414459614f57463371637442442f596649414661303d&IdCSC=0001";

    #[test]
    fn rewrite_hashes_template_with_security_code() {
        let payload = QrEmbedder::new(BASE)
            .rewrite(&template(), DIGEST_HEX)
            .expect("rewrite");
        assert_eq!(
            payload.final_url(),
            format!(
                "{BASE}{KEPT}&cHashQR=7f4f092d615b583be225106047c889261a5065f6cd64b2eddf5d7fbcd277c200"
            )
        );
        assert!(!payload.final_url().contains(DIGEST_PLACEHOLDER));
        assert!(!payload.final_url().contains("ABCD000"));
    }

    #[test]
    fn rewrite_can_hash_published_url() {
        let payload = QrEmbedder::new(BASE)
            .with_hash_scope(QrHashScope::PublishedUrl)
            .rewrite(&template(), DIGEST_HEX)
            .expect("rewrite");
        assert_eq!(
            payload.hash(),
            "8efa43799a8cb884c6149eff0e3a689e0236e23d074b83b337ed36d96d0f1774"
        );
        let (url, hash) = payload
            .final_url()
            .split_once(HASH_PARAM)
            .expect("hash parameter");
        assert_eq!(sha256_hex(url), hash);
    }

    #[test]
    fn template_shorter_than_security_code_is_rejected() {
        // 31 characters: one short of the security code suffix.
        match QrEmbedder::new(BASE).rewrite("PLACEHOLDER32CHARS0000000000000", "ab") {
            Err(QrError::TemplateTooShort { len, suffix_len }) => {
                assert_eq!(len, 31);
                assert_eq!(suffix_len, 32);
            }
            other => panic!("expected TemplateTooShort, got {other:?}"),
        }
    }

    #[test]
    fn template_without_placeholder_is_rejected() {
        let template = template().replace(DIGEST_PLACEHOLDER, "zzz");
        assert!(matches!(
            QrEmbedder::new(BASE).rewrite(&template, DIGEST_HEX),
            Err(QrError::MissingPlaceholder)
        ));
    }

    #[test]
    fn published_url_is_not_rewritten_twice() {
        let embedder = QrEmbedder::new(BASE);
        let first = embedder.rewrite(&template(), DIGEST_HEX).expect("rewrite");
        assert!(matches!(
            embedder.rewrite(first.final_url(), "756e67"),
            Err(QrError::AlreadyRewritten)
        ));

        let without_base = first.final_url().trim_start_matches(BASE);
        assert!(matches!(
            embedder.rewrite(without_base, "756e67"),
            Err(QrError::AlreadyRewritten)
        ));
    }

    #[test]
    fn second_embed_is_rejected() {
        let embedder = QrEmbedder::new(BASE);
        let xml = format!(
            "<rDE><gCamFuFD><dCarQR>{}</dCarQR></gCamFuFD></rDE>",
            template().replace('&', "&amp;")
        );
        let (rewritten, _) = embedder.embed_str(&xml, DIGEST_HEX).expect("first embed");
        assert!(matches!(
            embedder.embed_str(&rewritten, DIGEST_HEX),
            Err(QrError::AlreadyRewritten)
        ));
    }

    #[test]
    fn split_inside_multibyte_char_is_invalid() {
        let embedder = QrEmbedder::new(BASE).with_suffix_len(1);
        match embedder.rewrite("añ", "x") {
            Err(QrError::InvalidTemplate { suffix_len }) => assert_eq!(suffix_len, 1),
            other => panic!("expected InvalidTemplate, got {other:?}"),
        }
    }

    #[test]
    fn embed_rewrites_field_and_escapes_ampersands() {
        let xml = format!(
            "<rDE xmlns=\"http://ekuatia.set.gov.py/sifen/xsd\"><DE Id=\"1\"/><gCamFuFD><dCarQR>{}</dCarQR></gCamFuFD></rDE>",
            template().replace('&', "&amp;")
        );
        let (rewritten, payloads) = QrEmbedder::new(BASE)
            .embed_str(&xml, DIGEST_HEX)
            .expect("embed");
        assert_eq!(payloads.len(), 1);
        assert!(rewritten.contains("<dCarQR>https://ekuatia.set.gov.py/consultas-test/qr?nVersion=150&amp;Id="));
        assert!(rewritten.contains("&amp;IdCSC=0001&amp;cHashQR="));
    }

    #[test]
    fn embed_without_qr_field_is_a_no_op() {
        let xml = r#"<rGesEve><rEve Id="1"><dFecFirma>2024-01-01T00:00:00</dFecFirma></rEve></rGesEve>"#;
        let (rewritten, payloads) = QrEmbedder::new(BASE).embed_str(xml, "ab").expect("embed");
        assert!(payloads.is_empty());
        assert_eq!(rewritten, xml);
    }
}
