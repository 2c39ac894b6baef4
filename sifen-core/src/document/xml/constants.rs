pub const SIFEN_NS: &str = "http://ekuatia.set.gov.py/sifen/xsd";
pub const SOAP12_NS: &str = "http://www.w3.org/2003/05/soap-envelope";
pub const DS_NS: &str = "http://www.w3.org/2000/09/xmldsig#";

pub const EXC_C14N_ALGORITHM: &str = "http://www.w3.org/2001/10/xml-exc-c14n#";
pub const ENVELOPED_SIGNATURE_TRANSFORM: &str =
    "http://www.w3.org/2000/09/xmldsig#enveloped-signature";
pub const RSA_SHA256_ALGORITHM: &str = "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256";
pub const SHA256_DIGEST_ALGORITHM: &str = "http://www.w3.org/2001/04/xmlenc#sha256";

pub(crate) const SIGNED_INFO_TEMPLATE: &str =
    include_str!("../../../assets/templates/signed_info.xml");
pub(crate) const SIGNATURE_TEMPLATE: &str =
    include_str!("../../../assets/templates/signature.xml");

pub(crate) const BATCH_ENVELOPE_TEMPLATE: &str =
    include_str!("../../../assets/templates/envio_lote.xml");
pub(crate) const DOCUMENT_ENVELOPE_TEMPLATE: &str =
    include_str!("../../../assets/templates/envio_de.xml");
pub(crate) const EVENT_ENVELOPE_TEMPLATE: &str =
    include_str!("../../../assets/templates/envio_evento.xml");

pub(crate) const TAX_ID_QUERY_TEMPLATE: &str =
    include_str!("../../../assets/templates/consulta_ruc.xml");
pub(crate) const DOCUMENT_QUERY_TEMPLATE: &str =
    include_str!("../../../assets/templates/consulta_de.xml");
pub(crate) const BATCH_QUERY_TEMPLATE: &str =
    include_str!("../../../assets/templates/consulta_lote.xml");

pub(crate) const REQUEST_ID_SLOT: &str = "{request_id}";
pub(crate) const PAYLOAD_SLOT: &str = "{payload}";
pub(crate) const VALUE_SLOT: &str = "{value}";
