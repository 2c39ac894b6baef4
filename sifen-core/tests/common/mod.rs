use openssl::{
    asn1::Asn1Time,
    bn::BigNum,
    ec::{EcGroup, EcKey},
    hash::MessageDigest,
    nid::Nid,
    pkcs12::Pkcs12,
    pkey::{PKey, Private},
    rsa::Rsa,
    x509::{X509, X509NameBuilder},
};
use sifen_core::document::qr::DIGEST_PLACEHOLDER;
use std::sync::OnceLock;

pub const PASSWORD: &str = "sifen-test";
#[allow(dead_code)]
pub const INVOICE_ID: &str = "01800695631001001000000612021112917595714309";

pub struct TestIdentity {
    pub bundle: Vec<u8>,
    pub certificate: X509,
}

fn self_signed(key: &PKey<Private>, common_name: &str) -> X509 {
    let mut name = X509NameBuilder::new().expect("name builder");
    name.append_entry_by_text("C", "PY").expect("country");
    name.append_entry_by_text("O", "Sifen Test").expect("organization");
    name.append_entry_by_text("CN", common_name).expect("common name");
    let name = name.build();

    let mut builder = X509::builder().expect("x509 builder");
    builder.set_version(2).expect("version");
    let serial = BigNum::from_u32(0x5eed)
        .and_then(|bn| bn.to_asn1_integer())
        .expect("serial");
    builder.set_serial_number(&serial).expect("set serial");
    builder.set_subject_name(&name).expect("subject");
    builder.set_issuer_name(&name).expect("issuer");
    builder.set_pubkey(key).expect("public key");
    builder
        .set_not_before(&Asn1Time::days_from_now(0).expect("not before"))
        .expect("set not before");
    builder
        .set_not_after(&Asn1Time::days_from_now(365).expect("not after"))
        .expect("set not after");
    builder.sign(key, MessageDigest::sha256()).expect("self sign");
    builder.build()
}

fn bundle_for(key: &PKey<Private>, certificate: &X509, password: &str) -> Vec<u8> {
    Pkcs12::builder()
        .name("sifen")
        .pkey(key)
        .cert(certificate)
        .build2(password)
        .and_then(|p12| p12.to_der())
        .expect("pkcs12 bundle")
}

fn build_rsa_identity() -> TestIdentity {
    let key = Rsa::generate(2048)
        .and_then(PKey::from_rsa)
        .expect("rsa key");
    let certificate = self_signed(&key, "EMPRESA DE PRUEBA S.A.");
    TestIdentity {
        bundle: bundle_for(&key, &certificate, PASSWORD),
        certificate,
    }
}

/// RSA-2048 identity shared by every test in the binary.
#[allow(dead_code)]
pub fn rsa_identity() -> &'static TestIdentity {
    static IDENTITY: OnceLock<TestIdentity> = OnceLock::new();
    IDENTITY.get_or_init(build_rsa_identity)
}

/// Bundle whose private key is an EC key, unusable for RSA-SHA256.
#[allow(dead_code)]
pub fn ec_bundle() -> Vec<u8> {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).expect("curve");
    let key = EcKey::generate(&group)
        .and_then(PKey::from_ec_key)
        .expect("ec key");
    let certificate = self_signed(&key, "EC ONLY");
    bundle_for(&key, &certificate, PASSWORD)
}

/// Bundle holding only a certificate, no private key.
#[allow(dead_code)]
pub fn certificate_only_bundle() -> Vec<u8> {
    Pkcs12::builder()
        .name("sifen")
        .cert(&rsa_identity().certificate)
        .build2(PASSWORD)
        .and_then(|p12| p12.to_der())
        .expect("certificate-only bundle")
}

/// QR template as issued with the document: placeholder digest and a 32-character CSC.
#[allow(dead_code)]
pub fn qr_template() -> String {
    format!(
        "nVersion=150&Id={INVOICE_ID}&dFeEmiDE=323032312d31312d32395431323a30303a3030\
         &dRucRec=80012345&dTotGralOpe=110000&dTotIVA=10000&cItems=1\
         &DigestValue={DIGEST_PLACEHOLDER}&IdCSC=0001ABCD0000000000000000000000000000"
    )
}

#[allow(dead_code)]
pub fn sample_invoice() -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <rDE xmlns=\"http://ekuatia.set.gov.py/sifen/xsd\" xmlns:xsi=\"http://www.w3.org/2001/XMLSchema-instance\">\
         <dVerFor>150</dVerFor>\
         <DE Id=\"{INVOICE_ID}\">\
         <dDVId>9</dDVId><dFecFirma>2021-11-29T12:00:00</dFecFirma><dSisFact>1</dSisFact>\
         <gDatGralOpe><dFeEmiDE>2021-11-29T12:00:00</dFeEmiDE>\
         <gEmis><dRucEm>80069563</dRucEm><dNomEmi>EMPRESA DE PRUEBA S.A.</dNomEmi></gEmis></gDatGralOpe>\
         <gTotSub><dTotGralOpe>110000</dTotGralOpe><dTotIVA>10000</dTotIVA></gTotSub>\
         </DE>\
         <gCamFuFD><dCarQR>{}</dCarQR></gCamFuFD>\
         </rDE>",
        qr_template().replace('&', "&amp;")
    )
}

#[allow(dead_code)]
pub fn sample_event() -> String {
    "<gGroupGesEve xmlns=\"http://ekuatia.set.gov.py/sifen/xsd\" xmlns:xsi=\"http://www.w3.org/2001/XMLSchema-instance\">\
     <rGesEve><rEve Id=\"1\"><dFecFirma>2024-01-01T12:00:00</dFecFirma><dVerFor>150</dVerFor>\
     <gGroupTiEvt><rGeVeCan><Id>01800695631001001000000612021112917595714309</Id><mOtEve>Error de emision</mOtEve></rGeVeCan></gGroupTiEvt>\
     </rEve></rGesEve></gGroupGesEve>"
        .to_string()
}

#[allow(dead_code)]
pub fn try_start_server() -> Option<httpmock::MockServer> {
    std::panic::catch_unwind(httpmock::MockServer::start).ok()
}
