use libxml::parser::Parser as XmlParser;
use libxml::xpath;
use openssl::asn1::Asn1Time;
use openssl::hash::MessageDigest;
use openssl::pkcs12::Pkcs12;
use openssl::pkey::PKey;
use openssl::rsa::Rsa;
use openssl::x509::{X509, X509NameBuilder};
use std::path::PathBuf;
use std::process::Command;

const PASSWORD: &str = "cli-secret";
const CDC: &str = "01800695631001001000000612021112917595714309";

fn cli_exe() -> &'static str {
    env!("CARGO_BIN_EXE_sifen")
}

fn unique_temp_path(prefix: &str) -> PathBuf {
    let mut path = std::env::temp_dir();
    let nonce = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    path.push(format!("{prefix}-{}-{nonce}", std::process::id()));
    path
}

fn write_test_bundle() -> PathBuf {
    let key = Rsa::generate(2048).and_then(PKey::from_rsa).expect("rsa key");
    let mut name = X509NameBuilder::new().expect("name builder");
    name.append_entry_by_text("CN", "CLI TEST").expect("common name");
    let name = name.build();
    let mut builder = X509::builder().expect("x509 builder");
    builder.set_version(2).expect("version");
    builder.set_subject_name(&name).expect("subject");
    builder.set_issuer_name(&name).expect("issuer");
    builder.set_pubkey(&key).expect("public key");
    builder
        .set_not_before(&Asn1Time::days_from_now(0).expect("not before"))
        .expect("set not before");
    builder
        .set_not_after(&Asn1Time::days_from_now(30).expect("not after"))
        .expect("set not after");
    builder.sign(&key, MessageDigest::sha256()).expect("sign");
    let certificate = builder.build();
    let bundle = Pkcs12::builder()
        .name("cli")
        .pkey(&key)
        .cert(&certificate)
        .build2(PASSWORD)
        .and_then(|p12| p12.to_der())
        .expect("pkcs12");

    let path = unique_temp_path("sifen-cli-bundle");
    std::fs::write(&path, bundle).expect("write bundle");
    path
}

fn write_invoice(with_de: bool) -> PathBuf {
    let placeholder = "665569394474586a4f4a396970724970754f344c434a75706a457a73645766664846656d573270344c69593d";
    let body = if with_de {
        format!("<DE Id=\"{CDC}\"><dDVId>9</dDVId></DE>")
    } else {
        "<gTimb><iTiDE>1</iTiDE></gTimb>".to_string()
    };
    let xml = format!(
        "<rDE xmlns=\"http://ekuatia.set.gov.py/sifen/xsd\"><dVerFor>150</dVerFor>{body}\
         <gCamFuFD><dCarQR>nVersion=150&amp;Id={CDC}&amp;DigestValue={placeholder}\
         &amp;IdCSC=0001ABCD0000000000000000000000000000</dCarQR></gCamFuFD></rDE>"
    );
    let path = unique_temp_path("sifen-cli-invoice");
    std::fs::write(&path, xml).expect("write invoice");
    path
}

#[test]
fn cdc_command_reports_valid_code() {
    let output = Command::new(cli_exe())
        .args(["cdc", CDC])
        .output()
        .expect("run cdc command");
    assert!(
        output.status.success(),
        "cdc command failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).expect("json");
    assert_eq!(report["valid"], true);
    assert_eq!(
        report["formatted"],
        "0180 0695 6310 0100 1000 0006 1202 1112 9175 9571 4309"
    );
    assert_eq!(report["components"]["issuer_ruc"], "80069563");
}

#[test]
fn cdc_command_rejects_wrong_check_digit() {
    let tampered = format!("{}0", &CDC[..43]);
    let output = Command::new(cli_exe())
        .args(["cdc", &tampered])
        .output()
        .expect("run cdc command");
    assert!(!output.status.success());
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).expect("json");
    assert_eq!(report["valid"], false);
    assert_eq!(report["expected_check_digit"], 9);
}

#[test]
fn sign_then_verify_round_trip() {
    let bundle = write_test_bundle();
    let invoice = write_invoice(true);
    let signed_path = unique_temp_path("sifen-cli-signed");
    let envelope_path = unique_temp_path("sifen-cli-envelope");

    let output = Command::new(cli_exe())
        .env("SIFEN_CERT_PASSWORD", PASSWORD)
        .args(["sign", "--document"])
        .arg(&invoice)
        .arg("--cert")
        .arg(&bundle)
        .arg("--signed-document")
        .arg(&signed_path)
        .arg("--envelope")
        .arg(&envelope_path)
        .output()
        .expect("run sign command");
    assert!(
        output.status.success(),
        "sign command failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).expect("json");
    assert_eq!(report["reference_id"], CDC);
    assert!(
        report["qr_url"]
            .as_str()
            .is_some_and(|url| url.starts_with("https://ekuatia.set.gov.py/consultas-test/qr?"))
    );
    assert!(report["signed_document"].is_null());

    let signed_xml = std::fs::read_to_string(&signed_path).expect("read signed document");
    let doc = XmlParser::default()
        .parse_string(&signed_xml)
        .expect("parse signed document");
    let ctx = xpath::Context::new(&doc).expect("xpath context");
    ctx.register_namespace("ds", "http://www.w3.org/2000/09/xmldsig#")
        .expect("ds ns");
    let signatures = ctx
        .evaluate("//ds:Signature")
        .expect("xpath")
        .get_nodes_as_vec();
    assert_eq!(signatures.len(), 1);

    let envelope = std::fs::read_to_string(&envelope_path).expect("read envelope");
    assert!(envelope.contains("<rEnvioLote"));

    let output = Command::new(cli_exe())
        .args(["verify", "--document"])
        .arg(&signed_path)
        .output()
        .expect("run verify command");
    assert!(
        output.status.success(),
        "verify command failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let verified: serde_json::Value = serde_json::from_slice(&output.stdout).expect("json");
    assert_eq!(verified["reference_id"], CDC);

    for path in [bundle, invoice, signed_path, envelope_path] {
        let _ = std::fs::remove_file(path);
    }
}

#[test]
fn sign_without_target_reports_node_not_found() {
    let bundle = write_test_bundle();
    let invoice = write_invoice(false);
    let output = Command::new(cli_exe())
        .env("SIFEN_CERT_PASSWORD", PASSWORD)
        .args(["sign", "--document"])
        .arg(&invoice)
        .arg("--cert")
        .arg(&bundle)
        .output()
        .expect("run sign command");

    assert!(!output.status.success());
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).expect("json");
    assert_eq!(report["result_code"], "10001");
    assert_eq!(report["kind"], "NodeNotFound");

    let _ = std::fs::remove_file(bundle);
    let _ = std::fs::remove_file(invoice);
}

#[test]
fn query_rejects_malformed_tax_id_before_connecting() {
    let output = Command::new(cli_exe())
        .env("SIFEN_CERT_PASSWORD", PASSWORD)
        .args([
            "--base-url",
            "http://127.0.0.1:9",
            "query",
            "--kind",
            "ruc",
            "--value",
            "ABC",
            "--cert",
            "/nonexistent.p12",
        ])
        .output()
        .expect("run query command");
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("invalid tax id"));
}
