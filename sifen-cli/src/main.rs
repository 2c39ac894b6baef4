use anyhow::{Context, Result, bail};
use clap::{ArgAction, Args, Parser, Subcommand};
use serde_json::json;
use sifen_core::cdc::{CdcComponents, check_digit, format_cdc, validate_cdc};
use sifen_core::certificate::CertificateSource;
use sifen_core::config::{Config, ContentProfile, Environment};
use sifen_core::document::{DocumentKind, EnvelopeKind, verify_signed_document};
use sifen_core::pipeline::{SifenClient, SigningRequest};
use sifen_core::query::{QueryKind, QueryRequest};
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;

#[derive(Parser)]
#[command(name = "sifen")]
#[command(about = "Sign, submit and look up SIFEN electronic documents")]
struct Cli {
    /// Target environment: test or prod.
    #[arg(long, global = true, default_value = "test")]
    env: Environment,
    /// Overrides the web service base URL.
    #[arg(long, global = true)]
    base_url: Option<String>,
    /// Request timeout in seconds.
    #[arg(long, global = true)]
    timeout: Option<u64>,
    /// Send `application/xml` instead of the SOAP 1.2 media type.
    #[arg(long, global = true)]
    plain_xml: bool,
    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct CertificateArgs {
    /// PKCS#12 bundle with the signing certificate.
    #[arg(long)]
    cert: PathBuf,
    #[arg(long, env = "SIFEN_CERT_PASSWORD", hide_env_values = true)]
    password: String,
}

#[derive(Args)]
struct DocumentArgs {
    #[arg(long)]
    document: PathBuf,
    /// invoice (DE) or event (rEve).
    #[arg(long, default_value = "invoice")]
    kind: DocumentKind,
    /// Use the synchronous single-document service for invoices.
    #[arg(long)]
    sync: bool,
    #[command(flatten)]
    certificate: CertificateArgs,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign and package a document without sending it.
    Sign {
        #[command(flatten)]
        document: DocumentArgs,
        /// Where to write the signed document; printed in the JSON output otherwise.
        #[arg(long)]
        signed_document: Option<PathBuf>,
        /// Where to write the SOAP envelope.
        #[arg(long)]
        envelope: Option<PathBuf>,
    },
    /// Sign, package and submit a document.
    Submit {
        #[command(flatten)]
        document: DocumentArgs,
    },
    /// Look up a taxpayer, document or batch.
    Query {
        /// ruc, cdc or batch.
        #[arg(long)]
        kind: QueryKind,
        #[arg(long)]
        value: String,
        #[command(flatten)]
        certificate: CertificateArgs,
    },
    /// Check the signature of a signed document.
    Verify {
        #[arg(long)]
        document: PathBuf,
    },
    /// Validate and format a 44-digit document code.
    Cdc { code: String },
}

fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn config_from(cli: &Cli) -> Config {
    let mut config = Config::new(cli.env);
    if let Some(base_url) = &cli.base_url {
        config = config.with_base_url(base_url.clone());
    }
    if let Some(seconds) = cli.timeout {
        config = config.with_timeout(Duration::from_secs(seconds));
    }
    if cli.plain_xml {
        config = config.with_content_profile(ContentProfile::PlainXml);
    }
    config
}

fn signing_request(args: DocumentArgs) -> Result<SigningRequest> {
    let document = std::fs::read_to_string(&args.document)
        .with_context(|| format!("reading {}", args.document.display()))?;
    let password = Zeroizing::new(args.certificate.password);
    let mut request = SigningRequest::new(
        document,
        args.certificate.cert,
        password.as_str(),
        args.kind,
    );
    if args.sync {
        if args.kind != DocumentKind::Invoice {
            bail!("--sync applies to invoices only");
        }
        request = request.with_envelope(EnvelopeKind::Document);
    }
    Ok(request)
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn failure_json(err: &sifen_core::Error) -> serde_json::Value {
    json!({
        "result_code": err.result_code(),
        "result_message": err.to_string(),
        "kind": err.kind(),
        "retryable": err.is_retryable(),
        "raw_response": err.raw_response(),
    })
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let config = config_from(&cli);
    debug!(env = config.env().as_str(), base_url = %config.base_url(), "configuration resolved");

    match cli.command {
        Commands::Sign {
            document,
            signed_document,
            envelope,
        } => {
            let request = signing_request(document)?;
            let prepared = match SifenClient::new(config).prepare_submission(&request) {
                Ok(prepared) => prepared,
                Err(err) => {
                    print_json(&failure_json(&err))?;
                    bail!(err);
                }
            };
            if let Some(path) = &envelope {
                std::fs::write(path, prepared.envelope.body())
                    .with_context(|| format!("writing {}", path.display()))?;
            }
            let inline_document = match &signed_document {
                Some(path) => {
                    std::fs::write(path, &prepared.signed_document)
                        .with_context(|| format!("writing {}", path.display()))?;
                    None
                }
                None => Some(prepared.signed_document.as_str()),
            };
            print_json(&json!({
                "reference_id": prepared.reference_id,
                "digest_value": prepared.digest_value,
                "qr_url": prepared.qr_url,
                "request_id": prepared.envelope.request_id(),
                "endpoint": prepared.endpoint,
                "certificate": prepared.certificate,
                "signed_document": inline_document,
            }))?;
        }
        Commands::Submit { document } => {
            let request = signing_request(document)?;
            let client = SifenClient::new(config);
            let runtime = tokio::runtime::Runtime::new()?;
            match runtime.block_on(client.submit(&request)) {
                Ok(result) => print_json(&serde_json::to_value(&result)?)?,
                Err(err) => {
                    print_json(&failure_json(&err))?;
                    bail!(err);
                }
            }
        }
        Commands::Query {
            kind,
            value,
            certificate,
        } => {
            let request = QueryRequest::new(kind, &value)?;
            let password = Zeroizing::new(certificate.password);
            let source = CertificateSource::from(certificate.cert);
            let client = SifenClient::new(config);
            let runtime = tokio::runtime::Runtime::new()?;
            match runtime.block_on(client.query(&request, &source, &password)) {
                Ok(response) => print_json(&serde_json::to_value(&response)?)?,
                Err(err) => {
                    print_json(&failure_json(&err))?;
                    bail!(err);
                }
            }
        }
        Commands::Verify { document } => {
            let xml = std::fs::read_to_string(&document)
                .with_context(|| format!("reading {}", document.display()))?;
            let verified = verify_signed_document(&xml)?;
            print_json(&serde_json::to_value(&verified)?)?;
        }
        Commands::Cdc { code } => {
            let digits: String = code.chars().filter(char::is_ascii_digit).collect();
            let expected = digits.get(..43).and_then(check_digit);
            let components = CdcComponents::parse(&code).ok();
            let validation = validate_cdc(&code);
            print_json(&json!({
                "cdc": digits,
                "formatted": format_cdc(&code),
                "valid": validation.is_ok(),
                "error": validation.as_ref().err().map(ToString::to_string),
                "expected_check_digit": expected,
                "components": components,
            }))?;
            if validation.is_err() {
                bail!("invalid CDC");
            }
        }
    }

    Ok(())
}
