//! PKCS#12 certificate loading with ordered access-profile fallback.
//!
//! A bundle is opened under each [`AccessProfile`] in turn until one yields a
//! certificate with an RSA private key able to produce SHA-256 signatures.
//!
//! # Examples
//! ```rust,no_run
//! use sifen_core::certificate::CertificateLoader;
//!
//! let bundle = std::fs::read("firma.p12")?;
//! let handle = CertificateLoader::new().load(&bundle, "secret")?;
//! println!("{} ({})", handle.subject(), handle.thumbprint());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
mod store;

pub use store::{CertificateStore, Imported, MemoryStore, OpenedBundle, PersonalStore, StoreError};

use crate::hash::to_hex;
use base64ct::{Base64, Encoding};
use openssl::{
    error::ErrorStack,
    hash::MessageDigest,
    pkey::{PKey, Private},
    rsa::Rsa,
    sign::Signer,
    x509::{X509, X509NameRef, X509Ref},
};
use std::{borrow::Cow, fmt, path::PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors returned while loading a signing certificate.
#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("failed to read certificate bundle '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("certificate bundle could not be opened under any access profile: {last_error}")]
    LoadFailure {
        attempts: Vec<ProfileFailure>,
        last_error: String,
    },
    #[error("certificate bundle opened but no usable RSA private key was found: {message}")]
    KeyExtraction {
        attempts: Vec<ProfileFailure>,
        message: String,
    },
    #[error("certificate encoding error: {0}")]
    Encoding(String),
}

impl CertificateError {
    /// Profiles that were tried before giving up, in order.
    pub fn attempts(&self) -> &[ProfileFailure] {
        match self {
            CertificateError::LoadFailure { attempts, .. }
            | CertificateError::KeyExtraction { attempts, .. } => attempts,
            _ => &[],
        }
    }
}

/// Why a single access profile was rejected.
#[derive(Debug, Error)]
pub enum ProfileError {
    #[error(transparent)]
    Open(#[from] StoreError),
    #[error("bundle has no private key")]
    NoPrivateKey,
    #[error("private key is not a usable RSA key: {0}")]
    KeyExtraction(String),
    #[error("certificate metadata error: {0}")]
    Metadata(String),
}

impl ProfileError {
    fn bundle_opened(&self) -> bool {
        matches!(
            self,
            ProfileError::NoPrivateKey | ProfileError::KeyExtraction(_)
        )
    }
}

#[derive(Debug)]
pub struct ProfileFailure {
    pub profile: AccessProfile,
    pub error: ProfileError,
}

impl fmt::Display for ProfileFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.profile, self.error)
    }
}

/// Key storage scope requested when a bundle is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyScope {
    Machine,
    User,
    Default,
}

/// Combination of key-storage flags tried when opening a bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AccessProfile {
    exportable: bool,
    scope: Option<KeyScope>,
}

impl AccessProfile {
    pub const EXPORTABLE_MACHINE: Self = Self::new(true, Some(KeyScope::Machine));
    pub const EXPORTABLE_USER: Self = Self::new(true, Some(KeyScope::User));
    pub const EXPORTABLE_DEFAULT: Self = Self::new(true, Some(KeyScope::Default));
    pub const EXPORTABLE: Self = Self::new(true, None);
    pub const MACHINE: Self = Self::new(false, Some(KeyScope::Machine));
    pub const USER: Self = Self::new(false, Some(KeyScope::User));

    /// Order in which profiles are tried by default.
    pub const FALLBACK_ORDER: [AccessProfile; 6] = [
        Self::EXPORTABLE_MACHINE,
        Self::EXPORTABLE_USER,
        Self::EXPORTABLE_DEFAULT,
        Self::EXPORTABLE,
        Self::MACHINE,
        Self::USER,
    ];

    pub const fn new(exportable: bool, scope: Option<KeyScope>) -> Self {
        Self { exportable, scope }
    }

    pub fn exportable(&self) -> bool {
        self.exportable
    }

    pub fn scope(&self) -> Option<KeyScope> {
        self.scope
    }
}

impl fmt::Display for AccessProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scope = match self.scope {
            Some(KeyScope::Machine) => Some("machine"),
            Some(KeyScope::User) => Some("user"),
            Some(KeyScope::Default) => Some("default"),
            None => None,
        };
        match (self.exportable, scope) {
            (true, Some(scope)) => write!(f, "exportable+{scope}"),
            (true, None) => f.write_str("exportable"),
            (false, Some(scope)) => write!(f, "{scope}"),
            (false, None) => f.write_str("none"),
        }
    }
}

/// Outcome of [`try_strategies`] when one strategy succeeded.
#[derive(Debug)]
pub struct StrategySuccess<P, T, E> {
    pub strategy: P,
    pub value: T,
    pub rejected: Vec<(P, E)>,
}

/// Outcome of [`try_strategies`] when every strategy failed.
#[derive(Debug)]
pub struct StrategyFailure<P, E> {
    attempts: Vec<(P, E)>,
}

impl<P, E> StrategyFailure<P, E> {
    pub fn attempts(&self) -> &[(P, E)] {
        &self.attempts
    }

    pub fn last(&self) -> Option<&(P, E)> {
        self.attempts.last()
    }

    pub fn into_attempts(self) -> Vec<(P, E)> {
        self.attempts
    }
}

/// Runs `attempt` for each strategy in order and returns the first success,
/// together with the failures recorded before it.
pub fn try_strategies<P, T, E, F>(
    strategies: &[P],
    mut attempt: F,
) -> Result<StrategySuccess<P, T, E>, StrategyFailure<P, E>>
where
    P: Copy,
    F: FnMut(P) -> Result<T, E>,
{
    let mut attempts = Vec::new();
    for &strategy in strategies {
        match attempt(strategy) {
            Ok(value) => {
                return Ok(StrategySuccess {
                    strategy,
                    value,
                    rejected: attempts,
                });
            }
            Err(err) => attempts.push((strategy, err)),
        }
    }
    Err(StrategyFailure { attempts })
}

/// How the RSA key inside a bundle was made usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySource {
    /// The key was used as stored.
    Native,
    /// The key was exported to DER and re-imported.
    Reexported,
}

const KEY_EXTRACTIONS: [KeySource; 2] = [KeySource::Native, KeySource::Reexported];

/// Where the PKCS#12 bytes come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CertificateSource {
    Bytes(Vec<u8>),
    Path(PathBuf),
}

impl CertificateSource {
    pub fn read(&self) -> Result<Cow<'_, [u8]>, CertificateError> {
        match self {
            CertificateSource::Bytes(bytes) => Ok(Cow::Borrowed(bytes)),
            CertificateSource::Path(path) => std::fs::read(path)
                .map(Cow::Owned)
                .map_err(|source| CertificateError::Io {
                    path: path.clone(),
                    source,
                }),
        }
    }
}

impl From<Vec<u8>> for CertificateSource {
    fn from(bytes: Vec<u8>) -> Self {
        CertificateSource::Bytes(bytes)
    }
}

impl From<PathBuf> for CertificateSource {
    fn from(path: PathBuf) -> Self {
        CertificateSource::Path(path)
    }
}

/// A loaded certificate and its RSA signing key.
pub struct CertificateHandle {
    private_key: PKey<Private>,
    certificate: X509,
    chain: Vec<X509>,
    subject: String,
    serial_number: String,
    thumbprint: String,
    profile: AccessProfile,
    key_source: KeySource,
}

impl fmt::Debug for CertificateHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateHandle")
            .field("subject", &self.subject)
            .field("serial_number", &self.serial_number)
            .field("thumbprint", &self.thumbprint)
            .field("profile", &self.profile)
            .field("key_source", &self.key_source)
            .finish_non_exhaustive()
    }
}

impl CertificateHandle {
    pub(crate) fn private_key(&self) -> &PKey<Private> {
        &self.private_key
    }

    pub fn has_private_key(&self) -> bool {
        self.private_key.rsa().is_ok()
    }

    pub fn certificate(&self) -> &X509 {
        &self.certificate
    }

    pub fn chain(&self) -> &[X509] {
        &self.chain
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Serial number as uppercase hex.
    pub fn serial_number(&self) -> &str {
        &self.serial_number
    }

    /// SHA-1 fingerprint of the certificate as uppercase hex.
    pub fn thumbprint(&self) -> &str {
        &self.thumbprint
    }

    pub fn profile(&self) -> AccessProfile {
        self.profile
    }

    pub fn key_source(&self) -> KeySource {
        self.key_source
    }

    /// DER encoding of the leaf certificate, base64 encoded for `X509Certificate`.
    pub fn certificate_base64(&self) -> Result<String, CertificateError> {
        let der = self
            .certificate
            .to_der()
            .map_err(|e| CertificateError::Encoding(e.to_string()))?;
        Ok(Base64::encode_string(&der))
    }
}

/// Opens PKCS#12 bundles through a [`CertificateStore`], trying each access profile in order.
#[derive(Debug, Clone)]
pub struct CertificateLoader<S = MemoryStore> {
    store: S,
    profiles: Vec<AccessProfile>,
}

impl CertificateLoader<MemoryStore> {
    pub fn new() -> Self {
        Self::with_store(MemoryStore)
    }
}

impl Default for CertificateLoader<MemoryStore> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: CertificateStore> CertificateLoader<S> {
    pub fn with_store(store: S) -> Self {
        Self {
            store,
            profiles: AccessProfile::FALLBACK_ORDER.to_vec(),
        }
    }

    pub fn with_profiles(mut self, profiles: impl Into<Vec<AccessProfile>>) -> Self {
        self.profiles = profiles.into();
        self
    }

    pub fn profiles(&self) -> &[AccessProfile] {
        &self.profiles
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn load(&self, bundle: &[u8], password: &str) -> Result<CertificateHandle, CertificateError> {
        let outcome = try_strategies(&self.profiles, |profile| {
            debug!(%profile, "opening certificate bundle");
            self.open_with(bundle, password, profile)
        });

        match outcome {
            Ok(success) => {
                for (profile, error) in &success.rejected {
                    warn!(%profile, %error, "access profile rejected");
                }
                let handle = success.value;
                info!(
                    subject = handle.subject(),
                    thumbprint = handle.thumbprint(),
                    profile = %success.strategy,
                    "certificate loaded"
                );
                Ok(handle)
            }
            Err(failure) => {
                let attempts: Vec<ProfileFailure> = failure
                    .into_attempts()
                    .into_iter()
                    .map(|(profile, error)| ProfileFailure { profile, error })
                    .collect();
                let last_error = attempts
                    .last()
                    .map(|failure| failure.to_string())
                    .unwrap_or_else(|| "no access profiles configured".to_string());
                warn!(attempts = attempts.len(), %last_error, "certificate could not be loaded");
                if attempts.iter().any(|failure| failure.error.bundle_opened()) {
                    Err(CertificateError::KeyExtraction {
                        attempts,
                        message: last_error,
                    })
                } else {
                    Err(CertificateError::LoadFailure {
                        attempts,
                        last_error,
                    })
                }
            }
        }
    }

    fn open_with(
        &self,
        bundle: &[u8],
        password: &str,
        profile: AccessProfile,
    ) -> Result<CertificateHandle, ProfileError> {
        let opened = self.store.open(bundle, password, profile)?;
        let key = opened.private_key.ok_or(ProfileError::NoPrivateKey)?;
        let (key_source, private_key) = usable_rsa_key(&key, opened.legacy_key, profile)?;
        let certificate = opened.certificate;

        let serial_number = certificate
            .serial_number()
            .to_bn()
            .and_then(|bn| bn.to_hex_str().map(|hex| hex.to_string()))
            .map_err(|e| ProfileError::Metadata(e.to_string()))?;
        let thumbprint =
            thumbprint(&certificate).map_err(|e| ProfileError::Metadata(e.to_string()))?;

        Ok(CertificateHandle {
            private_key,
            subject: distinguished_name(certificate.subject_name()),
            serial_number,
            thumbprint,
            certificate,
            chain: opened.chain,
            profile,
            key_source,
        })
    }
}

/// Finds a form of `key` that signs with SHA-256. Re-exporting the key is only
/// attempted when `profile` allows export.
fn usable_rsa_key(
    key: &PKey<Private>,
    legacy_key: bool,
    profile: AccessProfile,
) -> Result<(KeySource, PKey<Private>), ProfileError> {
    try_strategies(&KEY_EXTRACTIONS, |source| {
        let candidate = match source {
            KeySource::Native if legacy_key => {
                return Err("stored key cannot produce SHA-256 signatures".to_string());
            }
            KeySource::Native => key.rsa().and_then(PKey::from_rsa),
            KeySource::Reexported if !profile.exportable() => {
                return Err(format!("key cannot be exported under profile {profile}"));
            }
            KeySource::Reexported => key
                .private_key_to_der()
                .and_then(|der| Rsa::private_key_from_der(&der))
                .and_then(PKey::from_rsa),
        }
        .map_err(|e| e.to_string())?;
        probe_sha256_signature(&candidate).map_err(|e| e.to_string())?;
        Ok::<_, String>(candidate)
    })
    .map(|success| {
        if success.strategy == KeySource::Reexported {
            debug!(%profile, "key re-exported for SHA-256 signing");
        }
        (success.strategy, success.value)
    })
    .map_err(|failure| {
        let message = failure
            .attempts()
            .iter()
            .map(|(source, error)| format!("{source:?}: {error}"))
            .collect::<Vec<_>>()
            .join("; ");
        ProfileError::KeyExtraction(message)
    })
}

fn probe_sha256_signature(key: &PKey<Private>) -> Result<(), ErrorStack> {
    let mut signer = Signer::new(MessageDigest::sha256(), key)?;
    signer.update(b"sifen")?;
    signer.sign_to_vec().map(|_| ())
}

pub(crate) fn thumbprint(certificate: &X509Ref) -> Result<String, ErrorStack> {
    let digest = certificate.digest(MessageDigest::sha1())?;
    Ok(to_hex(&digest).to_ascii_uppercase())
}

fn distinguished_name(name: &X509NameRef) -> String {
    name.entries()
        .map(|entry| {
            let key = entry.object().nid().short_name().unwrap_or("?");
            let value = entry
                .data()
                .as_utf8()
                .map(|value| value.to_string())
                .unwrap_or_default();
            format!("{key}={value}")
        })
        .collect::<Vec<_>>()
        .join(", ")
}
