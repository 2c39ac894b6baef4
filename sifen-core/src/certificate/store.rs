use super::{AccessProfile, KeyScope, thumbprint};
use openssl::{
    pkcs12::Pkcs12,
    pkey::{PKey, Private},
    x509::X509,
};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("PKCS#12 bundle could not be opened: {0}")]
    Pkcs12(String),
    #[error("PKCS#12 bundle contains no certificate")]
    MissingCertificate,
    #[error("access profile {0} is not available in this store")]
    UnsupportedProfile(AccessProfile),
    #[error("certificate store lock poisoned")]
    Poisoned,
}

/// Contents of an opened PKCS#12 bundle.
#[derive(Clone)]
pub struct OpenedBundle {
    pub private_key: Option<PKey<Private>>,
    pub certificate: X509,
    pub chain: Vec<X509>,
    /// The key is held by a provider that cannot produce SHA-256 signatures as
    /// stored; it only becomes usable once exported and re-imported.
    pub legacy_key: bool,
}

impl std::fmt::Debug for OpenedBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenedBundle")
            .field("has_private_key", &self.private_key.is_some())
            .field("chain_len", &self.chain.len())
            .field("legacy_key", &self.legacy_key)
            .finish_non_exhaustive()
    }
}

/// Backend that opens PKCS#12 bundles under a given access profile.
pub trait CertificateStore {
    fn open(
        &self,
        bundle: &[u8],
        password: &str,
        profile: AccessProfile,
    ) -> Result<OpenedBundle, StoreError>;
}

impl<S: CertificateStore + ?Sized> CertificateStore for &S {
    fn open(
        &self,
        bundle: &[u8],
        password: &str,
        profile: AccessProfile,
    ) -> Result<OpenedBundle, StoreError> {
        (**self).open(bundle, password, profile)
    }
}

impl<S: CertificateStore + ?Sized> CertificateStore for Arc<S> {
    fn open(
        &self,
        bundle: &[u8],
        password: &str,
        profile: AccessProfile,
    ) -> Result<OpenedBundle, StoreError> {
        (**self).open(bundle, password, profile)
    }
}

pub(crate) fn parse_pkcs12(bundle: &[u8], password: &str) -> Result<OpenedBundle, StoreError> {
    let parsed = Pkcs12::from_der(bundle)
        .and_then(|p12| p12.parse2(password))
        .map_err(|e| StoreError::Pkcs12(e.to_string()))?;
    let certificate = parsed.cert.ok_or(StoreError::MissingCertificate)?;
    let chain = parsed
        .ca
        .map(|stack| stack.into_iter().collect())
        .unwrap_or_default();
    Ok(OpenedBundle {
        private_key: parsed.pkey,
        certificate,
        chain,
        legacy_key: false,
    })
}

/// Opens bundles in memory. Every access profile behaves the same.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryStore;

impl CertificateStore for MemoryStore {
    fn open(
        &self,
        bundle: &[u8],
        password: &str,
        _profile: AccessProfile,
    ) -> Result<OpenedBundle, StoreError> {
        parse_pkcs12(bundle, password)
    }
}

/// Shared identity store keyed by certificate thumbprint.
///
/// Importing the same bundle twice keeps a single entry. Only profiles whose
/// scope the store was created with are accepted; profiles without a scope, or
/// with [`KeyScope::Default`], resolve to the first configured scope.
#[derive(Debug)]
pub struct PersonalStore {
    scopes: Vec<KeyScope>,
    legacy_keys: bool,
    entries: Mutex<HashMap<String, OpenedBundle>>,
}

impl PersonalStore {
    pub fn new(scopes: impl Into<Vec<KeyScope>>) -> Self {
        Self {
            scopes: scopes.into(),
            legacy_keys: false,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Marks imported keys as held by a legacy provider, so they can only sign after
    /// being exported under an exportable profile.
    pub fn with_legacy_keys(mut self, legacy_keys: bool) -> Self {
        self.legacy_keys = legacy_keys;
        self
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, thumbprint: &str) -> bool {
        self.entries
            .lock()
            .map(|entries| entries.contains_key(&thumbprint.to_ascii_uppercase()))
            .unwrap_or(false)
    }

    fn accepts(&self, profile: AccessProfile) -> bool {
        match profile.scope() {
            None | Some(KeyScope::Default) => !self.scopes.is_empty(),
            Some(scope) => self.scopes.contains(&scope),
        }
    }
}

/// Result of [`PersonalStore::import`].
#[derive(Debug, Clone)]
pub struct Imported {
    pub bundle: OpenedBundle,
    pub thumbprint: String,
    /// `false` when an entry with the same thumbprint was already present.
    pub newly_imported: bool,
}

impl PersonalStore {
    /// Adds the identity unless its thumbprint is already present.
    pub fn import(&self, bundle: &[u8], password: &str) -> Result<Imported, StoreError> {
        let mut opened = parse_pkcs12(bundle, password)?;
        opened.legacy_key = self.legacy_keys;
        let key = thumbprint(&opened.certificate).map_err(|e| StoreError::Pkcs12(e.to_string()))?;

        let mut entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        if let Some(existing) = entries.get(&key) {
            debug!(thumbprint = %key, "identity already present in store");
            return Ok(Imported {
                bundle: existing.clone(),
                thumbprint: key,
                newly_imported: false,
            });
        }
        debug!(thumbprint = %key, "importing identity");
        entries.insert(key.clone(), opened.clone());
        Ok(Imported {
            bundle: opened,
            thumbprint: key,
            newly_imported: true,
        })
    }
}

impl CertificateStore for PersonalStore {
    fn open(
        &self,
        bundle: &[u8],
        password: &str,
        profile: AccessProfile,
    ) -> Result<OpenedBundle, StoreError> {
        if !self.accepts(profile) {
            return Err(StoreError::UnsupportedProfile(profile));
        }
        self.import(bundle, password).map(|imported| imported.bundle)
    }
}
