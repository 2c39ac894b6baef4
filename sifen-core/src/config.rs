//! Configuration and environment selection.
use serde::{Deserialize, Serialize};
use std::{str::FromStr, time::Duration};
use thiserror::Error;

/// Environment variable that overrides the web service base URL (used by tests and proxies).
pub const BASE_URL_ENV: &str = "SIFEN_BASE_URL";

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_REDIRECTS: usize = 3;
pub const DEFAULT_USER_AGENT: &str = "Java/1.8.0_341";

/// SIFEN environment selection for web service and QR endpoints.
/// - Test: the authority's homologation environment (`sifen-test`).
/// - Production: the live environment.
/// # Examples
/// ```rust
/// use std::str::FromStr;
/// use sifen_core::config::Environment;
///
/// let env = Environment::from_str("prod")?;
/// assert_eq!(env, Environment::Production);
/// # Ok::<(), sifen_core::config::EnvironmentParseError>(())
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Test,
    Production,
}

/// Error returned when parsing an [`Environment`] from a string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvironmentParseError {
    #[error("invalid environment: {input}")]
    Invalid { input: String },
}

impl FromStr for Environment {
    type Err = EnvironmentParseError;
    fn from_str(env: &str) -> Result<Environment, EnvironmentParseError> {
        match env.trim().to_ascii_lowercase().as_str() {
            "test" | "dev" => Ok(Environment::Test),
            "prod" | "production" => Ok(Environment::Production),
            _ => Err(EnvironmentParseError::Invalid {
                input: env.to_string(),
            }),
        }
    }
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Test => "test",
            Environment::Production => "production",
        }
    }

    pub fn base_url(&self) -> &'static str {
        match self {
            Environment::Test => "https://sifen-test.set.gov.py",
            Environment::Production => "https://sifen.set.gov.py",
        }
    }

    /// Public consultation URL that prefixes every QR payload.
    pub fn qr_base_url(&self) -> &'static str {
        match self {
            Environment::Test => "https://ekuatia.set.gov.py/consultas-test/qr?",
            Environment::Production => "https://ekuatia.set.gov.py/consultas/qr?",
        }
    }
}

/// Web services exposed by the authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Service {
    BatchSubmission,
    DocumentSubmission,
    Event,
    TaxIdLookup,
    DocumentLookup,
    BatchLookup,
}

impl Service {
    pub fn path(&self) -> &'static str {
        match self {
            Service::BatchSubmission => "/de/ws/async/recibe-lote",
            Service::DocumentSubmission => "/de/ws/sync/recibe-de",
            Service::Event => "/de/ws/eventos/evento",
            Service::TaxIdLookup => "/de/ws/consultas/consulta-ruc",
            Service::DocumentLookup => "/de/ws/consultas/consulta-de",
            Service::BatchLookup => "/de/ws/consultas/consulta-lote",
        }
    }
}

/// Media type profile used for outgoing envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentProfile {
    #[default]
    Soap12,
    PlainXml,
}

impl ContentProfile {
    pub fn content_type(&self) -> &'static str {
        match self {
            ContentProfile::Soap12 => "application/soap+xml; charset=utf-8",
            ContentProfile::PlainXml => "application/xml; charset=utf-8",
        }
    }
}

impl FromStr for ContentProfile {
    type Err = EnvironmentParseError;
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "soap" | "soap12" => Ok(ContentProfile::Soap12),
            "xml" | "plain" | "plain_xml" => Ok(ContentProfile::PlainXml),
            _ => Err(EnvironmentParseError::Invalid {
                input: value.to_string(),
            }),
        }
    }
}

/// Client configuration shared by the pipeline and the transport.
///
/// # Examples
/// ```rust
/// use sifen_core::config::{Config, Environment, Service};
///
/// let config = Config::new(Environment::Test).with_base_url("http://localhost:8080/");
/// assert_eq!(
///     config.endpoint(Service::BatchSubmission),
///     "http://localhost:8080/de/ws/async/recibe-lote"
/// );
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    env: Environment,
    #[serde(default)]
    base_url: Option<String>,
    #[serde(default = "default_timeout_ms")]
    timeout_ms: u64,
    #[serde(default = "default_max_redirects")]
    max_redirects: usize,
    #[serde(default = "default_user_agent")]
    user_agent: String,
    #[serde(default)]
    content_profile: ContentProfile,
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT.as_millis() as u64
}

fn default_max_redirects() -> usize {
    DEFAULT_MAX_REDIRECTS
}

fn default_user_agent() -> String {
    DEFAULT_USER_AGENT.to_string()
}

impl Config {
    pub fn new(env: Environment) -> Self {
        Self {
            env,
            base_url: None,
            timeout_ms: default_timeout_ms(),
            max_redirects: DEFAULT_MAX_REDIRECTS,
            user_agent: default_user_agent(),
            content_profile: ContentProfile::default(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    /// Request timeout, kept to millisecond precision. A zero timeout becomes 1 ms.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX).max(1);
        self
    }

    pub fn with_max_redirects(mut self, max_redirects: usize) -> Self {
        self.max_redirects = max_redirects;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_content_profile(mut self, profile: ContentProfile) -> Self {
        self.content_profile = profile;
        self
    }

    pub fn env(&self) -> Environment {
        self.env
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn max_redirects(&self) -> usize {
        self.max_redirects
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    pub fn content_profile(&self) -> ContentProfile {
        self.content_profile
    }

    /// Resolved base URL without a trailing slash.
    ///
    /// An explicit override wins, then [`BASE_URL_ENV`], then the environment default.
    pub fn base_url(&self) -> String {
        self.base_url_with(std::env::var(BASE_URL_ENV).ok())
    }

    fn base_url_with(&self, env_override: Option<String>) -> String {
        let base = self
            .base_url
            .clone()
            .or_else(|| env_override.filter(|v| !v.trim().is_empty()))
            .unwrap_or_else(|| self.env.base_url().to_string());
        base.trim().trim_end_matches('/').to_string()
    }

    pub fn endpoint(&self, service: Service) -> String {
        format!("{}{}", self.base_url(), service.path())
    }

    pub fn qr_base_url(&self) -> &'static str {
        self.env.qr_base_url()
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::new(Environment::Test)
    }
}
