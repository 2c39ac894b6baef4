//! HTTPS transport to the SIFEN SOAP web services.
use crate::config::{Config, ContentProfile};
use reqwest::{
    Client, Identity, StatusCode,
    header::{ACCEPT, CONTENT_TYPE},
    redirect::Policy,
    tls::Version,
};
use serde::Serialize;
use std::{error::Error as StdError, future::Future, time::Duration};
use thiserror::Error;
use tracing::{debug, warn};

/// Classification of failures that produced no HTTP response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FailureKind {
    Timeout,
    Connect,
    Redirect,
    Cancelled,
    Body,
    Request,
}

/// Errors returned by the transport.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("invalid client identity: {0}")]
    Identity(String),
    #[error("HTTP client error: {0}")]
    Client(String),
    #[error("transport failure ({kind:?}): {message}")]
    Failure { kind: FailureKind, message: String },
    #[error("HTTP error {status}")]
    Http { status: u16, body: String },
}

impl TransportError {
    pub fn status(&self) -> Option<u16> {
        match self {
            TransportError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Response body returned along with a non-success status.
    pub fn body(&self) -> Option<&str> {
        match self {
            TransportError::Http { body, .. } => Some(body),
            _ => None,
        }
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            TransportError::Failure { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Failure { .. } => true,
            TransportError::Http { status, .. } => *status >= 500,
            TransportError::Identity(_) | TransportError::Client(_) => false,
        }
    }

    fn from_reqwest(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            FailureKind::Timeout
        } else if err.is_connect() {
            FailureKind::Connect
        } else if err.is_redirect() {
            FailureKind::Redirect
        } else if err.is_body() || err.is_decode() {
            FailureKind::Body
        } else {
            FailureKind::Request
        };
        TransportError::Failure {
            kind,
            message: error_chain(&err),
        }
    }
}

fn error_chain(err: &dyn StdError) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

/// Body of a rejected response. A body that cannot be read is logged and reported as empty.
fn error_body<E: StdError>(body: Result<String, E>, url: &str, status: u16) -> String {
    body.unwrap_or_else(|err| {
        warn!(url, status, error = %error_chain(&err), "failed to read error response body");
        String::new()
    })
}

/// Connection settings for [`TransportClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportOptions {
    pub timeout: Duration,
    pub max_redirects: usize,
    pub user_agent: String,
    pub content_profile: ContentProfile,
}

impl Default for TransportOptions {
    fn default() -> Self {
        TransportOptions::from(&Config::default())
    }
}

impl From<&Config> for TransportOptions {
    fn from(config: &Config) -> Self {
        Self {
            timeout: config.timeout(),
            max_redirects: config.max_redirects(),
            user_agent: config.user_agent().to_string(),
            content_profile: config.content_profile(),
        }
    }
}

/// POSTs envelopes to the authority over TLS 1.2+ with mutual authentication.
///
/// Server certificates are accepted without validation against the local trust
/// store: the authority's chain is managed outside it, and the session is
/// authenticated by the client certificate.
///
/// # Examples
/// ```rust,no_run
/// use sifen_core::api::{TransportClient, TransportOptions};
///
/// # async fn run() -> Result<(), sifen_core::api::TransportError> {
/// let bundle = std::fs::read("firma.p12").expect("bundle");
/// let client = TransportClient::with_pkcs12(&bundle, "secret", &TransportOptions::default())?;
/// let body = client
///     .send("https://sifen-test.set.gov.py/de/ws/consultas/consulta-ruc", "<soap:Envelope/>")
///     .await?;
/// # let _ = body;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct TransportClient {
    client: Client,
    content_type: &'static str,
}

impl TransportClient {
    /// Client without a client certificate.
    pub fn new(options: &TransportOptions) -> Result<Self, TransportError> {
        Self::build(None, options)
    }

    /// Client presenting the PKCS#12 identity during the TLS handshake.
    pub fn with_pkcs12(
        bundle: &[u8],
        password: &str,
        options: &TransportOptions,
    ) -> Result<Self, TransportError> {
        let identity = Identity::from_pkcs12_der(bundle, password)
            .map_err(|e| TransportError::Identity(error_chain(&e)))?;
        Self::build(Some(identity), options)
    }

    fn build(identity: Option<Identity>, options: &TransportOptions) -> Result<Self, TransportError> {
        let mut builder = Client::builder()
            .use_native_tls()
            .min_tls_version(Version::TLS_1_2)
            .danger_accept_invalid_certs(true)
            .redirect(Policy::limited(options.max_redirects))
            .timeout(options.timeout)
            .user_agent(options.user_agent.clone());
        if let Some(identity) = identity {
            builder = builder.identity(identity);
        }
        let client = builder
            .build()
            .map_err(|e| TransportError::Client(error_chain(&e)))?;
        Ok(Self {
            client,
            content_type: options.content_profile.content_type(),
        })
    }

    pub fn content_type(&self) -> &'static str {
        self.content_type
    }

    /// Sends `envelope` and returns the body of a `200 OK` response.
    ///
    /// # Errors
    /// [`TransportError::Http`] carries the status and body of any other response;
    /// [`TransportError::Failure`] covers requests that produced no response.
    pub async fn send(&self, url: &str, envelope: &str) -> Result<String, TransportError> {
        debug!(url, bytes = envelope.len(), "posting envelope");
        let response = self
            .client
            .post(url)
            .header(CONTENT_TYPE, self.content_type)
            .header(ACCEPT, "*/*")
            .body(envelope.to_owned())
            .send()
            .await
            .map_err(TransportError::from_reqwest)?;

        let status = response.status();
        if status != StatusCode::OK {
            let body = error_body(response.text().await, url, status.as_u16());
            warn!(url, status = status.as_u16(), "endpoint rejected envelope");
            return Err(TransportError::Http {
                status: status.as_u16(),
                body,
            });
        }
        let body = response
            .text()
            .await
            .map_err(TransportError::from_reqwest)?;
        debug!(url, bytes = body.len(), "response received");
        Ok(body)
    }

    /// Like [`Self::send`], abandoning the request once `cancel` completes.
    pub async fn send_cancellable<F>(
        &self,
        url: &str,
        envelope: &str,
        cancel: F,
    ) -> Result<String, TransportError>
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            result = self.send(url, envelope) => result,
            () = cancel => {
                warn!(url, "request cancelled");
                Err(TransportError::Failure {
                    kind: FailureKind::Cancelled,
                    message: "request cancelled by caller".to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    fn try_start_server() -> Option<MockServer> {
        std::panic::catch_unwind(MockServer::start).ok()
    }

    fn options() -> TransportOptions {
        TransportOptions {
            timeout: Duration::from_secs(5),
            ..TransportOptions::default()
        }
    }

    #[test]
    fn send_posts_soap_envelope_and_returns_body() {
        let server = match try_start_server() {
            Some(server) => server,
            None => return,
        };
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/de/ws/consultas/consulta-ruc")
                .header("content-type", "application/soap+xml; charset=utf-8")
                .header("user-agent", "Java/1.8.0_341")
                .body_contains("<dRUCCons>80012345</dRUCCons>");
            then.status(200)
                .header("content-type", "application/soap+xml")
                .body("<ok/>");
        });

        let rt = tokio::runtime::Runtime::new().expect("runtime");
        let body = rt.block_on(async {
            let client = TransportClient::new(&options()).expect("client");
            client
                .send(
                    &server.url("/de/ws/consultas/consulta-ruc"),
                    "<env><dRUCCons>80012345</dRUCCons></env>",
                )
                .await
        });
        mock.assert();
        assert_eq!(body.expect("body"), "<ok/>");
    }

    #[test]
    fn non_success_status_keeps_body() {
        let server = match try_start_server() {
            Some(server) => server,
            None => return,
        };
        let mock = server.mock(|when, then| {
            when.method(POST).path("/de/ws/async/recibe-lote");
            then.status(503).body("<html>maintenance</html>");
        });

        let rt = tokio::runtime::Runtime::new().expect("runtime");
        let result = rt.block_on(async {
            TransportClient::new(&options())
                .expect("client")
                .send(&server.url("/de/ws/async/recibe-lote"), "<env/>")
                .await
        });
        mock.assert();
        match result {
            Err(err @ TransportError::Http { .. }) => {
                assert_eq!(err.status(), Some(503));
                assert_eq!(err.body(), Some("<html>maintenance</html>"));
                assert!(err.is_retryable());
            }
            other => panic!("expected Http error, got {other:?}"),
        }
    }

    #[test]
    fn plain_xml_profile_changes_content_type() {
        let server = match try_start_server() {
            Some(server) => server,
            None => return,
        };
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/svc")
                .header("content-type", "application/xml; charset=utf-8");
            then.status(200).body("<ok/>");
        });
        let options = TransportOptions {
            content_profile: ContentProfile::PlainXml,
            ..options()
        };
        let rt = tokio::runtime::Runtime::new().expect("runtime");
        let result = rt.block_on(async {
            TransportClient::new(&options)
                .expect("client")
                .send(&server.url("/svc"), "<env/>")
                .await
        });
        mock.assert();
        assert!(result.is_ok());
    }

    #[test]
    fn redirects_beyond_limit_fail() {
        let server = match try_start_server() {
            Some(server) => server,
            None => return,
        };
        let _loop = server.mock(|when, then| {
            when.method(POST).path("/loop");
            then.status(307).header("location", server.url("/loop"));
        });
        let rt = tokio::runtime::Runtime::new().expect("runtime");
        let result = rt.block_on(async {
            TransportClient::new(&options())
                .expect("client")
                .send(&server.url("/loop"), "<env/>")
                .await
        });
        match result {
            Err(err) => assert_eq!(err.failure_kind(), Some(FailureKind::Redirect)),
            Ok(body) => panic!("expected redirect failure, got {body}"),
        }
    }

    #[test]
    fn unreachable_host_is_a_transport_failure() {
        let rt = tokio::runtime::Runtime::new().expect("runtime");
        let result = rt.block_on(async {
            TransportClient::new(&options())
                .expect("client")
                .send("http://127.0.0.1:9/unreachable", "<env/>")
                .await
        });
        match result {
            Err(err @ TransportError::Failure { .. }) => assert!(err.is_retryable()),
            other => panic!("expected transport failure, got {other:?}"),
        }
    }

    #[test]
    fn cancellation_returns_cancelled_failure() {
        let server = match try_start_server() {
            Some(server) => server,
            None => return,
        };
        server.mock(|when, then| {
            when.method(POST).path("/slow");
            then.status(200).delay(Duration::from_secs(3)).body("<late/>");
        });
        let rt = tokio::runtime::Runtime::new().expect("runtime");
        let result = rt.block_on(async {
            TransportClient::new(&options())
                .expect("client")
                .send_cancellable(
                    &server.url("/slow"),
                    "<env/>",
                    tokio::time::sleep(Duration::from_millis(100)),
                )
                .await
        });
        match result {
            Err(err) => assert_eq!(err.failure_kind(), Some(FailureKind::Cancelled)),
            Ok(body) => panic!("expected cancellation, got {body}"),
        }
    }

    #[test]
    fn invalid_identity_is_rejected() {
        let result = TransportClient::with_pkcs12(b"not pkcs12", "pw", &options());
        assert!(matches!(result, Err(TransportError::Identity(_))));
    }

    #[test]
    fn unreadable_error_body_becomes_empty() {
        let unreadable: Result<String, std::io::Error> = Err(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "connection reset",
        ));
        assert_eq!(error_body(unreadable, "http://localhost/x", 502), "");
        let readable: Result<String, std::io::Error> = Ok("<fault/>".into());
        assert_eq!(error_body(readable, "http://localhost/x", 502), "<fault/>");
    }
}
