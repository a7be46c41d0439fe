//! Single timed GET against one URL.
//!
//! The actual HTTP exchange sits behind [`Transport`] so the pool can be
//! driven by scripted transports in tests. The deadline lives in
//! [`FetchClient`], not in the transport: when it fires, the in-flight
//! future is dropped, which aborts the request.

use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use reqwest::header::{HeaderMap, ACCEPT, CONTENT_TYPE};
use reqwest::Client;
use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::io;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

use crate::cli::config::FetchSettings;
use crate::storage::ErrorKind;

const MAX_REDIRECTS: usize = 10;

/// Errors that can occur during a fetch
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request timed out after {}ms", .after.as_millis())]
    Timeout {
        after: Duration,
        head: Option<ResponseHead>,
    },

    #[error("{message}")]
    Network {
        code: String,
        message: String,
        head: Option<ResponseHead>,
        #[source]
        source: Option<reqwest::Error>,
    },
}

impl FetchError {
    /// Build a network error without an underlying transport error
    pub fn network(code: impl Into<String>, message: impl Into<String>) -> Self {
        FetchError::Network {
            code: code.into(),
            message: message.into(),
            head: None,
            source: None,
        }
    }

    pub fn timeout(after: Duration) -> Self {
        FetchError::Timeout { after, head: None }
    }

    /// Status and headers, if the response head arrived before the failure
    pub fn head(&self) -> Option<&ResponseHead> {
        match self {
            FetchError::Timeout { head, .. } | FetchError::Network { head, .. } => head.as_ref(),
        }
    }

    /// Fill in the response head unless the error already carries one
    pub fn with_head(mut self, received: Option<ResponseHead>) -> Self {
        match &mut self {
            FetchError::Timeout { head, .. } | FetchError::Network { head, .. } => {
                if head.is_none() {
                    *head = received;
                }
            }
        }
        self
    }

    /// Stable code persisted on the error record
    pub fn code(&self) -> &str {
        match self {
            FetchError::Timeout { .. } => "TIMEOUT",
            FetchError::Network { code, .. } => code,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            FetchError::Timeout { .. } => ErrorKind::Timeout,
            FetchError::Network { .. } => ErrorKind::Network,
        }
    }

    fn from_reqwest(err: reqwest::Error) -> Self {
        let code = network_code(&err).to_string();
        FetchError::Network {
            code,
            message: render_chain(&err),
            head: None,
            source: Some(err),
        }
    }
}

/// Response of a completed GET
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: u16,
    /// URL after redirects
    pub final_url: String,
    pub content_type: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub body: String,
    pub elapsed: Duration,
}

/// What is known about a response once its head has been read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub final_url: String,
    pub content_type: Option<String>,
    pub headers: BTreeMap<String, String>,
}

/// Set by a transport as soon as the response head is known
pub type HeadSlot = OnceLock<ResponseHead>;

impl FetchResponse {
    pub fn from_head(head: ResponseHead, body: String) -> Self {
        Self {
            status: head.status,
            final_url: head.final_url,
            content_type: head.content_type,
            headers: head.headers,
            body,
            elapsed: Duration::ZERO,
        }
    }

    pub fn charset(&self) -> Option<String> {
        extract_charset(self.content_type.as_deref())
    }

    /// Size of the decoded body in bytes
    pub fn bytes(&self) -> usize {
        self.body.len()
    }
}

/// Pull `charset=...` out of a content-type header value
pub fn extract_charset(content_type: Option<&str>) -> Option<String> {
    static CHARSET: OnceLock<Option<Regex>> = OnceLock::new();
    let re = CHARSET
        .get_or_init(|| Regex::new(r"(?i)charset=([^;]+)").ok())
        .as_ref()?;

    let captures = re.captures(content_type?)?;
    let charset = captures.get(1)?.as_str().trim();
    if charset.is_empty() {
        None
    } else {
        Some(charset.to_string())
    }
}

/// Raw HTTP exchange, without any deadline.
///
/// Implementations store the response head in `head` before reading the
/// body, so a failure or deadline during the body read can still report it.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, url: &str, head: &HeadSlot) -> Result<FetchResponse, FetchError>;
}

/// reqwest-backed transport
pub struct ReqwestTransport {
    client: Client,
    accept: String,
}

impl ReqwestTransport {
    pub fn new(settings: &FetchSettings) -> Result<Self> {
        let client = Client::builder()
            .user_agent(&settings.user_agent)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            accept: settings.accept.clone(),
        })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn get(&self, url: &str, head: &HeadSlot) -> Result<FetchResponse, FetchError> {
        let response = self
            .client
            .get(url)
            .header(ACCEPT, &self.accept)
            .send()
            .await
            .map_err(FetchError::from_reqwest)?;

        let received = ResponseHead {
            status: response.status().as_u16(),
            final_url: response.url().to_string(),
            content_type: response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            headers: collect_headers(response.headers()),
        };
        let _ = head.set(received.clone());

        let body = response.text().await.map_err(FetchError::from_reqwest)?;

        Ok(FetchResponse::from_head(received, body))
    }
}

/// Timed, cancellable fetch over a shared transport
#[derive(Clone)]
pub struct FetchClient {
    transport: Arc<dyn Transport>,
    default_timeout: Duration,
}

impl FetchClient {
    pub fn new(transport: Arc<dyn Transport>, default_timeout: Duration) -> Self {
        Self {
            transport,
            default_timeout,
        }
    }

    /// Client over the real HTTP transport
    pub fn http(settings: &FetchSettings) -> Result<Self> {
        let transport = ReqwestTransport::new(settings)?;
        Ok(Self::new(Arc::new(transport), settings.timeout()))
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// GET `url`, giving up after `timeout` (or the default)
    pub async fn fetch(&self, url: &str, timeout: Option<Duration>) -> Result<FetchResponse, FetchError> {
        let timeout = timeout.unwrap_or(self.default_timeout);
        let started = Instant::now();

        let head = HeadSlot::new();
        let outcome = tokio::time::timeout(timeout, self.transport.get(url, &head)).await;

        let mut response = match outcome {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => return Err(err.with_head(head.into_inner())),
            Err(_) => {
                debug!("Fetch of {} aborted after {:?}", url, timeout);
                return Err(FetchError::timeout(timeout).with_head(head.into_inner()));
            }
        };

        response.elapsed = started.elapsed();
        debug!("Fetched {} ({}) in {:?}", url, response.status, response.elapsed);

        Ok(response)
    }
}

fn collect_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut collected: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        collected
            .entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert(value);
    }
    collected
}

/// "outer: inner: innermost"
pub fn render_chain(err: &(dyn StdError + 'static)) -> String {
    let mut rendered = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !rendered.contains(&text) {
            rendered.push_str(": ");
            rendered.push_str(&text);
        }
        source = cause.source();
    }
    rendered
}

fn network_code(err: &reqwest::Error) -> &'static str {
    let mut source: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(cause) = source {
        if let Some(io_err) = cause.downcast_ref::<io::Error>() {
            match io_err.kind() {
                io::ErrorKind::ConnectionRefused => return "ECONNREFUSED",
                io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted => return "ECONNRESET",
                io::ErrorKind::TimedOut => return "ETIMEDOUT",
                _ => {}
            }
        }
        source = cause.source();
    }

    let chain = render_chain(err).to_lowercase();
    if chain.contains("dns error") || chain.contains("failed to lookup address") {
        "ENOTFOUND"
    } else if chain.contains("certificate") || chain.contains("tls") {
        "ECERT"
    } else if err.is_redirect() {
        "EREDIRECT"
    } else if err.is_body() || err.is_decode() {
        "EBODY"
    } else if err.is_connect() {
        "ECONNECT"
    } else {
        "EREQUEST"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(timeout: Duration) -> FetchClient {
        let settings = FetchSettings {
            timeout_ms: timeout.as_millis() as u64,
            ..FetchSettings::default()
        };
        FetchClient::http(&settings).unwrap()
    }

    #[test]
    fn test_extract_charset() {
        assert_eq!(
            extract_charset(Some("text/html; charset=UTF-8")),
            Some("UTF-8".to_string())
        );
        assert_eq!(
            extract_charset(Some("text/html; Charset= iso-8859-1 ; foo=bar")),
            Some("iso-8859-1".to_string())
        );
        assert_eq!(extract_charset(Some("text/html")), None);
        assert_eq!(extract_charset(None), None);
    }

    #[tokio::test]
    async fn test_fetch_success_collects_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/page"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/html; charset=utf-8")
                    .insert_header("x-test", "yes")
                    .set_body_string("<title>Hi</title>"),
            )
            .mount(&server)
            .await;

        let response = client(Duration::from_secs(5))
            .fetch(&format!("{}/page", server.uri()), None)
            .await
            .unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(response.body, "<title>Hi</title>");
        assert_eq!(response.bytes(), 17);
        assert_eq!(response.charset(), Some("utf-8".to_string()));
        assert_eq!(response.headers.get("x-test").map(String::as_str), Some("yes"));
        assert!(response.final_url.ends_with("/page"));
    }

    #[tokio::test]
    async fn test_sends_identifying_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ua"))
            .and(wiremock::matchers::header(
                "user-agent",
                FetchSettings::default().user_agent.as_str(),
            ))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let response = client(Duration::from_secs(5))
            .fetch(&format!("{}/ua", server.uri()), None)
            .await
            .unwrap();
        assert_eq!(response.status, 200);
    }

    #[tokio::test]
    async fn test_error_status_is_not_a_fetch_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404).set_body_string("missing"))
            .mount(&server)
            .await;

        let response = client(Duration::from_secs(5))
            .fetch(&format!("{}/gone", server.uri()), None)
            .await
            .unwrap();
        assert_eq!(response.status, 404);
    }

    #[tokio::test]
    async fn test_slow_response_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;

        let err = client(Duration::from_secs(5))
            .fetch(&format!("{}/slow", server.uri()), Some(Duration::from_millis(100)))
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::Timeout { .. }));
        assert!(err.head().is_none());
        assert_eq!(err.code(), "TIMEOUT");
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    /// Serves one response whose body stops short of its content-length
    fn truncated_body_server() -> std::net::SocketAddr {
        use std::io::{Read, Write};

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf);
                let _ = stream.write_all(
                    b"HTTP/1.1 200 OK\r\ncontent-type: text/html\r\ncontent-length: 100\r\n\r\n<title>cut",
                );
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_body_failure_keeps_response_head() {
        let addr = truncated_body_server();

        let err = client(Duration::from_secs(5))
            .fetch(&format!("http://{}/cut", addr), None)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Network);
        let head = err.head().expect("head was received");
        assert_eq!(head.status, 200);
        assert_eq!(head.content_type.as_deref(), Some("text/html"));
        assert_eq!(head.headers.get("content-length").map(String::as_str), Some("100"));
    }

    /// Sends a head, then never finishes the body
    struct StalledBody;

    #[async_trait]
    impl Transport for StalledBody {
        async fn get(&self, url: &str, head: &HeadSlot) -> Result<FetchResponse, FetchError> {
            let _ = head.set(ResponseHead {
                status: 503,
                final_url: url.to_string(),
                content_type: None,
                headers: BTreeMap::from([("retry-after".to_string(), "1".to_string())]),
            });
            futures::future::pending::<()>().await;
            unreachable!()
        }
    }

    #[tokio::test]
    async fn test_deadline_during_body_keeps_response_head() {
        let client = FetchClient::new(Arc::new(StalledBody), Duration::from_millis(20));

        let err = client.fetch("https://stall.test/", None).await.unwrap_err();

        assert_eq!(err.code(), "TIMEOUT");
        assert_eq!(err.head().map(|h| h.status), Some(503));
    }

    #[tokio::test]
    async fn test_refused_connection_is_network_error() {
        // Grab a free port and release it so nothing is listening
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = client(Duration::from_secs(5))
            .fetch(&format!("http://{}/", addr), None)
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::Network { .. }));
        assert!(err.head().is_none());
        assert_eq!(err.kind(), ErrorKind::Network);
        assert!(err.code().starts_with('E'));
    }
}
