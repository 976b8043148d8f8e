use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ValidationError;

/// HTTP method set used by provider adapters and probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
    Head,
}

impl HttpMethod {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Head => "HEAD",
        }
    }
}

impl FromStr for HttpMethod {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "GET" => Ok(Self::Get),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "DELETE" => Ok(Self::Delete),
            "HEAD" => Ok(Self::Head),
            other => Err(ValidationError::InvalidHttpMethod {
                value: other.to_owned(),
            }),
        }
    }
}

/// Outbound request envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
    pub timeout: Duration,
}

impl HttpRequest {
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: BTreeMap::new(),
            body: None,
            timeout: Duration::from_secs(10),
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Post, url)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.into().to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_json(self, body: &Value) -> Self {
        self.with_header("content-type", "application/json")
            .with_body(body.to_string())
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Response envelope returned by an [`HttpClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
            body: body.into(),
        }
    }

    pub fn ok_json(body: impl Into<String>) -> Self {
        Self::new(200, body)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.into().to_ascii_lowercase(), value.into());
        self
    }

    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// `Retry-After` expressed in delta-seconds.
    pub fn retry_after(&self) -> Option<Duration> {
        self.header("retry-after")?
            .trim()
            .parse::<u64>()
            .ok()
            .map(Duration::from_secs)
    }

    pub fn json(&self) -> Result<Value, serde_json::Error> {
        serde_json::from_str(&self.body)
    }
}

/// Failure class of a single transport attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpErrorKind {
    Timeout,
    Connection,
    /// The request could not be built, e.g. a malformed URL.
    Request,
    Status(u16),
    Body,
}

/// Transport-level HTTP error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpError {
    kind: HttpErrorKind,
    message: String,
}

impl HttpError {
    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            kind: HttpErrorKind::Timeout,
            message: message.into(),
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self {
            kind: HttpErrorKind::Connection,
            message: message.into(),
        }
    }

    pub fn request(message: impl Into<String>) -> Self {
        Self {
            kind: HttpErrorKind::Request,
            message: message.into(),
        }
    }

    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self {
            kind: HttpErrorKind::Status(status),
            message: message.into(),
        }
    }

    pub fn body(message: impl Into<String>) -> Self {
        Self {
            kind: HttpErrorKind::Body,
            message: message.into(),
        }
    }

    pub const fn kind(&self) -> HttpErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub const fn status_code(&self) -> Option<u16> {
        match self.kind {
            HttpErrorKind::Status(status) => Some(status),
            _ => None,
        }
    }

    /// Timeouts, connection failures, 408, 429 and 5xx are worth retrying.
    pub const fn is_transient(&self) -> bool {
        match self.kind {
            HttpErrorKind::Timeout | HttpErrorKind::Connection => true,
            HttpErrorKind::Status(status) => is_transient_status(status),
            HttpErrorKind::Request | HttpErrorKind::Body => false,
        }
    }
}

impl Display for HttpError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            HttpErrorKind::Status(status) => write!(f, "http {status}: {}", self.message),
            _ => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for HttpError {}

pub const fn is_transient_status(status: u16) -> bool {
    matches!(status, 408 | 429) || (status >= 500 && status < 600)
}

/// Single-attempt transport contract. Retries and status classification live in
/// [`crate::transport::Transport`].
pub trait HttpClient: Send + Sync {
    fn execute<'a>(
        &'a self,
        request: HttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<HttpResponse, HttpError>> + Send + 'a>>;
}

/// Connection pool settings for [`ReqwestHttpClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpPoolConfig {
    pub max_idle_per_host: usize,
    pub idle_timeout: Duration,
    pub connect_timeout: Duration,
    pub user_agent: String,
}

impl Default for HttpPoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 8,
            idle_timeout: Duration::from_secs(90),
            connect_timeout: Duration::from_secs(5),
            user_agent: format!("riskmesh/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Production HTTP client using reqwest with a pooled connection per origin.
#[derive(Debug, Clone)]
pub struct ReqwestHttpClient {
    client: Arc<reqwest::Client>,
}

impl ReqwestHttpClient {
    /// Create a client with the default pool settings.
    pub fn new() -> Self {
        Self::from_config(&HttpPoolConfig::default()).unwrap_or_else(|_| Self {
            client: Arc::new(reqwest::Client::new()),
        })
    }

    pub fn from_config(config: &HttpPoolConfig) -> Result<Self, HttpError> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.as_str())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|error| HttpError::connection(format!("failed to build http client: {error}")))?;

        Ok(Self {
            client: Arc::new(client),
        })
    }

    /// Create a ReqwestHttpClient with a custom reqwest::Client.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            client: Arc::new(client),
        }
    }
}

impl Default for ReqwestHttpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpClient for ReqwestHttpClient {
    fn execute<'a>(
        &'a self,
        request: HttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<HttpResponse, HttpError>> + Send + 'a>> {
        Box::pin(async move {
            let method = match request.method {
                HttpMethod::Get => reqwest::Method::GET,
                HttpMethod::Post => reqwest::Method::POST,
                HttpMethod::Put => reqwest::Method::PUT,
                HttpMethod::Delete => reqwest::Method::DELETE,
                HttpMethod::Head => reqwest::Method::HEAD,
            };

            let mut builder = self
                .client
                .request(method, &request.url)
                .timeout(request.timeout);

            for (name, value) in &request.headers {
                builder = builder.header(name, value);
            }

            if let Some(body) = request.body {
                builder = builder.body(body);
            }

            let response = builder.send().await.map_err(send_error)?;

            let status = response.status().as_u16();
            let headers = response
                .headers()
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|value| (name.as_str().to_ascii_lowercase(), value.to_owned()))
                })
                .collect();
            let body = response.text().await.map_err(body_error)?;

            Ok(HttpResponse {
                status,
                headers,
                body,
            })
        })
    }
}

fn send_error(error: reqwest::Error) -> HttpError {
    if error.is_timeout() {
        HttpError::timeout(format!("request timeout: {error}"))
    } else if error.is_builder() {
        HttpError::request(format!("invalid request: {error}"))
    } else {
        HttpError::connection(format!("request failed: {error}"))
    }
}

/// `text()` decodes lossily, so a failed read means the stream broke off.
fn body_error(error: reqwest::Error) -> HttpError {
    if error.is_timeout() {
        HttpError::timeout(format!("response body timeout: {error}"))
    } else {
        HttpError::connection(format!("response body interrupted: {error}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification_covers_retryable_statuses() {
        for status in [408, 429, 500, 502, 503, 504] {
            assert!(HttpError::status(status, "x").is_transient(), "status {status}");
        }
        for status in [400, 401, 403, 404, 422] {
            assert!(!HttpError::status(status, "x").is_transient(), "status {status}");
        }
        assert!(HttpError::timeout("slow").is_transient());
        assert!(HttpError::connection("reset").is_transient());
        assert!(!HttpError::body("truncated").is_transient());
        assert!(!HttpError::request("bad url").is_transient());
    }

    #[tokio::test]
    async fn malformed_urls_fail_without_being_retryable() {
        let error = ReqwestHttpClient::new()
            .execute(HttpRequest::get("not a url"))
            .await
            .expect_err("cannot be sent");

        assert_eq!(error.kind(), HttpErrorKind::Request);
        assert!(!error.is_transient());
    }

    #[test]
    fn headers_are_case_insensitive() {
        let request = HttpRequest::get("https://example.test").with_header("X-API-Key", "demo");
        assert_eq!(request.headers.get("x-api-key").map(String::as_str), Some("demo"));

        let response = HttpResponse::new(429, "").with_header("Retry-After", " 3 ");
        assert_eq!(response.retry_after(), Some(Duration::from_secs(3)));
        assert_eq!(response.header("RETRY-AFTER"), Some(" 3 "));
    }

    #[test]
    fn method_parses_from_config_strings() {
        assert_eq!("post".parse::<HttpMethod>(), Ok(HttpMethod::Post));
        assert!("PATCH".parse::<HttpMethod>().is_err());
    }
}
