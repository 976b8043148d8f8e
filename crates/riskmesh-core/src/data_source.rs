//! Provider adapter contract and the bundled URL-template adapter.
//!
//! An adapter turns a caller [`Query`] into an [`HttpRequest`] and turns the
//! provider's [`HttpResponse`] into a normalized JSON payload. Adapters never
//! perform I/O themselves; the orchestrator sends the request through the
//! shared transport.
//!
//! # Example
//!
//! ```rust,ignore
//! use riskmesh_core::{ApiKeyPlacement, Category, TemplateAdapter};
//!
//! let adapter = TemplateAdapter::new("https://earthquake.usgs.gov/fdsnws/event/1/query")
//!     .with_static_param("format", "geojson")
//!     .map_field("lat", "latitude")
//!     .map_field("lon", "longitude")
//!     .with_extract("/features");
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fmt::{Display, Formatter};

use serde::Serialize;
use serde_json::Value;

use crate::http_client::{HttpError, HttpErrorKind, HttpMethod, HttpRequest, HttpResponse};
use crate::{Category, Query};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceErrorKind {
    /// Timeout, connection failure, 408, 429 or 5xx.
    Transient,
    /// Any other 4xx.
    Permanent,
    /// The provider's quota refused the call.
    QuotaDenied,
    /// The provider's circuit refused the call.
    CircuitOpen,
    /// The provider answered but the payload was unusable.
    InvalidPayload,
    /// The adapter could not build a request for this query.
    InvalidRequest,
    /// The caller's deadline passed while the call was in flight.
    DeadlineExceeded,
}

/// Outcome of one failed provider call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceError {
    kind: SourceErrorKind,
    message: String,
    status: Option<u16>,
}

impl SourceError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(SourceErrorKind::Transient, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(SourceErrorKind::Permanent, message)
    }

    pub fn quota_denied(message: impl Into<String>) -> Self {
        Self::new(SourceErrorKind::QuotaDenied, message)
    }

    pub fn circuit_open(message: impl Into<String>) -> Self {
        Self::new(SourceErrorKind::CircuitOpen, message)
    }

    pub fn invalid_payload(message: impl Into<String>) -> Self {
        Self::new(SourceErrorKind::InvalidPayload, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(SourceErrorKind::InvalidRequest, message)
    }

    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Self::new(SourceErrorKind::DeadlineExceeded, message)
    }

    fn new(kind: SourceErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
        }
    }

    pub const fn kind(&self) -> SourceErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub const fn status(&self) -> Option<u16> {
        self.status
    }

    pub const fn retryable(&self) -> bool {
        matches!(
            self.kind,
            SourceErrorKind::Transient | SourceErrorKind::QuotaDenied | SourceErrorKind::CircuitOpen
        )
    }

    /// Provider faults move the circuit breaker; admission refusals, bad
    /// requests and caller deadlines do not.
    pub const fn counts_toward_breaker(&self) -> bool {
        matches!(
            self.kind,
            SourceErrorKind::Transient | SourceErrorKind::Permanent | SourceErrorKind::InvalidPayload
        )
    }

    pub const fn code(&self) -> &'static str {
        match self.kind {
            SourceErrorKind::Transient => "source.transient",
            SourceErrorKind::Permanent => "source.permanent",
            SourceErrorKind::QuotaDenied => "source.quota_denied",
            SourceErrorKind::CircuitOpen => "source.circuit_open",
            SourceErrorKind::InvalidPayload => "source.invalid_payload",
            SourceErrorKind::InvalidRequest => "source.invalid_request",
            SourceErrorKind::DeadlineExceeded => "source.deadline_exceeded",
        }
    }
}

impl Display for SourceError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code())
    }
}

impl std::error::Error for SourceError {}

impl From<HttpError> for SourceError {
    fn from(error: HttpError) -> Self {
        let kind = if error.is_transient() {
            SourceErrorKind::Transient
        } else if matches!(error.kind(), HttpErrorKind::Body) {
            SourceErrorKind::InvalidPayload
        } else {
            SourceErrorKind::Permanent
        };

        Self {
            kind,
            message: error.to_string(),
            status: error.status_code(),
        }
    }
}

/// Provider-specific request building and response parsing.
pub trait ProviderAdapter: Send + Sync {
    fn build_request(&self, category: &Category, query: &Query) -> Result<HttpRequest, SourceError>;

    fn parse_response(&self, category: &Category, response: HttpResponse) -> Result<Value, SourceError>;
}

/// Where an API key is attached to outgoing requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiKeyPlacement {
    Header { name: String, value: String },
    QueryParam { name: String, value: String },
}

/// Adapter driven entirely by configuration: a base URL, optional per-category
/// path suffix, query-field to URL-parameter mapping and an optional JSON
/// pointer selecting the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateAdapter {
    base_url: String,
    method: HttpMethod,
    headers: BTreeMap<String, String>,
    field_params: Vec<(String, String)>,
    static_params: Vec<(String, String)>,
    category_paths: HashMap<Category, String>,
    api_key: Option<ApiKeyPlacement>,
    extract: Option<String>,
}

impl TemplateAdapter {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            method: HttpMethod::Get,
            headers: BTreeMap::new(),
            field_params: Vec::new(),
            static_params: Vec::new(),
            category_paths: HashMap::new(),
            api_key: None,
            extract: None,
        }
    }

    pub fn with_method(mut self, method: HttpMethod) -> Self {
        self.method = method;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.into().to_ascii_lowercase(), value.into());
        self
    }

    /// Send query field `field` as URL parameter `param`. Mapped fields are required.
    pub fn map_field(mut self, field: impl Into<String>, param: impl Into<String>) -> Self {
        self.field_params.push((field.into(), param.into()));
        self
    }

    pub fn with_static_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.static_params.push((name.into(), value.into()));
        self
    }

    /// Append `path` to the base URL for requests in `category`.
    pub fn with_category_path(mut self, category: Category, path: impl Into<String>) -> Self {
        self.category_paths.insert(category, path.into());
        self
    }

    pub fn with_api_key(mut self, placement: ApiKeyPlacement) -> Self {
        self.api_key = Some(placement);
        self
    }

    /// JSON pointer (RFC 6901) selecting the payload inside the response body.
    pub fn with_extract(mut self, pointer: impl Into<String>) -> Self {
        self.extract = Some(pointer.into());
        self
    }

    fn url_for(&self, category: &Category, query: &Query) -> Result<String, SourceError> {
        let mut url = self.base_url.trim_end_matches('/').to_owned();
        if let Some(path) = self.category_paths.get(category) {
            url.push('/');
            url.push_str(path.trim_start_matches('/'));
        }

        let mut params = Vec::with_capacity(self.field_params.len() + self.static_params.len() + 1);
        for (field, param) in &self.field_params {
            let value = query
                .get(field)
                .filter(|value| !value.is_null())
                .ok_or_else(|| {
                    SourceError::invalid_request(format!("query field '{field}' is required"))
                })?;
            params.push((param.as_str(), param_value(value)));
        }
        for (name, value) in &self.static_params {
            params.push((name.as_str(), value.clone()));
        }
        if let Some(ApiKeyPlacement::QueryParam { name, value }) = &self.api_key {
            params.push((name.as_str(), value.clone()));
        }

        if !params.is_empty() {
            let encoded = params
                .iter()
                .map(|(name, value)| {
                    format!("{}={}", urlencoding::encode(name), urlencoding::encode(value))
                })
                .collect::<Vec<_>>()
                .join("&");
            url.push(if url.contains('?') { '&' } else { '?' });
            url.push_str(&encoded);
        }

        Ok(url)
    }
}

impl ProviderAdapter for TemplateAdapter {
    fn build_request(&self, category: &Category, query: &Query) -> Result<HttpRequest, SourceError> {
        let url = self.url_for(category, query)?;
        let mut request = HttpRequest::new(self.method, url);
        for (name, value) in &self.headers {
            request = request.with_header(name.as_str(), value.as_str());
        }
        if let Some(ApiKeyPlacement::Header { name, value }) = &self.api_key {
            request = request.with_header(name.as_str(), value.as_str());
        }
        if matches!(self.method, HttpMethod::Post | HttpMethod::Put) {
            request = request.with_json(&query.normalized());
        }
        Ok(request)
    }

    fn parse_response(&self, _category: &Category, response: HttpResponse) -> Result<Value, SourceError> {
        let body = response
            .json()
            .map_err(|error| SourceError::invalid_payload(format!("response is not JSON: {error}")))?;

        match &self.extract {
            None => Ok(body),
            Some(pointer) => body.pointer(pointer).cloned().ok_or_else(|| {
                SourceError::invalid_payload(format!("response has no value at '{pointer}'"))
            }),
        }
    }
}

fn param_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.trim().to_owned(),
        other => other.to_string(),
    }
}
