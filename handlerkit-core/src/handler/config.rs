//! Declarative handler descriptions
//!
//! A [`HandlerConfig`] is the serialized form a caller hands to the
//! framework. The `type` tag selects the backend and the remaining fields
//! (camelCase on the wire) are that backend's payload.

use super::result::HandlerError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Default per-call timeout for inline scripts and HTTP attempts
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

/// Backend discriminant of a [`HandlerConfig`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandlerKind {
    Inline,
    File,
    Http,
    Registry,
}

impl HandlerKind {
    /// Every discriminant, in declaration order
    pub const ALL: [HandlerKind; 4] = [
        HandlerKind::Inline,
        HandlerKind::File,
        HandlerKind::Http,
        HandlerKind::Registry,
    ];

    /// Wire name of the discriminant
    pub fn as_str(&self) -> &'static str {
        match self {
            HandlerKind::Inline => "inline",
            HandlerKind::File => "file",
            HandlerKind::Http => "http",
            HandlerKind::Registry => "registry",
        }
    }

    /// Parse a wire name
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }
}

impl std::fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declarative description of a handler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum HandlerConfig {
    /// Script source evaluated in the sandbox
    Inline(InlineConfig),
    /// Script module loaded from disk
    File(FileConfig),
    /// Remote HTTP endpoint
    Http(HttpConfig),
    /// Handler registered by name at startup
    Registry(RegistryConfig),
}

/// Inline script handler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineConfig {
    /// Script source
    pub code: String,

    /// Timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout: u64,
}

impl InlineConfig {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            timeout: DEFAULT_TIMEOUT_MS,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout.as_millis() as u64;
        self
    }

    pub fn timeout_duration(&self) -> Duration {
        Duration::from_millis(self.timeout)
    }
}

/// Script module on disk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileConfig {
    /// Absolute path, or relative to the configured base directory
    pub path: PathBuf,

    /// Exported function to call; `handler` when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export: Option<String>,
}

impl FileConfig {
    /// Name of the function called when no export is given
    pub const DEFAULT_EXPORT: &'static str = "handler";

    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            export: None,
        }
    }

    pub fn with_export(mut self, export: impl Into<String>) -> Self {
        self.export = Some(export.into());
        self
    }

    /// The export that will be called
    pub fn export_name(&self) -> &str {
        self.export.as_deref().unwrap_or(Self::DEFAULT_EXPORT)
    }
}

/// HTTP method for remote handlers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    #[serde(alias = "get")]
    Get,
    #[serde(alias = "post")]
    Post,
    #[serde(alias = "put")]
    Put,
    #[serde(alias = "delete")]
    Delete,
}

impl HttpMethod {
    /// Whether call arguments travel as a JSON body rather than query parameters
    pub fn sends_body(&self) -> bool {
        matches!(self, HttpMethod::Post | HttpMethod::Put)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
        }
    }
}

/// Remote HTTP endpoint handler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpConfig {
    /// Target URL
    pub url: String,

    #[serde(default)]
    pub method: HttpMethod,

    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    /// Per-attempt timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout: u64,

    /// Additional attempts after the first failure
    #[serde(default)]
    pub retries: u32,

    /// Script computing the request body from `args`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_transform: Option<String>,

    /// Script computing the result from `response`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_transform: Option<String>,
}

impl HttpConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: HttpMethod::default(),
            headers: BTreeMap::new(),
            timeout: DEFAULT_TIMEOUT_MS,
            retries: 0,
            request_transform: None,
            response_transform: None,
        }
    }

    pub fn with_method(mut self, method: HttpMethod) -> Self {
        self.method = method;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout.as_millis() as u64;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_request_transform(mut self, code: impl Into<String>) -> Self {
        self.request_transform = Some(code.into());
        self
    }

    pub fn with_response_transform(mut self, code: impl Into<String>) -> Self {
        self.response_transform = Some(code.into());
        self
    }

    pub fn timeout_duration(&self) -> Duration {
        Duration::from_millis(self.timeout)
    }
}

/// Named handler from the registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryConfig {
    pub name: String,
}

impl RegistryConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl HandlerConfig {
    /// Shorthand for an inline script with the default timeout
    pub fn inline(code: impl Into<String>) -> Self {
        HandlerConfig::Inline(InlineConfig::new(code))
    }

    /// Shorthand for a file module with the default export
    pub fn file(path: impl Into<PathBuf>) -> Self {
        HandlerConfig::File(FileConfig::new(path))
    }

    /// Shorthand for a GET endpoint
    pub fn http(url: impl Into<String>) -> Self {
        HandlerConfig::Http(HttpConfig::new(url))
    }

    /// Shorthand for a registry lookup
    pub fn registry(name: impl Into<String>) -> Self {
        HandlerConfig::Registry(RegistryConfig::new(name))
    }

    /// Parse a raw description
    ///
    /// An unknown `type` yields `UnsupportedHandlerType`; any other shape
    /// problem yields `InvalidConfig`.
    pub fn from_value(value: Value) -> Result<Self, HandlerError> {
        let type_name = match value.get("type") {
            Some(Value::String(name)) => name.clone(),
            Some(other) => {
                return Err(HandlerError::invalid_config(format!(
                    "Handler 'type' must be a string, got {}",
                    other
                )));
            }
            None => {
                return Err(HandlerError::invalid_config(
                    "Handler description is missing 'type'",
                ));
            }
        };

        if HandlerKind::parse(&type_name).is_none() {
            return Err(HandlerError::unsupported_type(&type_name));
        }

        serde_json::from_value(value).map_err(|e| {
            HandlerError::invalid_config(format!("Invalid {} handler: {}", type_name, e))
        })
    }

    /// Backend discriminant
    pub fn kind(&self) -> HandlerKind {
        match self {
            HandlerConfig::Inline(_) => HandlerKind::Inline,
            HandlerConfig::File(_) => HandlerKind::File,
            HandlerConfig::Http(_) => HandlerKind::Http,
            HandlerConfig::Registry(_) => HandlerKind::Registry,
        }
    }

    /// SHA-256 hex digest of the canonical JSON form
    ///
    /// Two structurally equal configurations have the same fingerprint.
    pub fn fingerprint(&self) -> String {
        // Value maps are sorted, so this is canonical regardless of field order
        let canonical = serde_json::to_value(self)
            .map(|value| value.to_string())
            .unwrap_or_default();

        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Timeout the configuration itself asks for, if any
    pub fn declared_timeout(&self) -> Option<Duration> {
        match self {
            HandlerConfig::Inline(inline) => Some(inline.timeout_duration()),
            HandlerConfig::File(_) | HandlerConfig::Http(_) | HandlerConfig::Registry(_) => None,
        }
    }
}

#[cfg(test)]
mod config_tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_inline_defaults() {
        let config = HandlerConfig::from_value(json!({
            "type": "inline",
            "code": "\"hi\""
        }))
        .unwrap();

        match config {
            HandlerConfig::Inline(inline) => assert_eq!(inline.timeout, DEFAULT_TIMEOUT_MS),
            other => panic!("unexpected config {:?}", other),
        }
    }

    #[test]
    fn test_http_camel_case_fields() {
        let config = HandlerConfig::from_value(json!({
            "type": "http",
            "url": "http://localhost/api",
            "method": "POST",
            "retries": 2,
            "requestTransform": "args",
            "responseTransform": "response.body"
        }))
        .unwrap();

        let HandlerConfig::Http(http) = config else {
            panic!("expected http config");
        };
        assert_eq!(http.method, HttpMethod::Post);
        assert_eq!(http.retries, 2);
        assert_eq!(http.timeout, DEFAULT_TIMEOUT_MS);
        assert_eq!(http.request_transform.as_deref(), Some("args"));
        assert!(http.headers.is_empty());
    }

    #[test]
    fn test_http_method_defaults_to_get() {
        let http: HttpConfig = serde_json::from_value(json!({ "url": "http://x" })).unwrap();
        assert_eq!(http.method, HttpMethod::Get);
        assert!(!http.method.sends_body());
    }

    #[test]
    fn test_unknown_type_is_unsupported() {
        let error = HandlerConfig::from_value(json!({ "type": "grpc", "target": "x" })).unwrap_err();
        assert_eq!(error.kind, crate::handler::HandlerErrorKind::UnsupportedHandlerType);
    }

    #[test]
    fn test_missing_field_is_invalid_config() {
        let error = HandlerConfig::from_value(json!({ "type": "registry" })).unwrap_err();
        assert_eq!(error.kind, crate::handler::HandlerErrorKind::InvalidConfig);

        let error = HandlerConfig::from_value(json!({ "name": "x" })).unwrap_err();
        assert_eq!(error.kind, crate::handler::HandlerErrorKind::InvalidConfig);
    }

    #[test]
    fn test_kind_matches_variant() {
        assert_eq!(HandlerConfig::inline("1").kind(), HandlerKind::Inline);
        assert_eq!(HandlerConfig::file("a.rhai").kind(), HandlerKind::File);
        assert_eq!(HandlerConfig::http("http://x").kind(), HandlerKind::Http);
        assert_eq!(HandlerConfig::registry("x").kind(), HandlerKind::Registry);
    }

    #[test]
    fn test_fingerprint_is_structural() {
        let a = HandlerConfig::Http(
            HttpConfig::new("http://x")
                .with_header("b", "2")
                .with_header("a", "1"),
        );
        let b = HandlerConfig::Http(
            HttpConfig::new("http://x")
                .with_header("a", "1")
                .with_header("b", "2"),
        );
        let c = HandlerConfig::Http(HttpConfig::new("http://x").with_retries(1));

        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
        assert_eq!(a.fingerprint().len(), 64);
    }

    #[test]
    fn test_file_export_default() {
        let file = FileConfig::new("tools/echo.rhai");
        assert_eq!(file.export_name(), "handler");
        assert_eq!(file.with_export("run").export_name(), "run");
    }
}
