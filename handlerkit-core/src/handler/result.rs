//! Handler result payloads and the invocation error model
//!
//! Provides the common result format every backend produces:
//! - Ordered content items (text, image, audio, binary)
//! - Optional metadata
//! - Non-fatal errors that don't fail the call
//! - A unified error taxonomy with retryable vs terminal distinction

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

/// A single typed content item in a handler result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentItem {
    /// Plain text
    Text {
        /// The text payload
        text: String,
    },

    /// Image payload
    Image {
        /// Base64-encoded bytes
        data: String,
        /// MIME type (e.g. `image/png`)
        #[serde(rename = "mimeType")]
        mime_type: String,
    },

    /// Audio payload
    Audio {
        /// Base64-encoded bytes
        data: String,
        /// MIME type (e.g. `audio/wav`)
        #[serde(rename = "mimeType")]
        mime_type: String,
    },

    /// Arbitrary binary payload
    Binary {
        /// Base64-encoded bytes
        data: String,
        /// MIME type (e.g. `application/octet-stream`)
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
}

impl ContentItem {
    /// Create a text item
    pub fn text(text: impl Into<String>) -> Self {
        ContentItem::Text { text: text.into() }
    }

    /// Create an image item from raw bytes
    pub fn image_bytes(bytes: &[u8], mime_type: impl Into<String>) -> Self {
        ContentItem::Image {
            data: BASE64.encode(bytes),
            mime_type: mime_type.into(),
        }
    }

    /// Create an audio item from raw bytes
    pub fn audio_bytes(bytes: &[u8], mime_type: impl Into<String>) -> Self {
        ContentItem::Audio {
            data: BASE64.encode(bytes),
            mime_type: mime_type.into(),
        }
    }

    /// Create a binary item from raw bytes
    pub fn binary_bytes(bytes: &[u8], mime_type: impl Into<String>) -> Self {
        ContentItem::Binary {
            data: BASE64.encode(bytes),
            mime_type: mime_type.into(),
        }
    }

    /// Get the text if this is a text item
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ContentItem::Text { text } => Some(text),
            _ => None,
        }
    }

    /// Get the MIME type of a binary-ish item
    pub fn mime_type(&self) -> Option<&str> {
        match self {
            ContentItem::Text { .. } => None,
            ContentItem::Image { mime_type, .. }
            | ContentItem::Audio { mime_type, .. }
            | ContentItem::Binary { mime_type, .. } => Some(mime_type),
        }
    }

    /// Decode the base64 payload of a binary-ish item
    pub fn decoded_bytes(&self) -> Option<Result<Vec<u8>, base64::DecodeError>> {
        match self {
            ContentItem::Text { .. } => None,
            ContentItem::Image { data, .. }
            | ContentItem::Audio { data, .. }
            | ContentItem::Binary { data, .. } => Some(BASE64.decode(data)),
        }
    }
}

/// Result of a successful handler invocation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HandlerResult {
    /// Ordered content items
    pub content: Vec<ContentItem>,

    /// Optional metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,

    /// Non-fatal errors reported alongside partial results
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<HandlerError>,
}

impl HandlerResult {
    /// Create an empty result
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a result with a single text item
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentItem::text(text)],
            ..Self::default()
        }
    }

    /// Create a result from content items
    pub fn from_content(content: impl IntoIterator<Item = ContentItem>) -> Self {
        Self {
            content: content.into_iter().collect(),
            ..Self::default()
        }
    }

    /// Append a content item
    pub fn with_item(mut self, item: ContentItem) -> Self {
        self.content.push(item);
        self
    }

    /// Set a metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata
            .get_or_insert_with(Map::new)
            .insert(key.into(), value);
        self
    }

    /// Attach a non-fatal error
    pub fn with_error(mut self, error: HandlerError) -> Self {
        self.errors.push(error);
        self
    }

    /// Whether the handler reported any non-fatal errors
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Concatenate all text items, newline separated
    pub fn joined_text(&self) -> String {
        self.content
            .iter()
            .filter_map(ContentItem::as_text)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Structured invocation error with taxonomy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerError {
    /// Error kind (determines retryability)
    pub kind: HandlerErrorKind,

    /// Stable error code; defaults to the kind's code
    pub code: String,

    /// Human-readable error message
    pub message: String,

    /// Best-effort stack or backtrace text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,

    /// Structured diagnostic details
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl HandlerError {
    /// Create a new error of the given kind
    pub fn new(kind: HandlerErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: kind.code().to_string(),
            message: message.into(),
            stack: None,
            details: None,
        }
    }

    /// Override the error code
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = code.into();
        self
    }

    /// Attach stack text
    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// Attach structured details
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Access to a path or domain was denied
    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(HandlerErrorKind::PermissionDenied, message)
    }

    /// Execution exceeded its deadline
    pub fn timeout(duration: Duration) -> Self {
        Self::new(
            HandlerErrorKind::Timeout,
            format!("Handler execution timed out after {}ms", duration.as_millis()),
        )
        .with_details(serde_json::json!({ "timeout_ms": duration.as_millis() as u64 }))
    }

    /// Execution was aborted by an external signal
    pub fn aborted(reason: impl Into<String>) -> Self {
        Self::new(HandlerErrorKind::Aborted, reason)
    }

    /// Module could not be loaded
    pub fn module_load(message: impl Into<String>) -> Self {
        Self::new(HandlerErrorKind::ModuleLoadError, message)
    }

    /// Named export missing from a loaded module
    pub fn export_not_found(export: &str, module: &str) -> Self {
        Self::new(
            HandlerErrorKind::ExportNotFound,
            format!("Export '{}' not found in module '{}'", export, module),
        )
        .with_details(serde_json::json!({ "export": export, "module": module }))
    }

    /// Request or response transform failed
    pub fn transform(message: impl Into<String>) -> Self {
        Self::new(HandlerErrorKind::TransformError, message)
    }

    /// Registry lookup missed
    pub fn not_registered(name: &str) -> Self {
        Self::new(
            HandlerErrorKind::HandlerNotRegistered,
            format!("No handler registered under '{}'", name),
        )
        .with_details(serde_json::json!({ "name": name }))
    }

    /// No resolver claims the configuration's discriminant
    pub fn unsupported_type(handler_type: &str) -> Self {
        Self::new(
            HandlerErrorKind::UnsupportedHandlerType,
            format!("Unsupported handler type '{}'", handler_type),
        )
        .with_details(serde_json::json!({ "type": handler_type }))
    }

    /// Handler configuration is malformed
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::new(HandlerErrorKind::InvalidConfig, message)
    }

    /// Script source failed to compile
    pub fn compile(message: impl Into<String>) -> Self {
        Self::new(HandlerErrorKind::CompileError, message)
    }

    /// Transient network failure
    pub fn network(message: impl Into<String>) -> Self {
        Self::new(HandlerErrorKind::Network, message)
    }

    /// A protocol capability is not available in this context
    pub fn capability_unavailable(capability: impl std::fmt::Display) -> Self {
        Self::new(
            HandlerErrorKind::CapabilityUnavailable,
            format!("Capability '{}' is not available in this context", capability),
        )
    }

    /// Handler reported a semantic failure
    pub fn execution(message: impl Into<String>) -> Self {
        Self::new(HandlerErrorKind::Execution, message)
    }

    /// Internal framework error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(HandlerErrorKind::Internal, message)
    }

    /// Whether the engine may retry after this error
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for HandlerError {}

/// Error kind taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerErrorKind {
    /// Guard denied filesystem or network access (terminal)
    PermissionDenied,

    /// Deadline exceeded (retryable)
    Timeout,

    /// External abort signal (terminal)
    Aborted,

    /// Module missing or failed to load (terminal)
    ModuleLoadError,

    /// Named export absent (terminal)
    ExportNotFound,

    /// Request or response transform raised (terminal)
    TransformError,

    /// Registry name unknown (terminal)
    HandlerNotRegistered,

    /// No resolver for the discriminant (terminal)
    UnsupportedHandlerType,

    /// Malformed handler configuration (terminal)
    InvalidConfig,

    /// Script source did not compile (terminal)
    CompileError,

    /// Connection failure or non-success status (retryable)
    Network,

    /// Protocol capability missing from the context (terminal)
    CapabilityUnavailable,

    /// Handler-level semantic failure (terminal)
    Execution,

    /// Framework bug (terminal)
    Internal,
}

impl HandlerErrorKind {
    /// Stable string code for this kind
    pub fn code(&self) -> &'static str {
        match self {
            HandlerErrorKind::PermissionDenied => "PERMISSION_DENIED",
            HandlerErrorKind::Timeout => "TIMEOUT",
            HandlerErrorKind::Aborted => "ABORTED",
            HandlerErrorKind::ModuleLoadError => "MODULE_LOAD_ERROR",
            HandlerErrorKind::ExportNotFound => "EXPORT_NOT_FOUND",
            HandlerErrorKind::TransformError => "TRANSFORM_ERROR",
            HandlerErrorKind::HandlerNotRegistered => "HANDLER_NOT_REGISTERED",
            HandlerErrorKind::UnsupportedHandlerType => "UNSUPPORTED_HANDLER_TYPE",
            HandlerErrorKind::InvalidConfig => "INVALID_CONFIG",
            HandlerErrorKind::CompileError => "COMPILE_ERROR",
            HandlerErrorKind::Network => "NETWORK_ERROR",
            HandlerErrorKind::CapabilityUnavailable => "CAPABILITY_UNAVAILABLE",
            HandlerErrorKind::Execution => "EXECUTION_ERROR",
            HandlerErrorKind::Internal => "INTERNAL_ERROR",
        }
    }

    /// Check if this error kind is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, HandlerErrorKind::Timeout | HandlerErrorKind::Network)
    }

    /// Check if this kind is a resolution failure (surfaced immediately)
    pub fn is_resolution(&self) -> bool {
        matches!(
            self,
            HandlerErrorKind::PermissionDenied
                | HandlerErrorKind::ModuleLoadError
                | HandlerErrorKind::ExportNotFound
                | HandlerErrorKind::HandlerNotRegistered
                | HandlerErrorKind::UnsupportedHandlerType
                | HandlerErrorKind::InvalidConfig
                | HandlerErrorKind::CompileError
        )
    }
}

impl std::fmt::Display for HandlerErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}
