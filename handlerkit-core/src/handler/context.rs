//! Per-invocation capability context
//!
//! A [`HandlerContext`] is built fresh by the caller for every invocation.
//! It carries identity, permissions and a cancellation token, plus the
//! optional protocol capabilities (sampling, progress, resource reads) the
//! surrounding host can provide.

use super::permissions::Permissions;
use super::result::HandlerError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Role of a sampling message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SamplingRole {
    User,
    Assistant,
}

/// One message in a sampling request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingMessage {
    pub role: SamplingRole,
    pub content: String,
}

impl SamplingMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: SamplingRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: SamplingRole::Assistant,
            content: content.into(),
        }
    }
}

/// Request for a completion from the host's model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SamplingRequest {
    pub messages: Vec<SamplingMessage>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    pub max_tokens: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

impl SamplingRequest {
    /// Single user prompt with a default token budget
    pub fn prompt(prompt: impl Into<String>) -> Self {
        Self {
            messages: vec![SamplingMessage::user(prompt)],
            system_prompt: None,
            max_tokens: 1024,
            temperature: None,
        }
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

/// Completion returned by the host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SamplingResponse {
    pub role: SamplingRole,
    pub content: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
}

/// Progress notification for a long-running invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub progress: f64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ProgressUpdate {
    pub fn new(progress: f64) -> Self {
        Self {
            progress,
            total: None,
            message: None,
        }
    }

    pub fn with_total(mut self, total: f64) -> Self {
        self.total = Some(total);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Contents of a host resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceContents {
    pub uri: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    /// Base64-encoded binary contents
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob: Option<String>,
}

/// Host-provided model completion
#[async_trait]
pub trait SamplingCapability: Send + Sync {
    async fn create_message(&self, request: SamplingRequest)
    -> Result<SamplingResponse, HandlerError>;
}

/// Host-provided progress sink
#[async_trait]
pub trait ProgressReporter: Send + Sync {
    async fn report(&self, update: ProgressUpdate) -> Result<(), HandlerError>;
}

/// Host-provided resource access
#[async_trait]
pub trait ResourceReader: Send + Sync {
    async fn read(&self, uri: &str) -> Result<ResourceContents, HandlerError>;
}

/// Protocol capability a context may offer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Sampling,
    Progress,
    ResourceRead,
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Capability::Sampling => write!(f, "sampling"),
            Capability::Progress => write!(f, "progress"),
            Capability::ResourceRead => write!(f, "resource_read"),
        }
    }
}

/// Explicit set of protocol capabilities available to a handler
#[derive(Clone, Default)]
pub struct Capabilities {
    sampling: Option<Arc<dyn SamplingCapability>>,
    progress: Option<Arc<dyn ProgressReporter>>,
    resources: Option<Arc<dyn ResourceReader>>,
}

impl Capabilities {
    /// No capabilities
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_sampling(mut self, sampling: Arc<dyn SamplingCapability>) -> Self {
        self.sampling = Some(sampling);
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_resources(mut self, resources: Arc<dyn ResourceReader>) -> Self {
        self.resources = Some(resources);
        self
    }

    /// Check if a capability is available
    pub fn supports(&self, capability: Capability) -> bool {
        match capability {
            Capability::Sampling => self.sampling.is_some(),
            Capability::Progress => self.progress.is_some(),
            Capability::ResourceRead => self.resources.is_some(),
        }
    }

    /// All available capabilities
    pub fn available(&self) -> Vec<Capability> {
        [
            Capability::Sampling,
            Capability::Progress,
            Capability::ResourceRead,
        ]
        .into_iter()
        .filter(|capability| self.supports(*capability))
        .collect()
    }
}

impl std::fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capabilities")
            .field("available", &self.available())
            .finish()
    }
}

/// Tracing-backed logger scoped to one invocation
#[derive(Debug, Clone)]
pub struct HandlerLogger {
    session_id: String,
    invocation_id: Uuid,
}

impl HandlerLogger {
    pub fn new(session_id: impl Into<String>, invocation_id: Uuid) -> Self {
        Self {
            session_id: session_id.into(),
            invocation_id,
        }
    }

    pub fn debug(&self, message: &str) {
        tracing::debug!(
            session_id = %self.session_id,
            invocation_id = %self.invocation_id,
            "{}",
            message
        );
    }

    pub fn info(&self, message: &str) {
        tracing::info!(
            session_id = %self.session_id,
            invocation_id = %self.invocation_id,
            "{}",
            message
        );
    }

    pub fn warn(&self, message: &str) {
        tracing::warn!(
            session_id = %self.session_id,
            invocation_id = %self.invocation_id,
            "{}",
            message
        );
    }

    pub fn error(&self, message: &str) {
        tracing::error!(
            session_id = %self.session_id,
            invocation_id = %self.invocation_id,
            "{}",
            message
        );
    }
}

/// Context for one handler invocation
#[derive(Debug, Clone)]
pub struct HandlerContext {
    /// Session the invocation belongs to
    pub session_id: String,

    /// Unique identifier of this invocation
    pub invocation_id: Uuid,

    /// Logger tagged with the session and invocation ids
    pub logger: HandlerLogger,

    /// Filesystem and network permissions
    pub permissions: Permissions,

    /// Caller-supplied metadata
    pub metadata: Map<String, Value>,

    /// Cancellation token; cancelling it aborts the invocation
    pub cancellation: CancellationToken,

    /// Protocol capabilities offered by the host
    pub capabilities: Capabilities,
}

impl HandlerContext {
    /// Create a context with a fresh invocation id and unrestricted permissions
    pub fn new(session_id: impl Into<String>) -> Self {
        let session_id = session_id.into();
        let invocation_id = Uuid::new_v4();
        Self {
            logger: HandlerLogger::new(session_id.clone(), invocation_id),
            session_id,
            invocation_id,
            permissions: Permissions::unrestricted(),
            metadata: Map::new(),
            cancellation: CancellationToken::new(),
            capabilities: Capabilities::none(),
        }
    }

    pub fn with_invocation_id(mut self, invocation_id: Uuid) -> Self {
        self.invocation_id = invocation_id;
        self.logger = HandlerLogger::new(self.session_id.clone(), invocation_id);
        self
    }

    pub fn with_permissions(mut self, permissions: Permissions) -> Self {
        self.permissions = permissions;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Check if cancellation has been requested
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Copy of this context whose token is a child of this one
    ///
    /// Cancelling the child (e.g. on an attempt timeout) leaves the parent
    /// untouched; cancelling the parent reaches the child.
    pub fn child(&self) -> Self {
        Self {
            cancellation: self.cancellation.child_token(),
            ..self.clone()
        }
    }

    /// Identity and metadata as a JSON object
    pub fn describe(&self) -> Value {
        serde_json::json!({
            "session_id": self.session_id,
            "invocation_id": self.invocation_id.to_string(),
            "metadata": Value::Object(self.metadata.clone()),
        })
    }

    /// Ask the host's model for a completion
    pub async fn sample(&self, request: SamplingRequest) -> Result<SamplingResponse, HandlerError> {
        let sampling = self
            .capabilities
            .sampling
            .as_ref()
            .ok_or_else(|| HandlerError::capability_unavailable(Capability::Sampling))?;
        sampling.create_message(request).await
    }

    /// Send a progress notification
    pub async fn report_progress(&self, update: ProgressUpdate) -> Result<(), HandlerError> {
        let progress = self
            .capabilities
            .progress
            .as_ref()
            .ok_or_else(|| HandlerError::capability_unavailable(Capability::Progress))?;
        progress.report(update).await
    }

    /// Read a host resource
    pub async fn read_resource(&self, uri: &str) -> Result<ResourceContents, HandlerError> {
        let resources = self
            .capabilities
            .resources
            .as_ref()
            .ok_or_else(|| HandlerError::capability_unavailable(Capability::ResourceRead))?;
        resources.read(uri).await
    }
}
