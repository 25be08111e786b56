//! Handler contract and the types that flow through it
//!
//! This module defines what a resolved handler looks like and what it sees:
//! - Declarative configurations ([`HandlerConfig`])
//! - The invocable contract ([`Handler`], [`ToolHandler`])
//! - Per-invocation context with explicit capabilities
//! - Permission guard checks
//! - Result payloads and the error taxonomy
//! - The named handler registry

mod config;
mod context;
mod permissions;
mod registry;
mod result;
mod tool;

pub use config::{
    DEFAULT_TIMEOUT_MS, FileConfig, HandlerConfig, HandlerKind, HttpConfig, HttpMethod,
    InlineConfig, RegistryConfig,
};
pub use context::{
    Capabilities, Capability, HandlerContext, HandlerLogger, ProgressReporter, ProgressUpdate,
    ResourceContents, ResourceReader, SamplingCapability, SamplingMessage, SamplingRequest,
    SamplingResponse, SamplingRole,
};
pub use permissions::{
    AccessDecision, Permissions, check_file_access, check_network_access,
    check_resolved_file_access, normalize_path, resolve_path,
};
pub use registry::{HandlerRegistry, RegistryError};
pub use result::{ContentItem, HandlerError, HandlerErrorKind, HandlerResult};
pub use tool::{FnHandler, Handler, ToolHandler, handler_fn};
