//! # handlerkit - Declarative Handler Execution
//!
//! handlerkit turns a declarative handler description into an invocable
//! unit of work and runs it under timeout, retry, abort and permission
//! constraints. Four backends present one contract:
//! - **inline**: sandboxed script source carried in the description
//! - **file**: a script module on disk with a named export
//! - **http**: a remote endpoint with optional request/response transforms
//! - **registry**: a handler registered by name at startup
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use handlerkit_core::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = FrameworkConfig::load()?;
//!
//!     let registry = Arc::new(HandlerRegistry::new());
//!     registry.register(
//!         "echo",
//!         handler_fn(|args, _ctx| async move { Ok(HandlerResult::text(args.to_string())) }),
//!     )?;
//!
//!     let dispatcher = Arc::new(Dispatcher::new(&config, registry)?);
//!     let engine = ExecutionEngine::new(dispatcher, config.engine.clone());
//!
//!     let ctx = HandlerContext::new("session-1")
//!         .with_permissions(Permissions::unrestricted().with_network(false));
//!     let result = engine
//!         .execute(
//!             &HandlerConfig::inline("`hello ${args.name}`"),
//!             serde_json::json!({ "name": "world" }),
//!             &ctx,
//!             &HandlerExecutionOptions::new(),
//!         )
//!         .await?;
//!
//!     println!("{}", result.joined_text());
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`handler`]: configurations, context, permissions, results, registry
//! - [`sandbox`]: the script engine behind inline, file and transform code
//! - [`resolve`]: one resolver per backend plus the caching dispatcher
//! - [`engine`]: timeout, retry and abort around a resolved handler
//! - [`config`]: layered framework configuration

pub mod config;
pub mod engine;
pub mod error;
pub mod handler;
pub mod resolve;
pub mod sandbox;

pub use error::{HandlerKitError, Result};

/// Current library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{ConfigBuilder, FrameworkConfig};
    pub use crate::engine::{
        Backoff, ExecutionEngine, ExecutionProvenance, ExecutionReport, HandlerExecutionOptions,
        RetryPolicy,
    };
    pub use crate::error::{HandlerKitError, Result};
    pub use crate::handler::{
        Capabilities, Capability, ContentItem, Handler, HandlerConfig, HandlerContext,
        HandlerError, HandlerErrorKind, HandlerKind, HandlerRegistry, HandlerResult, Permissions,
        ToolHandler, handler_fn,
    };
    pub use crate::resolve::{Dispatcher, Resolver};
    pub use crate::sandbox::{Script, ScriptSandbox};
}
