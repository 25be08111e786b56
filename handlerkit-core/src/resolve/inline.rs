//! Inline backend: script source carried in the configuration

use super::Resolver;
use crate::handler::{
    Handler, HandlerConfig, HandlerContext, HandlerError, HandlerKind, HandlerResult,
    InlineConfig, ToolHandler,
};
use crate::sandbox::{Script, ScriptSandbox};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Resolves `inline` configurations
pub struct InlineResolver {
    sandbox: ScriptSandbox,
}

impl InlineResolver {
    pub fn new(sandbox: ScriptSandbox) -> Self {
        Self { sandbox }
    }

    /// Compile the inline source into a handler
    pub fn resolve_inline(&self, config: &InlineConfig) -> Result<ToolHandler, HandlerError> {
        let script = self.sandbox.compile(&config.code)?;
        Ok(Arc::new(InlineHandler {
            script,
            timeout: config.timeout_duration(),
        }))
    }
}

#[async_trait]
impl Resolver for InlineResolver {
    fn kind(&self) -> HandlerKind {
        HandlerKind::Inline
    }

    async fn resolve(&self, config: &HandlerConfig) -> Result<ToolHandler, HandlerError> {
        match config {
            HandlerConfig::Inline(inline) => self.resolve_inline(inline),
            other => Err(super::mismatched(self.kind(), other)),
        }
    }
}

struct InlineHandler {
    script: Script,
    timeout: Duration,
}

#[async_trait]
impl Handler for InlineHandler {
    async fn call(&self, args: Value, ctx: &HandlerContext) -> Result<HandlerResult, HandlerError> {
        self.script.run(args, ctx, Some(self.timeout)).await
    }
}
