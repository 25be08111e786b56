//! The invocable handler contract
//!
//! Every backend resolves to a [`ToolHandler`]. Callers never see which
//! backend produced it.

use super::context::HandlerContext;
use super::result::{HandlerError, HandlerResult};
use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

/// Core handler trait
///
/// Implement this to provide a handler directly (e.g. for the registry).
/// Resolved backends implement it too.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Invoke the handler with call arguments
    async fn call(&self, args: Value, ctx: &HandlerContext) -> Result<HandlerResult, HandlerError>;
}

/// Shared, resolved handler
pub type ToolHandler = Arc<dyn Handler>;

/// Adapter turning an async closure into a [`Handler`]
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Value, HandlerContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<HandlerResult, HandlerError>> + Send,
{
    async fn call(&self, args: Value, ctx: &HandlerContext) -> Result<HandlerResult, HandlerError> {
        (self.f)(args, ctx.clone()).await
    }
}

/// Wrap an async closure as a [`ToolHandler`]
///
/// ```rust,no_run
/// use handlerkit_core::handler::{handler_fn, HandlerResult};
///
/// let echo = handler_fn(|args, _ctx| async move {
///     Ok(HandlerResult::text(args.to_string()))
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> ToolHandler
where
    F: Fn(Value, HandlerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<HandlerResult, HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler { f })
}
