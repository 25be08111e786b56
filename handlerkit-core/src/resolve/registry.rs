//! Registry backend: handlers registered by name at startup

use super::Resolver;
use crate::handler::{
    Handler, HandlerConfig, HandlerContext, HandlerError, HandlerKind, HandlerRegistry,
    HandlerResult, RegistryConfig, ToolHandler,
};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Resolves `registry` configurations against a shared [`HandlerRegistry`]
pub struct RegistryResolver {
    registry: Arc<HandlerRegistry>,
}

impl RegistryResolver {
    pub fn new(registry: Arc<HandlerRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    /// Check the name is registered and return a handler bound to it
    pub fn resolve_registry(&self, config: &RegistryConfig) -> Result<ToolHandler, HandlerError> {
        if !self.registry.contains(&config.name) {
            return Err(HandlerError::not_registered(&config.name));
        }

        Ok(Arc::new(RegistryHandler {
            name: config.name.clone(),
            registry: self.registry.clone(),
        }))
    }
}

#[async_trait]
impl Resolver for RegistryResolver {
    fn kind(&self) -> HandlerKind {
        HandlerKind::Registry
    }

    /// The registry may be updated with `replace`, so lookups stay live
    fn cacheable(&self) -> bool {
        false
    }

    async fn resolve(&self, config: &HandlerConfig) -> Result<ToolHandler, HandlerError> {
        match config {
            HandlerConfig::Registry(registry) => self.resolve_registry(registry),
            other => Err(super::mismatched(self.kind(), other)),
        }
    }
}

struct RegistryHandler {
    name: String,
    registry: Arc<HandlerRegistry>,
}

#[async_trait]
impl Handler for RegistryHandler {
    async fn call(&self, args: Value, ctx: &HandlerContext) -> Result<HandlerResult, HandlerError> {
        let handler = self
            .registry
            .get(&self.name)
            .ok_or_else(|| HandlerError::not_registered(&self.name))?;
        handler.call(args, ctx).await
    }
}

#[cfg(test)]
mod registry_resolver_tests {
    use super::*;
    use crate::handler::{HandlerErrorKind, handler_fn};

    fn constant(text: &'static str) -> ToolHandler {
        handler_fn(move |_args, _ctx| async move { Ok(HandlerResult::text(text)) })
    }

    #[tokio::test]
    async fn test_unregistered_name() {
        let resolver = RegistryResolver::new(Arc::new(HandlerRegistry::new()));

        let error = match resolver.resolve_registry(&RegistryConfig::new("missing")) {
            Ok(_) => panic!("unregistered name must not resolve"),
            Err(error) => error,
        };
        assert_eq!(error.kind, HandlerErrorKind::HandlerNotRegistered);
    }

    #[tokio::test]
    async fn test_lookup_follows_replace() {
        let registry = Arc::new(HandlerRegistry::new());
        registry.register("greet", constant("v1")).unwrap();
        let resolver = RegistryResolver::new(registry.clone());

        let handler = resolver
            .resolve_registry(&RegistryConfig::new("greet"))
            .unwrap();
        let ctx = HandlerContext::new("s");
        assert_eq!(handler.call(Value::Null, &ctx).await.unwrap().joined_text(), "v1");

        registry.replace("greet", constant("v2")).unwrap();
        assert_eq!(handler.call(Value::Null, &ctx).await.unwrap().joined_text(), "v2");
    }
}
