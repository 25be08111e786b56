//! Handler resolution
//!
//! A [`Resolver`] turns one [`HandlerConfig`] variant into a [`ToolHandler`].
//! The [`Dispatcher`] owns one resolver per backend, selects by exhaustive
//! match on the configuration, runs the permission check and memoizes
//! successful resolutions by configuration fingerprint.
//!
//! Construction order:
//! ```rust,no_run
//! use handlerkit_core::config::FrameworkConfig;
//! use handlerkit_core::handler::HandlerRegistry;
//! use handlerkit_core::resolve::Dispatcher;
//! use std::sync::Arc;
//!
//! # fn main() -> handlerkit_core::error::Result<()> {
//! let config = FrameworkConfig::load()?;
//! let registry = Arc::new(HandlerRegistry::new());
//! let dispatcher = Dispatcher::new(&config, registry)?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod file;
pub mod http;
pub mod inline;
pub mod registry;

pub use cache::ResolutionCache;
pub use file::FileResolver;
pub use http::HttpResolver;
pub use inline::InlineResolver;
pub use registry::RegistryResolver;

use crate::config::FrameworkConfig;
use crate::handler::{
    HandlerConfig, HandlerError, HandlerKind, HandlerRegistry, Permissions, ToolHandler,
};
use crate::sandbox::ScriptSandbox;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// A backend that can turn configurations into handlers
#[async_trait]
pub trait Resolver: Send + Sync {
    /// The configuration kind this resolver handles
    fn kind(&self) -> HandlerKind;

    /// Whether this resolver claims `config`
    fn can_resolve(&self, config: &HandlerConfig) -> bool {
        config.kind() == self.kind()
    }

    /// Check `permissions` allow resolving `config`
    ///
    /// Runs before any cache lookup, so a cached handler never bypasses it.
    fn authorize(
        &self,
        _config: &HandlerConfig,
        _permissions: &Permissions,
    ) -> Result<(), HandlerError> {
        Ok(())
    }

    /// Whether resolutions may be memoized
    fn cacheable(&self) -> bool {
        true
    }

    /// Resolve the configuration into a handler
    async fn resolve(&self, config: &HandlerConfig) -> Result<ToolHandler, HandlerError>;
}

pub(crate) fn mismatched(kind: HandlerKind, config: &HandlerConfig) -> HandlerError {
    HandlerError::internal(format!(
        "{} resolver received a {} configuration",
        kind,
        config.kind()
    ))
}

/// Selects the resolver for a configuration and caches its output
pub struct Dispatcher {
    inline: InlineResolver,
    file: FileResolver,
    http: HttpResolver,
    registry: RegistryResolver,
    cache: ResolutionCache<String, ToolHandler>,
}

impl Dispatcher {
    /// Build the four resolvers from framework configuration
    pub fn new(config: &FrameworkConfig, registry: Arc<HandlerRegistry>) -> crate::Result<Self> {
        config.validate()?;

        let client = HttpResolver::build_client(&config.http)?;
        let sandbox = ScriptSandbox::with_http(
            config.sandbox.clone(),
            client.clone(),
            config.http.max_response_bytes,
        );

        Ok(Self {
            inline: InlineResolver::new(sandbox.clone()),
            file: FileResolver::new(config.file.base_dir.clone(), sandbox.clone()),
            http: HttpResolver::new(client, sandbox, config.engine.retry.clone(), &config.http),
            registry: RegistryResolver::new(registry),
            cache: ResolutionCache::new(),
        })
    }

    fn resolver_for(&self, config: &HandlerConfig) -> &dyn Resolver {
        match config {
            HandlerConfig::Inline(_) => &self.inline,
            HandlerConfig::File(_) => &self.file,
            HandlerConfig::Http(_) => &self.http,
            HandlerConfig::Registry(_) => &self.registry,
        }
    }

    /// Resolve a configuration under `permissions`
    pub async fn resolve(
        &self,
        config: &HandlerConfig,
        permissions: &Permissions,
    ) -> Result<ToolHandler, HandlerError> {
        let resolver = self.resolver_for(config);
        if let Err(error) = resolver.authorize(config, permissions) {
            tracing::warn!(kind = %config.kind(), error = %error, "Resolution denied");
            return Err(error);
        }

        if !resolver.cacheable() {
            return resolver.resolve(config).await;
        }

        let key = config.fingerprint();
        self.cache
            .get_or_try_init(&key, || async {
                tracing::debug!(kind = %config.kind(), key = %key, "Resolving handler");
                resolver.resolve(config).await
            })
            .await
    }

    /// Parse a raw description and resolve it
    pub async fn resolve_value(
        &self,
        value: Value,
        permissions: &Permissions,
    ) -> Result<ToolHandler, HandlerError> {
        let config = HandlerConfig::from_value(value)?;
        self.resolve(&config, permissions).await
    }

    /// All resolvers, one per backend
    pub fn resolvers(&self) -> [&dyn Resolver; 4] {
        [&self.inline, &self.file, &self.http, &self.registry]
    }

    /// Number of memoized resolutions
    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    /// The registry backing `registry` configurations
    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        self.registry.registry()
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("cached", &self.cache_len())
            .field("registry", self.registry())
            .finish()
    }
}

#[cfg(test)]
mod dispatch_tests {
    use super::*;
    use crate::handler::{HandlerContext, HandlerErrorKind, HandlerResult, handler_fn};

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(&FrameworkConfig::default(), Arc::new(HandlerRegistry::new())).unwrap()
    }

    #[test]
    fn test_each_kind_claimed_once() {
        let dispatcher = dispatcher();
        let configs = [
            HandlerConfig::inline("1"),
            HandlerConfig::file("a.rhai"),
            HandlerConfig::http("http://localhost/"),
            HandlerConfig::registry("x"),
        ];

        for config in &configs {
            let claims = dispatcher
                .resolvers()
                .iter()
                .filter(|r| r.can_resolve(config))
                .count();
            assert_eq!(claims, 1, "{} claimed {} times", config.kind(), claims);
        }
    }

    #[tokio::test]
    async fn test_resolution_is_cached_by_fingerprint() {
        let dispatcher = dispatcher();
        let config = HandlerConfig::inline("args");
        let permissions = Permissions::unrestricted();

        let first = dispatcher.resolve(&config, &permissions).await.unwrap();
        let second = dispatcher
            .resolve(&HandlerConfig::inline("args"), &permissions)
            .await
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(dispatcher.cache_len(), 1);
    }

    #[tokio::test]
    async fn test_failed_resolution_not_cached() {
        let dispatcher = dispatcher();
        let result = dispatcher
            .resolve(&HandlerConfig::inline("fn ("), &Permissions::unrestricted())
            .await;

        assert!(result.is_err());
        assert_eq!(dispatcher.cache_len(), 0);
    }

    #[tokio::test]
    async fn test_authorization_precedes_cache() {
        let dispatcher = dispatcher();
        let config = HandlerConfig::http("http://api.example.com/v1");

        dispatcher
            .resolve(&config, &Permissions::unrestricted())
            .await
            .unwrap();

        let error = match dispatcher.resolve(&config, &Permissions::deny_all()).await {
            Ok(_) => panic!("denied permissions must not reach the cache"),
            Err(error) => error,
        };
        assert_eq!(error.kind, HandlerErrorKind::PermissionDenied);
    }

    #[tokio::test]
    async fn test_registry_resolutions_bypass_cache() {
        let dispatcher = dispatcher();
        dispatcher
            .registry()
            .register(
                "ok",
                handler_fn(|_args, _ctx| async { Ok(HandlerResult::text("ok")) }),
            )
            .unwrap();

        let handler = dispatcher
            .resolve(&HandlerConfig::registry("ok"), &Permissions::unrestricted())
            .await
            .unwrap();
        let result = handler
            .call(Value::Null, &HandlerContext::new("s"))
            .await
            .unwrap();

        assert_eq!(result.joined_text(), "ok");
        assert_eq!(dispatcher.cache_len(), 0);
    }

    #[tokio::test]
    async fn test_unknown_type_from_value() {
        let error = match dispatcher()
            .resolve_value(
                serde_json::json!({ "type": "grpc", "endpoint": "x" }),
                &Permissions::unrestricted(),
            )
            .await
        {
            Ok(_) => panic!("unknown type must not resolve"),
            Err(error) => error,
        };
        assert_eq!(error.kind, HandlerErrorKind::UnsupportedHandlerType);
    }
}
