//! File backend: script modules loaded from disk
//!
//! Relative paths resolve against the configured base directory. Modules are
//! compiled once per canonical path and kept for the process lifetime.

use super::Resolver;
use super::cache::ResolutionCache;
use crate::handler::{
    FileConfig, Handler, HandlerConfig, HandlerContext, HandlerError, HandlerErrorKind,
    HandlerKind, HandlerResult, Permissions, ToolHandler, check_resolved_file_access,
    normalize_path,
};
use crate::sandbox::{Script, ScriptSandbox};
use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Resolves `file` configurations
pub struct FileResolver {
    base_dir: PathBuf,
    sandbox: ScriptSandbox,
    modules: ResolutionCache<PathBuf, Script>,
}

impl FileResolver {
    pub fn new(base_dir: impl Into<PathBuf>, sandbox: ScriptSandbox) -> Self {
        Self {
            base_dir: base_dir.into(),
            sandbox,
            modules: ResolutionCache::new(),
        }
    }

    /// Lexically resolved module path (before canonicalization)
    pub fn module_path(&self, config: &FileConfig) -> PathBuf {
        if config.path.is_absolute() {
            normalize_path(&config.path)
        } else {
            normalize_path(&self.base_dir.join(&config.path))
        }
    }

    /// Number of compiled modules held
    pub fn loaded_modules(&self) -> usize {
        self.modules.len()
    }

    /// Load the module and bind the configured export
    pub async fn resolve_file(&self, config: &FileConfig) -> Result<ToolHandler, HandlerError> {
        let requested = self.module_path(config);
        let canonical = tokio::fs::canonicalize(&requested).await.map_err(|e| {
            HandlerError::module_load(format!(
                "Module '{}' could not be found: {}",
                requested.display(),
                e
            ))
            .with_details(serde_json::json!({ "path": requested.display().to_string() }))
        })?;

        let script = self.load_module(&canonical).await?;
        let export = config.export_name();
        if !script.has_function(export) {
            return Err(HandlerError::export_not_found(
                export,
                &canonical.display().to_string(),
            ));
        }

        tracing::debug!(module = %canonical.display(), export, "Resolved file handler");
        Ok(Arc::new(FileHandler {
            path: canonical,
            export: export.to_string(),
            script,
        }))
    }

    async fn load_module(&self, path: &Path) -> Result<Script, HandlerError> {
        let sandbox = &self.sandbox;
        self.modules
            .get_or_try_init(&path.to_path_buf(), || async move {
                let source = tokio::fs::read_to_string(path).await.map_err(|e| {
                    HandlerError::module_load(format!(
                        "Failed to read module '{}': {}",
                        path.display(),
                        e
                    ))
                })?;

                let name = path.display().to_string();
                sandbox.compile_named(&name, &source).map_err(|error| {
                    HandlerError::module_load(error.message)
                        .with_details(serde_json::json!({ "path": name, "cause": error.code }))
                })
            })
            .await
    }
}

#[async_trait]
impl Resolver for FileResolver {
    fn kind(&self) -> HandlerKind {
        HandlerKind::File
    }

    fn authorize(
        &self,
        config: &HandlerConfig,
        permissions: &Permissions,
    ) -> Result<(), HandlerError> {
        let HandlerConfig::File(file) = config else {
            return Ok(());
        };
        check_resolved_file_access(&self.module_path(file), permissions).into_result()
    }

    async fn resolve(&self, config: &HandlerConfig) -> Result<ToolHandler, HandlerError> {
        match config {
            HandlerConfig::File(file) => self.resolve_file(file).await,
            other => Err(super::mismatched(self.kind(), other)),
        }
    }
}

struct FileHandler {
    path: PathBuf,
    export: String,
    script: Script,
}

#[async_trait]
impl Handler for FileHandler {
    async fn call(&self, args: Value, ctx: &HandlerContext) -> Result<HandlerResult, HandlerError> {
        // Cached handlers outlive the permissions they were resolved under
        check_resolved_file_access(&self.path, &ctx.permissions).into_result()?;

        self.script
            .run_function(&self.export, args, ctx, None)
            .await
            .map_err(|error| match error.kind {
                HandlerErrorKind::ExportNotFound => HandlerError::export_not_found(
                    &self.export,
                    &self.path.display().to_string(),
                ),
                _ => error,
            })
    }
}

#[cfg(test)]
mod file_tests {
    use super::*;
    use crate::config::SandboxConfig;
    use std::io::Write;

    fn resolver(base: &Path) -> FileResolver {
        FileResolver::new(base, ScriptSandbox::new(SandboxConfig::default()))
    }

    fn write_module(dir: &Path, name: &str, source: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::File::create(&path)
            .unwrap()
            .write_all(source.as_bytes())
            .unwrap();
        path
    }

    #[tokio::test]
    async fn test_relative_path_uses_base_dir() {
        let dir = tempfile::tempdir().unwrap();
        write_module(dir.path(), "greet.rhai", r#"fn handler(args) { "hi " + args.name }"#);

        let handler = resolver(dir.path())
            .resolve_file(&FileConfig::new("greet.rhai"))
            .await
            .unwrap();
        let result = handler
            .call(serde_json::json!({ "name": "bo" }), &HandlerContext::new("s"))
            .await
            .unwrap();

        assert_eq!(result.joined_text(), "hi bo");
    }

    #[tokio::test]
    async fn test_named_export() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_module(
            dir.path(),
            "multi.rhai",
            "fn handler(args) { 1 }\nfn double(args) { args.n * 2 }",
        );

        let handler = resolver(dir.path())
            .resolve_file(&FileConfig::new(&path).with_export("double"))
            .await
            .unwrap();
        let result = handler
            .call(serde_json::json!({ "n": 21 }), &HandlerContext::new("s"))
            .await
            .unwrap();

        assert_eq!(result.joined_text(), "42");
    }

    #[tokio::test]
    async fn test_module_compiled_once() {
        let dir = tempfile::tempdir().unwrap();
        write_module(dir.path(), "m.rhai", "fn handler() { 1 }\nfn other() { 2 }");
        let resolver = resolver(dir.path());

        resolver.resolve_file(&FileConfig::new("m.rhai")).await.unwrap();
        resolver
            .resolve_file(&FileConfig::new("./m.rhai").with_export("other"))
            .await
            .unwrap();

        assert_eq!(resolver.loaded_modules(), 1);
    }

    #[tokio::test]
    async fn test_syntax_error_is_module_load_error() {
        let dir = tempfile::tempdir().unwrap();
        write_module(dir.path(), "broken.rhai", "fn handler( {");

        let error = match resolver(dir.path())
            .resolve_file(&FileConfig::new("broken.rhai"))
            .await
        {
            Ok(_) => panic!("broken module must not resolve"),
            Err(error) => error,
        };
        assert_eq!(error.kind, HandlerErrorKind::ModuleLoadError);
    }

    #[tokio::test]
    async fn test_call_time_permissions() {
        let dir = tempfile::tempdir().unwrap();
        write_module(dir.path(), "ok.rhai", "fn handler() { 1 }");
        let handler = resolver(dir.path())
            .resolve_file(&FileConfig::new("ok.rhai"))
            .await
            .unwrap();

        let ctx = HandlerContext::new("s").with_permissions(Permissions::deny_all());
        let error = handler.call(Value::Null, &ctx).await.unwrap_err();
        assert_eq!(error.kind, HandlerErrorKind::PermissionDenied);
    }

    #[test]
    fn test_authorize_uses_normalized_path() {
        let resolver = resolver(Path::new("/srv/handlers"));
        let permissions = Permissions::unrestricted().allow_path("/srv/handlers");

        let inside = HandlerConfig::file("tools/a.rhai");
        let escape = HandlerConfig::file("../secrets/a.rhai");

        assert!(resolver.authorize(&inside, &permissions).is_ok());
        assert_eq!(
            resolver.authorize(&escape, &permissions).unwrap_err().kind,
            HandlerErrorKind::PermissionDenied
        );
    }
}
