//! Host functions exposed to scripts
//!
//! Filesystem and network primitives consult the permission guard before
//! doing anything. Async work (HTTP, capability callbacks) runs on the
//! runtime handle from the blocking worker and still honors the deadline and
//! cancellation token.

use crate::handler::{
    HandlerContext, HandlerError, ProgressUpdate, SamplingRequest, check_network_access,
    check_resolved_file_access, resolve_path,
};
use crate::resolve::http::{read_body_limited, response_value};
use rhai::{Dynamic, Engine, EvalAltResult, Position};
use serde_json::Value;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A framework error raised from inside a primitive
///
/// Carried through the script as the thrown value so the caller sees the
/// original error kind.
#[derive(Debug, Clone)]
pub(crate) struct PrimitiveFailure(pub HandlerError);

pub(crate) struct PrimitiveEnv {
    pub ctx: HandlerContext,
    pub handle: tokio::runtime::Handle,
    pub deadline: Option<Instant>,
    pub timeout: Option<Duration>,
    pub http: Option<reqwest::Client>,
    pub max_response_bytes: usize,
}

impl PrimitiveEnv {
    /// Drive a future to completion from the blocking worker
    fn block_on<T>(
        &self,
        future: impl Future<Output = Result<T, HandlerError>>,
    ) -> Result<T, HandlerError> {
        let cancel = self.ctx.cancellation.clone();
        let deadline = self.deadline;
        let timeout = self.timeout.unwrap_or_default();

        self.handle.block_on(async move {
            let expired = async {
                match deadline {
                    Some(deadline) => {
                        tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await
                    }
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(HandlerError::aborted("Script evaluation was aborted")),
                _ = expired => Err(HandlerError::timeout(timeout)),
                result = future => result,
            }
        })
    }
}

fn raise(error: HandlerError) -> Box<EvalAltResult> {
    EvalAltResult::ErrorRuntime(Dynamic::from(PrimitiveFailure(error)), Position::NONE).into()
}

fn bind(value: &Value) -> Result<Dynamic, Box<EvalAltResult>> {
    rhai::serde::to_dynamic(value)
}

pub(crate) fn register(engine: &mut Engine, env: Arc<PrimitiveEnv>) {
    let e = env.clone();
    engine.register_fn("log", move |message: &str| e.ctx.logger.info(message));

    let e = env.clone();
    engine.register_fn(
        "read_file",
        move |path: &str| -> Result<String, Box<EvalAltResult>> {
            let path = Path::new(path);
            check_resolved_file_access(path, &e.ctx.permissions)
                .into_result()
                .map_err(raise)?;

            std::fs::read_to_string(resolve_path(path)).map_err(|err| {
                raise(HandlerError::execution(format!(
                    "Failed to read '{}': {}",
                    path.display(),
                    err
                )))
            })
        },
    );

    let e = env.clone();
    engine.register_fn(
        "file_exists",
        move |path: &str| -> Result<bool, Box<EvalAltResult>> {
            let path = Path::new(path);
            check_resolved_file_access(path, &e.ctx.permissions)
                .into_result()
                .map_err(raise)?;
            Ok(resolve_path(path).exists())
        },
    );

    let e = env.clone();
    engine.register_fn(
        "http_get",
        move |url: &str| -> Result<Dynamic, Box<EvalAltResult>> {
            let url = reqwest::Url::parse(url).map_err(|err| {
                raise(HandlerError::execution(format!("Invalid URL '{}': {}", url, err)))
            })?;
            let host = url.host_str().unwrap_or_default().to_string();
            check_network_access(&host, &e.ctx.permissions)
                .into_result()
                .map_err(raise)?;

            let client = e
                .http
                .clone()
                .ok_or_else(|| raise(HandlerError::network("No HTTP client is available")))?;
            let limit = e.max_response_bytes;
            let value = e
                .block_on(async move {
                    let response = client
                        .get(url)
                        .send()
                        .await
                        .map_err(|err| HandlerError::network(err.to_string()))?;
                    let status = response.status();
                    let headers = response.headers().clone();
                    let body = read_body_limited(response, limit).await?;
                    Ok(response_value(status, &headers, &body))
                })
                .map_err(raise)?;
            bind(&value)
        },
    );

    let e = env.clone();
    engine.register_fn(
        "report_progress",
        move |progress: f64, total: f64| -> Result<(), Box<EvalAltResult>> {
            report(&e, ProgressUpdate::new(progress).with_total(total))
        },
    );

    let e = env.clone();
    engine.register_fn(
        "report_progress",
        move |progress: i64, total: i64| -> Result<(), Box<EvalAltResult>> {
            report(&e, ProgressUpdate::new(progress as f64).with_total(total as f64))
        },
    );

    let e = env.clone();
    engine.register_fn(
        "report_progress",
        move |progress: i64| -> Result<(), Box<EvalAltResult>> {
            report(&e, ProgressUpdate::new(progress as f64))
        },
    );

    let e = env.clone();
    engine.register_fn(
        "sample",
        move |prompt: &str| -> Result<String, Box<EvalAltResult>> {
            let request = SamplingRequest::prompt(prompt);
            let ctx = &e.ctx;
            e.block_on(async move { ctx.sample(request).await.map(|response| response.content) })
                .map_err(raise)
        },
    );

    let e = env;
    engine.register_fn(
        "read_resource",
        move |uri: &str| -> Result<Dynamic, Box<EvalAltResult>> {
            let uri = uri.to_string();
            let ctx = &e.ctx;
            let contents = e
                .block_on(async move { ctx.read_resource(&uri).await })
                .map_err(raise)?;
            let value = serde_json::to_value(contents)
                .map_err(|err| raise(HandlerError::internal(err.to_string())))?;
            bind(&value)
        },
    );
}

fn report(env: &PrimitiveEnv, update: ProgressUpdate) -> Result<(), Box<EvalAltResult>> {
    let ctx = &env.ctx;
    env.block_on(async move { ctx.report_progress(update).await })
        .map_err(raise)
}

#[cfg(test)]
mod primitive_tests {
    use super::super::ScriptSandbox;
    use crate::config::SandboxConfig;
    use crate::handler::{
        Capabilities, HandlerContext, HandlerError, HandlerErrorKind, Permissions,
        ProgressReporter, ProgressUpdate, SamplingCapability, SamplingRequest, SamplingResponse,
        SamplingRole,
    };
    use async_trait::async_trait;
    use serde_json::Value;
    use std::io::Write;
    use std::sync::{Arc, Mutex};

    struct FixedSampler;

    #[async_trait]
    impl SamplingCapability for FixedSampler {
        async fn create_message(
            &self,
            request: SamplingRequest,
        ) -> Result<SamplingResponse, HandlerError> {
            Ok(SamplingResponse {
                role: SamplingRole::Assistant,
                content: format!("sampled({})", request.messages[0].content),
                model: None,
                stop_reason: None,
            })
        }
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<ProgressUpdate>>);

    #[async_trait]
    impl ProgressReporter for Recorder {
        async fn report(&self, update: ProgressUpdate) -> Result<(), HandlerError> {
            self.0.lock().unwrap().push(update);
            Ok(())
        }
    }

    fn sandbox() -> ScriptSandbox {
        ScriptSandbox::new(SandboxConfig::default())
    }

    #[tokio::test]
    async fn test_read_file_within_allowed_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("note.txt");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(b"from disk")
            .unwrap();

        let source = format!(r#"read_file("{}")"#, path.display());
        let script = sandbox().compile(&source).unwrap();
        let ctx = HandlerContext::new("s")
            .with_permissions(Permissions::unrestricted().allow_path(dir.path()));

        let result = script.run(Value::Null, &ctx, None).await.unwrap();
        assert_eq!(result.joined_text(), "from disk");
    }

    #[tokio::test]
    async fn test_file_exists_outside_allowed_path_denied() {
        let dir = tempfile::tempdir().unwrap();
        let script = sandbox().compile(r#"file_exists("/etc/passwd")"#).unwrap();
        let ctx = HandlerContext::new("s")
            .with_permissions(Permissions::unrestricted().allow_path(dir.path()));

        let error = script.run(Value::Null, &ctx, None).await.unwrap_err();
        assert_eq!(error.kind, HandlerErrorKind::PermissionDenied);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlink_out_of_allowed_path_denied() {
        let allowed = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("secret.txt"), "TOP-SECRET").unwrap();
        std::os::unix::fs::symlink(outside.path(), allowed.path().join("link")).unwrap();
        let ctx = HandlerContext::new("s")
            .with_permissions(Permissions::unrestricted().allow_path(allowed.path()));

        let target = allowed.path().join("link").join("secret.txt");
        for source in [
            format!(r#"read_file("{}")"#, target.display()),
            format!(r#"file_exists("{}")"#, target.display()),
            format!(r#"file_exists("{}")"#, allowed.path().join("link/missing.txt").display()),
        ] {
            let script = sandbox().compile(&source).unwrap();
            let error = script.run(Value::Null, &ctx, None).await.unwrap_err();
            assert_eq!(error.kind, HandlerErrorKind::PermissionDenied, "{source}");
        }
    }

    #[tokio::test]
    async fn test_sample_and_progress_use_capabilities() {
        let recorder = Arc::new(Recorder::default());
        let ctx = HandlerContext::new("s").with_capabilities(
            Capabilities::none()
                .with_sampling(Arc::new(FixedSampler))
                .with_progress(recorder.clone()),
        );

        let script = sandbox()
            .compile(r#"report_progress(1, 2); let out = sample("hi"); report_progress(2, 2); out"#)
            .unwrap();
        let result = script.run(Value::Null, &ctx, None).await.unwrap();

        assert_eq!(result.joined_text(), "sampled(hi)");
        let updates = recorder.0.lock().unwrap();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[1].progress, 2.0);
        assert_eq!(updates[1].total, Some(2.0));
    }

    #[tokio::test]
    async fn test_missing_capability_surfaces() {
        let script = sandbox().compile(r#"sample("hi")"#).unwrap();
        let error = script
            .run(Value::Null, &HandlerContext::new("s"), None)
            .await
            .unwrap_err();

        assert_eq!(error.kind, HandlerErrorKind::CapabilityUnavailable);
    }

    #[tokio::test]
    async fn test_caught_denial_does_not_fail() {
        let script = sandbox()
            .compile(
                r#"let outcome = "read"; try { read_file("/etc/hostname"); } catch (e) { outcome = "denied"; } outcome"#,
            )
            .unwrap();
        let ctx = HandlerContext::new("s").with_permissions(Permissions::deny_all());

        let result = script.run(Value::Null, &ctx, None).await.unwrap();
        assert_eq!(result.joined_text(), "denied");
    }
}
