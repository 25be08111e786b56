//! Execution engine
//!
//! Runs a resolved handler with:
//! - A timeout per attempt (caller, then handler, then engine default)
//! - Retries for retryable failures under a [`RetryPolicy`]
//! - External abort that supersedes both
//!
//! Resolution failures are returned as they are and never retried.
//!
//! HTTP handlers retry and time out per request on their own, so the engine
//! makes a single attempt for them under a deadline covering the handler's
//! whole retry schedule.

mod retry;

pub use retry::{Backoff, RetryOutcome, RetryPolicy, with_retry};

use crate::config::EngineConfig;
use crate::handler::{
    HandlerConfig, HandlerContext, HandlerError, HandlerKind, HandlerResult, HttpConfig,
    ToolHandler,
};
use crate::resolve::Dispatcher;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Per-call execution options
#[derive(Debug, Clone, Default)]
pub struct HandlerExecutionOptions {
    /// Overrides the handler's own timeout and the engine default
    pub timeout: Option<Duration>,
    /// Overrides the engine's retry policy
    pub retry: Option<RetryPolicy>,
    /// External abort signal
    pub abort: Option<CancellationToken>,
}

impl HandlerExecutionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_abort(mut self, abort: CancellationToken) -> Self {
        self.abort = Some(abort);
        self
    }
}

/// Record of how an invocation was executed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionProvenance {
    pub handler_kind: HandlerKind,
    /// Fingerprint of the configuration
    pub config_hash: String,
    pub session_id: String,
    pub invocation_id: Uuid,
    pub started_at: DateTime<Utc>,
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    /// Attempts made; zero when resolution failed
    pub attempts: u32,
}

/// Outcome and provenance of one execution
#[derive(Debug)]
pub struct ExecutionReport {
    pub outcome: Result<HandlerResult, HandlerError>,
    pub provenance: ExecutionProvenance,
}

impl ExecutionReport {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn into_result(self) -> Result<HandlerResult, HandlerError> {
        self.outcome
    }

    /// Whether the handler failed before it ever ran
    pub fn is_resolution_failure(&self) -> bool {
        self.provenance.attempts == 0
            && self
                .outcome
                .as_ref()
                .is_err_and(|error| error.kind.is_resolution())
    }
}

/// Resolves and runs handlers
pub struct ExecutionEngine {
    dispatcher: Arc<Dispatcher>,
    config: EngineConfig,
}

impl ExecutionEngine {
    pub fn new(dispatcher: Arc<Dispatcher>, config: EngineConfig) -> Self {
        Self { dispatcher, config }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Timeout applied to each attempt
    pub fn effective_timeout(
        &self,
        config: &HandlerConfig,
        options: &HandlerExecutionOptions,
    ) -> Duration {
        options
            .timeout
            .or_else(|| match config {
                HandlerConfig::Http(http) => Some(self.http_deadline(http)),
                other => other.declared_timeout(),
            })
            .unwrap_or(self.config.default_timeout)
    }

    /// Retry policy for the engine's own attempt loop
    pub fn retry_policy(
        &self,
        config: &HandlerConfig,
        options: &HandlerExecutionOptions,
    ) -> RetryPolicy {
        let policy = options
            .retry
            .clone()
            .unwrap_or_else(|| self.config.retry.clone());
        match config {
            // `retries` in the configuration is the whole attempt budget
            HandlerConfig::Http(_) => policy.with_max_attempts(1),
            _ => policy,
        }
    }

    /// Worst case for an HTTP handler: every request and transform at its
    /// own timeout, every backoff pause, plus one timeout of slack
    fn http_deadline(&self, http: &HttpConfig) -> Duration {
        let attempts = http.retries.saturating_add(1);
        let transforms = u32::from(http.request_transform.is_some())
            + u32::from(http.response_transform.is_some());
        let backoff = self
            .config
            .retry
            .clone()
            .with_max_attempts(attempts)
            .total_delay();

        http.timeout_duration()
            .saturating_mul(attempts.saturating_add(transforms).saturating_add(1))
            .saturating_add(backoff)
    }

    /// Resolve and execute a handler
    pub async fn execute(
        &self,
        config: &HandlerConfig,
        args: Value,
        ctx: &HandlerContext,
        options: &HandlerExecutionOptions,
    ) -> Result<HandlerResult, HandlerError> {
        self.execute_traced(config, args, ctx, options)
            .await
            .into_result()
    }

    /// Resolve and execute a handler, returning provenance alongside the outcome
    pub async fn execute_traced(
        &self,
        config: &HandlerConfig,
        args: Value,
        ctx: &HandlerContext,
        options: &HandlerExecutionOptions,
    ) -> ExecutionReport {
        let started_at = Utc::now();
        let clock = Instant::now();
        let attempts = AtomicU32::new(0);
        let abort = options.abort.as_ref();

        let outcome = if is_aborted(abort, ctx) {
            Err(HandlerError::aborted("Invocation was aborted before execution"))
        } else {
            match self.dispatcher.resolve(config, &ctx.permissions).await {
                Ok(handler) => {
                    let timeout = self.effective_timeout(config, options);
                    let policy = self.retry_policy(config, options);

                    let attempts = &attempts;
                    let handler = &handler;
                    let args = &args;
                    let retried = with_retry(&policy, move |attempt| {
                        attempts.store(attempt, Ordering::SeqCst);
                        run_attempt(handler, args.clone(), ctx, abort, timeout)
                    });

                    tokio::select! {
                        biased;
                        _ = wait_for_abort(abort, ctx) => {
                            Err(HandlerError::aborted("Invocation was aborted"))
                        }
                        outcome = retried => outcome.result,
                    }
                }
                Err(error) => Err(error),
            }
        };

        let provenance = ExecutionProvenance {
            handler_kind: config.kind(),
            config_hash: config.fingerprint(),
            session_id: ctx.session_id.clone(),
            invocation_id: ctx.invocation_id,
            started_at,
            duration: clock.elapsed(),
            attempts: attempts.load(Ordering::SeqCst),
        };

        match &outcome {
            Ok(_) => tracing::info!(
                kind = %provenance.handler_kind,
                session_id = %provenance.session_id,
                invocation_id = %provenance.invocation_id,
                attempts = provenance.attempts,
                duration_ms = provenance.duration.as_millis() as u64,
                "Handler completed"
            ),
            Err(error) => tracing::warn!(
                kind = %provenance.handler_kind,
                session_id = %provenance.session_id,
                invocation_id = %provenance.invocation_id,
                attempts = provenance.attempts,
                code = %error.code,
                error = %error.message,
                "Handler failed"
            ),
        }

        ExecutionReport {
            outcome,
            provenance,
        }
    }
}

impl std::fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("dispatcher", &self.dispatcher)
            .field("config", &self.config)
            .finish()
    }
}

async fn run_attempt(
    handler: &ToolHandler,
    args: Value,
    ctx: &HandlerContext,
    abort: Option<&CancellationToken>,
    timeout: Duration,
) -> Result<HandlerResult, HandlerError> {
    let attempt_ctx = ctx.child();
    let call = handler.call(args, &attempt_ctx);

    tokio::select! {
        biased;
        _ = wait_for_abort(abort, ctx) => {
            attempt_ctx.cancellation.cancel();
            Err(HandlerError::aborted("Invocation was aborted"))
        }
        result = tokio::time::timeout(timeout, call) => match result {
            Ok(result) => result,
            Err(_) => {
                attempt_ctx.cancellation.cancel();
                // An abort landing with the deadline still wins
                if is_aborted(abort, ctx) {
                    Err(HandlerError::aborted("Invocation was aborted"))
                } else {
                    Err(HandlerError::timeout(timeout))
                }
            }
        },
    }
}

fn is_aborted(abort: Option<&CancellationToken>, ctx: &HandlerContext) -> bool {
    ctx.is_cancelled() || abort.is_some_and(CancellationToken::is_cancelled)
}

async fn wait_for_abort(abort: Option<&CancellationToken>, ctx: &HandlerContext) {
    match abort {
        Some(token) => tokio::select! {
            _ = token.cancelled() => {}
            _ = ctx.cancellation.cancelled() => {}
        },
        None => ctx.cancellation.cancelled().await,
    }
}

#[cfg(test)]
mod engine_tests {
    use super::*;
    use crate::config::FrameworkConfig;
    use crate::handler::{HandlerErrorKind, HandlerRegistry, handler_fn};

    fn engine_with(name: &str, handler: ToolHandler) -> ExecutionEngine {
        let registry = Arc::new(HandlerRegistry::new());
        registry.register(name, handler).unwrap();
        let config = FrameworkConfig::default();
        let dispatcher = Dispatcher::new(&config, registry).unwrap();
        ExecutionEngine::new(Arc::new(dispatcher), config.engine)
    }

    fn fast_retries(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::default()
            .with_max_attempts(max_attempts)
            .with_initial_delay(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let engine = engine_with(
            "flaky",
            handler_fn(move |_args, _ctx| {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(HandlerError::network("connection reset"))
                    } else {
                        Ok(HandlerResult::text("ok"))
                    }
                }
            }),
        );

        let report = engine
            .execute_traced(
                &HandlerConfig::registry("flaky"),
                Value::Null,
                &HandlerContext::new("s"),
                &HandlerExecutionOptions::new().with_retry(fast_retries(3)),
            )
            .await;

        assert!(report.is_success());
        assert_eq!(report.provenance.attempts, 3);
        assert_eq!(report.provenance.handler_kind, HandlerKind::Registry);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_semantic_failure_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let engine = engine_with(
            "bad",
            handler_fn(move |_args, _ctx| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(HandlerError::execution("bad input")) }
            }),
        );

        let error = engine
            .execute(
                &HandlerConfig::registry("bad"),
                Value::Null,
                &HandlerContext::new("s"),
                &HandlerExecutionOptions::new().with_retry(fast_retries(5)),
            )
            .await
            .unwrap_err();

        assert_eq!(error.kind, HandlerErrorKind::Execution);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_resolution_failure_has_no_attempts() {
        let engine = engine_with(
            "present",
            handler_fn(|_args, _ctx| async { Ok(HandlerResult::new()) }),
        );

        let report = engine
            .execute_traced(
                &HandlerConfig::registry("absent"),
                Value::Null,
                &HandlerContext::new("s"),
                &HandlerExecutionOptions::new().with_retry(fast_retries(3)),
            )
            .await;

        assert!(report.is_resolution_failure());
        let error = report.outcome.unwrap_err();
        assert_eq!(error.kind, HandlerErrorKind::HandlerNotRegistered);
        assert_eq!(report.provenance.attempts, 0);
    }

    #[tokio::test]
    async fn test_call_failure_is_not_resolution_failure() {
        let engine = engine_with(
            "denied",
            handler_fn(|_args, _ctx| async {
                Err(HandlerError::permission_denied("not today"))
            }),
        );

        let report = engine
            .execute_traced(
                &HandlerConfig::registry("denied"),
                Value::Null,
                &HandlerContext::new("s"),
                &HandlerExecutionOptions::new(),
            )
            .await;

        assert_eq!(report.provenance.attempts, 1);
        assert!(!report.is_resolution_failure());
    }

    #[tokio::test]
    async fn test_timeout_cancels_attempt_context() {
        let tokens = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen = tokens.clone();
        let engine = engine_with(
            "slow",
            handler_fn(move |_args, ctx| {
                seen.lock().unwrap().push(ctx.cancellation.clone());
                async {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(HandlerResult::text("late"))
                }
            }),
        );
        let ctx = HandlerContext::new("s");

        let error = engine
            .execute(
                &HandlerConfig::registry("slow"),
                Value::Null,
                &ctx,
                &HandlerExecutionOptions::new().with_timeout(Duration::from_millis(20)),
            )
            .await
            .unwrap_err();

        assert_eq!(error.kind, HandlerErrorKind::Timeout);
        let tokens = tokens.lock().unwrap();
        assert_eq!(tokens.len(), 1);
        assert!(tokens[0].is_cancelled());
        assert!(!ctx.is_cancelled());
    }

    #[tokio::test]
    async fn test_abort_recorded_at_deadline_wins() {
        let abort = CancellationToken::new();
        let trigger = abort.clone();
        let engine = engine_with(
            "hang",
            handler_fn(move |_args, _ctx| {
                trigger.cancel();
                std::future::pending::<Result<HandlerResult, HandlerError>>()
            }),
        );

        let error = engine
            .execute(
                &HandlerConfig::registry("hang"),
                Value::Null,
                &HandlerContext::new("s"),
                &HandlerExecutionOptions::new()
                    .with_timeout(Duration::ZERO)
                    .with_abort(abort),
            )
            .await
            .unwrap_err();

        assert_eq!(error.kind, HandlerErrorKind::Aborted);
    }

    #[tokio::test]
    async fn test_effective_timeout_precedence() {
        let engine = engine_with(
            "x",
            handler_fn(|_args, _ctx| async { Ok(HandlerResult::new()) }),
        );
        let inline = HandlerConfig::Inline(
            crate::handler::InlineConfig::new("1").with_timeout(Duration::from_millis(250)),
        );
        let none = HandlerExecutionOptions::new();
        let explicit = HandlerExecutionOptions::new().with_timeout(Duration::from_secs(1));

        assert_eq!(engine.effective_timeout(&inline, &none), Duration::from_millis(250));
        assert_eq!(engine.effective_timeout(&inline, &explicit), Duration::from_secs(1));
        assert_eq!(
            engine.effective_timeout(&HandlerConfig::registry("x"), &none),
            engine.config().default_timeout
        );
    }

    #[test]
    fn test_http_deadline_covers_every_attempt() {
        let engine = engine_with(
            "x",
            handler_fn(|_args, _ctx| async { Ok(HandlerResult::new()) }),
        );
        let http = HandlerConfig::Http(
            HttpConfig::new("http://127.0.0.1/")
                .with_timeout(Duration::from_millis(400))
                .with_retries(4),
        );

        // 5 attempts + 1 slack at 400ms, then 100+200+300+400ms of backoff
        assert_eq!(
            engine.effective_timeout(&http, &HandlerExecutionOptions::new()),
            Duration::from_millis(6 * 400 + 1000)
        );

        let transformed = HandlerConfig::Http(
            HttpConfig::new("http://127.0.0.1/")
                .with_timeout(Duration::from_millis(100))
                .with_response_transform("response.body"),
        );
        assert_eq!(
            engine.effective_timeout(&transformed, &HandlerExecutionOptions::new()),
            Duration::from_millis(300)
        );
    }

    #[test]
    fn test_http_handlers_own_their_retries() {
        let engine = engine_with(
            "x",
            handler_fn(|_args, _ctx| async { Ok(HandlerResult::new()) }),
        );
        let options = HandlerExecutionOptions::new().with_retry(fast_retries(3));

        let http = HandlerConfig::http("http://127.0.0.1/");
        assert_eq!(engine.retry_policy(&http, &options).max_attempts, 1);
        assert_eq!(
            engine
                .retry_policy(&HandlerConfig::registry("x"), &options)
                .max_attempts,
            3
        );
    }
}
