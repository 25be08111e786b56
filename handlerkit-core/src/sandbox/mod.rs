//! Capability-limited script execution
//!
//! Scripts are rhai source compiled once into a shareable [`Script`] and
//! evaluated on a blocking worker per invocation. Each evaluation gets its
//! own engine so primitives see that invocation's permissions and
//! capabilities. Evaluation stops when the wall-clock deadline passes or the
//! context's cancellation token fires.
//!
//! Scope bindings:
//! - `args`: the call arguments
//! - `ctx`: `#{ session_id, invocation_id, metadata }`
//!
//! Named functions are called as `fn name(args, ctx)`; functions taking one
//! or no parameter are accepted too.

mod primitives;

use crate::config::SandboxConfig;
use crate::handler::{ContentItem, HandlerContext, HandlerError, HandlerResult};
use primitives::{PrimitiveEnv, PrimitiveFailure};
use rhai::{AST, CallFnOptions, Dynamic, Engine, EvalAltResult, Scope};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};

const TERMINATE_TIMEOUT: &str = "timeout";
const TERMINATE_ABORT: &str = "aborted";

/// How often (in operations) the deadline and cancellation are polled
const PROGRESS_CHECK_INTERVAL: u64 = 256;

/// Compiles and runs sandboxed scripts
#[derive(Clone)]
pub struct ScriptSandbox {
    inner: Arc<SandboxInner>,
}

struct SandboxInner {
    config: SandboxConfig,
    compiler: Engine,
    /// `None` when no client could be built; `http_get` then fails
    http: Option<reqwest::Client>,
    max_response_bytes: usize,
}

impl ScriptSandbox {
    /// Create a sandbox with the given limits and a client built from the
    /// default HTTP backend settings
    pub fn new(config: SandboxConfig) -> Self {
        let http = crate::config::HttpBackendConfig::default();
        let client = crate::resolve::HttpResolver::build_client(&http)
            .inspect_err(|error| tracing::warn!(error = %error, "Sandbox has no HTTP client"))
            .ok();
        Self::build(config, client, http.max_response_bytes)
    }

    /// Create a sandbox whose `http_get` uses `client`
    pub fn with_http(
        config: SandboxConfig,
        client: reqwest::Client,
        max_response_bytes: usize,
    ) -> Self {
        Self::build(config, Some(client), max_response_bytes)
    }

    fn build(
        config: SandboxConfig,
        http: Option<reqwest::Client>,
        max_response_bytes: usize,
    ) -> Self {
        let compiler = base_engine(&config);
        Self {
            inner: Arc::new(SandboxInner {
                config,
                compiler,
                http,
                max_response_bytes,
            }),
        }
    }

    /// Sandbox limits
    pub fn config(&self) -> &SandboxConfig {
        &self.inner.config
    }

    /// Compile script source
    pub fn compile(&self, source: &str) -> Result<Script, HandlerError> {
        self.compile_named("<inline>", source)
    }

    /// Compile script source, naming it for diagnostics
    pub fn compile_named(&self, name: &str, source: &str) -> Result<Script, HandlerError> {
        let mut ast = self.inner.compiler.compile(source).map_err(|e| {
            HandlerError::compile(format!("Failed to compile {}: {}", name, e))
                .with_details(serde_json::json!({ "source": name }))
        })?;
        ast.set_source(name);

        tracing::debug!(
            script = name,
            functions = ast.iter_functions().count(),
            "Compiled script"
        );

        Ok(Script {
            ast: Arc::new(ast),
            name: Arc::from(name),
            sandbox: self.clone(),
        })
    }

    fn runtime_engine(&self, env: Arc<PrimitiveEnv>) -> Engine {
        let mut engine = base_engine(&self.inner.config);

        let cancel = env.ctx.cancellation.clone();
        let deadline = env.deadline;
        engine.on_progress(move |ops| {
            if ops % PROGRESS_CHECK_INTERVAL != 0 {
                return None;
            }
            if cancel.is_cancelled() {
                return Some(TERMINATE_ABORT.into());
            }
            match deadline {
                Some(deadline) if Instant::now() >= deadline => Some(TERMINATE_TIMEOUT.into()),
                _ => None,
            }
        });

        let logger = env.ctx.logger.clone();
        engine.on_print(move |text| logger.info(text));
        let logger = env.ctx.logger.clone();
        engine.on_debug(move |text, _source, _pos| logger.debug(text));

        primitives::register(&mut engine, env);
        engine
    }
}

impl std::fmt::Debug for ScriptSandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptSandbox")
            .field("config", &self.inner.config)
            .field("max_response_bytes", &self.inner.max_response_bytes)
            .finish()
    }
}

fn base_engine(config: &SandboxConfig) -> Engine {
    let mut engine = Engine::new();
    engine.set_max_operations(config.max_operations);
    engine.set_max_call_levels(config.max_call_levels);
    engine.set_max_string_size(config.max_string_size);
    engine.set_max_array_size(config.max_array_size);
    engine.set_max_map_size(config.max_map_size);
    engine.set_max_expr_depths(config.max_expr_depth, config.max_function_expr_depth);
    engine.set_module_resolver(rhai::module_resolvers::DummyModuleResolver::new());
    engine.disable_symbol("eval");
    engine
}

enum Entry {
    Body(Vec<(String, Value)>),
    Function(String, Value),
}

/// A compiled script, cheap to clone and share across invocations
#[derive(Clone)]
pub struct Script {
    ast: Arc<AST>,
    name: Arc<str>,
    sandbox: ScriptSandbox,
}

impl Script {
    /// Diagnostic name (file path or `<inline>`)
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Names of the functions the script defines
    pub fn functions(&self) -> Vec<String> {
        self.ast
            .iter_functions()
            .map(|f| f.name.to_string())
            .collect()
    }

    /// Check if the script defines a function with this name
    pub fn has_function(&self, name: &str) -> bool {
        self.ast.iter_functions().any(|f| f.name == name)
    }

    /// Evaluate the top-level body with `args` bound
    pub async fn run(
        &self,
        args: Value,
        ctx: &HandlerContext,
        timeout: Option<Duration>,
    ) -> Result<HandlerResult, HandlerError> {
        let value = self
            .execute(Entry::Body(vec![("args".to_string(), args)]), ctx, timeout)
            .await?;
        value_to_result(value)
    }

    /// Call a named function with `(args, ctx)`
    pub async fn run_function(
        &self,
        function: &str,
        args: Value,
        ctx: &HandlerContext,
        timeout: Option<Duration>,
    ) -> Result<HandlerResult, HandlerError> {
        let value = self
            .execute(Entry::Function(function.to_string(), args), ctx, timeout)
            .await?;
        value_to_result(value)
    }

    /// Evaluate the top-level body with arbitrary bindings, returning the raw value
    pub async fn eval_with(
        &self,
        bindings: Vec<(String, Value)>,
        ctx: &HandlerContext,
        timeout: Option<Duration>,
    ) -> Result<Value, HandlerError> {
        self.execute(Entry::Body(bindings), ctx, timeout).await
    }

    async fn execute(
        &self,
        entry: Entry,
        ctx: &HandlerContext,
        timeout: Option<Duration>,
    ) -> Result<Value, HandlerError> {
        if ctx.is_cancelled() {
            return Err(HandlerError::aborted("Invocation was cancelled before evaluation"));
        }

        let env = Arc::new(PrimitiveEnv {
            ctx: ctx.clone(),
            handle: tokio::runtime::Handle::current(),
            deadline: timeout.map(|t| Instant::now() + t),
            timeout,
            http: self.sandbox.inner.http.clone(),
            max_response_bytes: self.sandbox.inner.max_response_bytes,
        });
        let engine = self.sandbox.runtime_engine(env);
        let ast = self.ast.clone();
        let ctx_binding = to_dynamic(&ctx.describe())?;
        let name = self.name.clone();

        let task = tokio::task::spawn_blocking(move || {
            let mut scope = Scope::new();
            scope.push_constant("ctx", ctx_binding.clone());

            let outcome = match entry {
                Entry::Body(bindings) => {
                    for (key, value) in bindings {
                        scope.push(key, to_dynamic(&value)?);
                    }
                    engine.eval_ast_with_scope::<Dynamic>(&mut scope, &ast)
                }
                Entry::Function(function, args) => {
                    let Some(arity) = ast
                        .iter_functions()
                        .filter(|f| f.name == function)
                        .map(|f| f.params.len())
                        .min()
                    else {
                        return Err(HandlerError::export_not_found(&function, &name));
                    };

                    let mut call_args = vec![to_dynamic(&args)?, ctx_binding];
                    call_args.truncate(arity);

                    let options = CallFnOptions::new().eval_ast(false);
                    engine.call_fn_with_options::<Dynamic>(
                        options, &mut scope, &ast, &function, call_args,
                    )
                }
            };

            let value = outcome.map_err(|e| map_eval_error(*e, timeout))?;
            from_dynamic(&value)
        });

        match task.await {
            Ok(result) => result,
            Err(e) => Err(HandlerError::internal(format!("Script worker failed: {}", e))),
        }
    }
}

impl std::fmt::Debug for Script {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Script")
            .field("name", &self.name)
            .field("functions", &self.functions())
            .finish()
    }
}

/// Convert a script's return value into a handler result
///
/// - string → one text item
/// - object with a `content` array → parsed as a result
/// - null/unit → empty result
/// - anything else → one text item holding its JSON
pub fn value_to_result(value: Value) -> Result<HandlerResult, HandlerError> {
    let structured = matches!(
        &value,
        Value::Object(map) if map.get("content").is_some_and(Value::is_array)
    );
    if structured {
        return serde_json::from_value(value)
            .map_err(|e| HandlerError::execution(format!("Malformed handler result: {}", e)));
    }

    match value {
        Value::Null => Ok(HandlerResult::new()),
        Value::String(text) => Ok(HandlerResult::text(text)),
        other => Ok(HandlerResult::from_content([ContentItem::text(other.to_string())])),
    }
}

fn to_dynamic(value: &Value) -> Result<Dynamic, HandlerError> {
    rhai::serde::to_dynamic(value)
        .map_err(|e| HandlerError::internal(format!("Failed to bind value: {}", e)))
}

fn from_dynamic(value: &Dynamic) -> Result<Value, HandlerError> {
    if value.is_unit() {
        return Ok(Value::Null);
    }
    rhai::serde::from_dynamic(value).map_err(|e| {
        HandlerError::execution(format!(
            "Script returned a {} that cannot be converted: {}",
            value.type_name(),
            e
        ))
    })
}

fn map_eval_error(error: EvalAltResult, timeout: Option<Duration>) -> HandlerError {
    match error {
        EvalAltResult::ErrorInFunctionCall(_, _, inner, _) => map_eval_error(*inner, timeout),
        EvalAltResult::ErrorTerminated(token, _) => {
            if token.clone().into_string().is_ok_and(|t| t == TERMINATE_ABORT) {
                HandlerError::aborted("Script evaluation was aborted")
            } else {
                HandlerError::timeout(timeout.unwrap_or_default())
            }
        }
        EvalAltResult::ErrorRuntime(value, pos) => match value.clone().try_cast::<PrimitiveFailure>() {
            Some(PrimitiveFailure(error)) => error,
            None => HandlerError::execution(format!("Script error: {}", value))
                .with_stack(pos.to_string()),
        },
        EvalAltResult::ErrorTooManyOperations(pos) => {
            HandlerError::execution("Script exceeded its operation limit").with_stack(pos.to_string())
        }
        other => {
            let position = other.position();
            HandlerError::execution(format!("Script error: {}", other)).with_stack(position.to_string())
        }
    }
}
