//! handlerkit CLI - resolve and run handler descriptions

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use figment::Figment;
use figment::providers::{Format, Json, Toml, Yaml};
use handlerkit_core::prelude::*;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "handlerkit")]
#[command(about = "Resolve and invoke declarative handlers", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Invoke a handler once and print its result as JSON
    Invoke(InvokeArgs),
    /// Parse and resolve a handler without invoking it
    Check(CheckArgs),
    /// Version information
    Version,
}

#[derive(Args)]
struct InvokeArgs {
    /// Handler description (JSON, TOML or YAML)
    #[arg(long)]
    handler: PathBuf,

    /// Call arguments as JSON
    #[arg(long, default_value = "{}")]
    args: String,

    /// Session identifier passed to the handler
    #[arg(long, default_value = "cli")]
    session: String,

    /// Timeout per attempt (e.g. `500ms`, `10s`)
    #[arg(long, value_parser = humantime::parse_duration)]
    timeout: Option<Duration>,

    /// Total attempts for retryable failures (HTTP handlers use their own `retries`)
    #[arg(long)]
    attempts: Option<u32>,

    /// Print execution provenance alongside the result
    #[arg(long)]
    trace: bool,

    #[command(flatten)]
    permissions: PermissionArgs,

    #[command(flatten)]
    framework: FrameworkArgs,
}

#[derive(Args)]
struct CheckArgs {
    /// Handler description (JSON, TOML or YAML)
    #[arg(long)]
    handler: PathBuf,

    #[command(flatten)]
    permissions: PermissionArgs,

    #[command(flatten)]
    framework: FrameworkArgs,
}

#[derive(Args)]
struct PermissionArgs {
    /// Deny all network access
    #[arg(long)]
    deny_network: bool,

    /// Deny all filesystem access
    #[arg(long)]
    deny_fs: bool,

    /// Restrict filesystem access to these paths
    #[arg(long = "allow-path")]
    allow_paths: Vec<PathBuf>,

    /// Restrict network access to these domains (`*.example.com` allowed)
    #[arg(long = "allow-domain")]
    allow_domains: Vec<String>,
}

impl PermissionArgs {
    fn permissions(&self) -> Permissions {
        let mut permissions = Permissions::unrestricted();
        if self.deny_network {
            permissions = permissions.with_network(false);
        }
        if self.deny_fs {
            permissions = permissions.with_file_system(false);
        }
        for path in &self.allow_paths {
            permissions = permissions.allow_path(path);
        }
        for domain in &self.allow_domains {
            permissions = permissions.allow_domain(domain);
        }
        permissions
    }
}

#[derive(Args)]
struct FrameworkArgs {
    /// Framework configuration file (defaults to the usual search path)
    #[arg(long, env = "HANDLERKIT_CONFIG_PATH")]
    config: Option<PathBuf>,

    /// Base directory for relative file handler paths
    #[arg(long)]
    base_dir: Option<PathBuf>,
}

impl FrameworkArgs {
    fn load(&self) -> Result<FrameworkConfig> {
        let mut config = match &self.config {
            Some(path) => FrameworkConfig::from_file(path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?,
            None => FrameworkConfig::load().context("Failed to load configuration")?,
        };
        if let Some(base_dir) = &self.base_dir {
            config.file.base_dir = base_dir.clone();
        }
        Ok(config)
    }
}

fn load_handler(path: &Path) -> Result<HandlerConfig> {
    if !path.exists() {
        bail!("Handler description not found: {}", path.display());
    }

    let figment = match path.extension().and_then(|ext| ext.to_str()) {
        Some("toml") => Figment::new().merge(Toml::file(path)),
        Some("yaml") | Some("yml") => Figment::new().merge(Yaml::file(path)),
        _ => Figment::new().merge(Json::file(path)),
    };
    let raw: Value = figment
        .extract()
        .with_context(|| format!("Failed to read handler description {}", path.display()))?;

    Ok(HandlerConfig::from_value(raw)?)
}

fn build_engine(config: &FrameworkConfig) -> Result<ExecutionEngine> {
    let registry = Arc::new(HandlerRegistry::new());
    let dispatcher = Dispatcher::new(config, registry)?;
    Ok(ExecutionEngine::new(Arc::new(dispatcher), config.engine.clone()))
}

async fn invoke(args: InvokeArgs) -> Result<()> {
    let config = args.framework.load()?;
    let handler = load_handler(&args.handler)?;
    let call_args: Value =
        serde_json::from_str(&args.args).context("--args must be valid JSON")?;
    let engine = build_engine(&config)?;

    let ctx = HandlerContext::new(args.session.clone())
        .with_permissions(args.permissions.permissions())
        .with_metadata("source", Value::String(args.handler.display().to_string()));

    let mut options = HandlerExecutionOptions::new();
    if let Some(timeout) = args.timeout {
        options = options.with_timeout(timeout);
    }
    if let Some(attempts) = args.attempts {
        options = options.with_retry(config.engine.retry.clone().with_max_attempts(attempts));
    }

    let interrupt = ctx.cancellation.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, aborting invocation");
            interrupt.cancel();
        }
    });

    let report = engine
        .execute_traced(&handler, call_args, &ctx, &options)
        .await;
    let unresolved = report.is_resolution_failure();

    match report.outcome {
        Ok(result) => {
            let output = if args.trace {
                serde_json::json!({ "result": result, "provenance": report.provenance })
            } else {
                serde_json::to_value(&result)?
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(())
        }
        Err(error) => {
            let output = if args.trace {
                serde_json::json!({ "error": error, "provenance": report.provenance })
            } else {
                serde_json::json!({ "error": error })
            };
            eprintln!("{}", serde_json::to_string_pretty(&output)?);
            let stage = if unresolved {
                "could not be resolved"
            } else {
                "failed"
            };
            bail!("{} handler {}: {}", report.provenance.handler_kind, stage, error)
        }
    }
}

async fn check(args: CheckArgs) -> Result<()> {
    let config = args.framework.load()?;
    let handler = load_handler(&args.handler)?;
    let engine = build_engine(&config)?;

    engine
        .dispatcher()
        .resolve(&handler, &args.permissions.permissions())
        .await?;

    let summary = serde_json::json!({
        "type": handler.kind(),
        "fingerprint": handler.fingerprint(),
        "timeout": humantime::format_duration(engine.effective_timeout(
            &handler,
            &HandlerExecutionOptions::new(),
        ))
        .to_string(),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Invoke(args) => invoke(args).await?,
        Commands::Check(args) => check(args).await?,
        Commands::Version => {
            println!("handlerkit {}", env!("CARGO_PKG_VERSION"));
            println!("handlerkit-core {}", handlerkit_core::VERSION);
        }
    }

    Ok(())
}
