//! Configuration types for the handlerkit framework

use crate::engine::RetryPolicy;
use crate::error::{HandlerKitError, Result};
use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the configuration file looked up in the config and working directories
pub const CONFIG_FILE_NAME: &str = "handlerkit.toml";

/// Environment variable naming an explicit configuration file
pub const CONFIG_PATH_ENV: &str = "HANDLERKIT_CONFIG_PATH";

/// Prefix for environment overrides (`HANDLERKIT_ENGINE__DEFAULT_TIMEOUT=2s`)
pub const ENV_PREFIX: &str = "HANDLERKIT_";

/// Main configuration for the framework
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct FrameworkConfig {
    /// Execution engine configuration
    pub engine: EngineConfig,

    /// Script sandbox limits
    pub sandbox: SandboxConfig,

    /// File backend configuration
    pub file: FileBackendConfig,

    /// HTTP backend configuration
    pub http: HttpBackendConfig,
}

/// Execution engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Timeout applied when neither the caller nor the handler sets one
    #[serde(with = "humantime_serde")]
    pub default_timeout: Duration,

    /// Retry policy applied when the caller does not pass one
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

/// Script sandbox limits
///
/// A limit of zero disables that limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Maximum operations per evaluation
    pub max_operations: u64,

    /// Maximum function call depth
    pub max_call_levels: usize,

    /// Maximum string length in bytes
    pub max_string_size: usize,

    /// Maximum array length
    pub max_array_size: usize,

    /// Maximum object map size
    pub max_map_size: usize,

    /// Maximum expression nesting depth
    pub max_expr_depth: usize,

    /// Maximum expression nesting depth inside functions
    pub max_function_expr_depth: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            max_operations: 10_000_000,
            max_call_levels: 64,
            max_string_size: 4 * 1024 * 1024,
            max_array_size: 100_000,
            max_map_size: 100_000,
            max_expr_depth: 64,
            max_function_expr_depth: 32,
        }
    }
}

/// File backend configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileBackendConfig {
    /// Directory relative module paths are resolved against
    pub base_dir: PathBuf,
}

impl Default for FileBackendConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("."),
        }
    }
}

/// HTTP backend configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpBackendConfig {
    /// User-Agent header sent with every request
    pub user_agent: String,

    /// Largest response body accepted
    pub max_response_bytes: usize,

    /// TCP connect timeout
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
}

impl Default for HttpBackendConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("handlerkit/{}", crate::VERSION),
            max_response_bytes: 10 * 1024 * 1024,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl FrameworkConfig {
    /// Start a programmatic configuration
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    /// Load configuration from files and environment variables.
    ///
    /// Loads in this order, later sources overriding earlier ones:
    /// 1. Defaults
    /// 2. `handlerkit/handlerkit.toml` in the user config directory
    /// 3. `handlerkit.toml` in the working directory
    /// 4. The file named by `HANDLERKIT_CONFIG_PATH`
    /// 5. `HANDLERKIT_` environment variables (`__` separates sections)
    ///
    /// # Errors
    ///
    /// Returns an error if a configuration source is invalid.
    pub fn load() -> Result<Self> {
        let config: FrameworkConfig = Self::figment().extract().map_err(|e| {
            HandlerKitError::Configuration(format!("Failed to load configuration: {}", e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// The layered provider chain used by [`FrameworkConfig::load`]
    pub fn figment() -> Figment {
        let mut figment = Figment::from(Serialized::defaults(FrameworkConfig::default()));

        if let Some(dir) = dirs::config_dir() {
            figment = figment.merge(Toml::file(dir.join("handlerkit").join(CONFIG_FILE_NAME)));
        }

        figment = figment.merge(Toml::file(CONFIG_FILE_NAME));

        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            figment = merge_file(figment, Path::new(&path));
        }

        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Load configuration from a specific file.
    ///
    /// TOML, YAML and JSON are recognized by extension; anything else is
    /// read as TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(HandlerKitError::Configuration(format!(
                "Configuration file '{}' does not exist",
                path.display()
            )));
        }

        let figment = Figment::from(Serialized::defaults(FrameworkConfig::default()));
        let config: FrameworkConfig = merge_file(figment, path).extract().map_err(|e| {
            HandlerKitError::Configuration(format!("Failed to load configuration file: {}", e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any value is out of range.
    pub fn validate(&self) -> Result<()> {
        if self.engine.default_timeout.is_zero() {
            return Err(HandlerKitError::Configuration(
                "engine.default_timeout must be greater than zero".to_string(),
            ));
        }
        if self.engine.retry.max_attempts == 0 {
            return Err(HandlerKitError::Configuration(
                "engine.retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.engine.retry.max_delay < self.engine.retry.initial_delay {
            return Err(HandlerKitError::Configuration(
                "engine.retry.max_delay must not be below initial_delay".to_string(),
            ));
        }
        if let crate::engine::Backoff::Exponential { multiplier } = self.engine.retry.backoff
            && multiplier < 1.0
        {
            return Err(HandlerKitError::Configuration(
                "engine.retry.backoff.multiplier must be at least 1.0".to_string(),
            ));
        }
        if self.http.max_response_bytes == 0 {
            return Err(HandlerKitError::Configuration(
                "http.max_response_bytes must be greater than zero".to_string(),
            ));
        }
        if self.http.user_agent.trim().is_empty() {
            return Err(HandlerKitError::Configuration(
                "http.user_agent must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

fn merge_file(figment: Figment, path: &Path) -> Figment {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml") | Some("yml") => figment.merge(Yaml::file(path)),
        Some("json") => figment.merge(Json::file(path)),
        _ => figment.merge(Toml::file(path)),
    }
}

/// Builder for programmatic configuration
#[derive(Debug, Clone, Default)]
pub struct ConfigBuilder {
    config: FrameworkConfig,
}

impl ConfigBuilder {
    /// Start from defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the engine's fallback timeout
    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.config.engine.default_timeout = timeout;
        self
    }

    /// Set the engine's retry policy
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.config.engine.retry = policy;
        self
    }

    /// Set the engine's attempt budget
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.engine.retry.max_attempts = attempts;
        self
    }

    /// Replace the sandbox limits
    pub fn sandbox(mut self, sandbox: SandboxConfig) -> Self {
        self.config.sandbox = sandbox;
        self
    }

    /// Set the sandbox operation limit
    pub fn max_operations(mut self, max_operations: u64) -> Self {
        self.config.sandbox.max_operations = max_operations;
        self
    }

    /// Set the file backend base directory
    pub fn base_dir(mut self, base_dir: impl Into<PathBuf>) -> Self {
        self.config.file.base_dir = base_dir.into();
        self
    }

    /// Set the HTTP User-Agent
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.http.user_agent = user_agent.into();
        self
    }

    /// Set the HTTP response size limit
    pub fn max_response_bytes(mut self, max_response_bytes: usize) -> Self {
        self.config.http.max_response_bytes = max_response_bytes;
        self
    }

    /// Validate and build
    ///
    /// # Errors
    ///
    /// Returns an error if the assembled configuration is invalid.
    pub fn build(self) -> Result<FrameworkConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
