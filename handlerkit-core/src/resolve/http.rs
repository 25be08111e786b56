//! HTTP backend
//!
//! Each invocation:
//! 1. Checks the URL host against the context's permissions
//! 2. Builds the body (`requestTransform`, else the call arguments)
//! 3. Sends the request, retrying network failures, timeouts and non-2xx
//!    responses up to `retries` times
//! 4. Shapes the response as `{status, headers, body}` and passes it through
//!    `responseTransform`, else converts the body directly

use super::Resolver;
use crate::config::HttpBackendConfig;
use crate::engine::{RetryPolicy, with_retry};
use crate::handler::{
    Handler, HandlerConfig, HandlerContext, HandlerError, HandlerErrorKind, HandlerKind,
    HandlerResult, HttpConfig, HttpMethod, Permissions, ToolHandler, check_network_access,
};
use crate::sandbox::{Script, ScriptSandbox, value_to_result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::redirect::Policy;
use reqwest::{StatusCode, Url};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;

/// Resolves `http` configurations
pub struct HttpResolver {
    client: reqwest::Client,
    sandbox: ScriptSandbox,
    retry: RetryPolicy,
    max_response_bytes: usize,
}

impl HttpResolver {
    /// Create a resolver; `retry` supplies the backoff curve, `retries` in each
    /// configuration supplies the attempt budget
    pub fn new(
        client: reqwest::Client,
        sandbox: ScriptSandbox,
        retry: RetryPolicy,
        config: &HttpBackendConfig,
    ) -> Self {
        Self {
            client,
            sandbox,
            retry,
            max_response_bytes: config.max_response_bytes,
        }
    }

    /// Build the shared client from backend configuration
    ///
    /// Redirects are not followed: the guard only ever sees the configured
    /// host, so a 3xx surfaces as a non-2xx response.
    pub fn build_client(config: &HttpBackendConfig) -> Result<reqwest::Client, HandlerError> {
        reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(config.connect_timeout)
            .redirect(Policy::none())
            .build()
            .map_err(|e| HandlerError::internal(format!("Failed to build HTTP client: {}", e)))
    }

    fn compile_transform(
        &self,
        name: &str,
        source: Option<&str>,
    ) -> Result<Option<Script>, HandlerError> {
        source
            .map(|code| self.sandbox.compile_named(name, code))
            .transpose()
    }

    /// Resolve an HTTP configuration into a handler
    pub fn resolve_http(&self, config: &HttpConfig) -> Result<ToolHandler, HandlerError> {
        let url = parse_url(&config.url)?;
        let host = url.host_str().unwrap_or_default().to_string();

        let handler = HttpHandler {
            method: config.method,
            headers: header_map(config)?,
            timeout: config.timeout_duration(),
            retry: self.retry.clone().with_max_attempts(config.retries.saturating_add(1)),
            request_transform: self
                .compile_transform("requestTransform", config.request_transform.as_deref())?,
            response_transform: self
                .compile_transform("responseTransform", config.response_transform.as_deref())?,
            client: self.client.clone(),
            max_response_bytes: self.max_response_bytes,
            url,
            host,
        };

        tracing::debug!(
            url = %handler.url,
            method = config.method.as_str(),
            retries = config.retries,
            "Resolved HTTP handler"
        );
        Ok(Arc::new(handler))
    }
}

#[async_trait]
impl Resolver for HttpResolver {
    fn kind(&self) -> HandlerKind {
        HandlerKind::Http
    }

    fn authorize(
        &self,
        config: &HandlerConfig,
        permissions: &Permissions,
    ) -> Result<(), HandlerError> {
        let HandlerConfig::Http(http) = config else {
            return Ok(());
        };
        let url = parse_url(&http.url)?;
        check_network_access(url.host_str().unwrap_or_default(), permissions).into_result()
    }

    async fn resolve(&self, config: &HandlerConfig) -> Result<ToolHandler, HandlerError> {
        match config {
            HandlerConfig::Http(http) => self.resolve_http(http),
            other => Err(super::mismatched(self.kind(), other)),
        }
    }
}

struct HttpHandler {
    url: Url,
    host: String,
    method: HttpMethod,
    headers: HeaderMap,
    timeout: Duration,
    retry: RetryPolicy,
    request_transform: Option<Script>,
    response_transform: Option<Script>,
    client: reqwest::Client,
    max_response_bytes: usize,
}

impl HttpHandler {
    async fn send_once(&self, attempt: u32, body: &Value) -> Result<Value, HandlerError> {
        let method = match self.method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Delete => reqwest::Method::DELETE,
        };

        let request = self
            .client
            .request(method, self.url.clone())
            .headers(self.headers.clone());
        let request = if self.method.sends_body() {
            request.json(body)
        } else {
            request.query(&query_pairs(body))
        };

        let limit = self.max_response_bytes;
        let exchange = async move {
            let response = request.send().await.map_err(|e| {
                HandlerError::network(format!("Request to {} failed: {}", self.url, e))
            })?;

            let status = response.status();
            let headers = response.headers().clone();
            let bytes = read_body_limited(response, limit).await?;

            if !status.is_success() {
                return Err(HandlerError::network(format!(
                    "{} {} returned {}",
                    self.method.as_str(),
                    self.url,
                    status
                ))
                .with_details(serde_json::json!({ "status": status.as_u16() })));
            }

            Ok(response_value(status, &headers, &bytes))
        };

        let outcome = match tokio::time::timeout(self.timeout, exchange).await {
            Ok(outcome) => outcome,
            Err(_) => Err(HandlerError::timeout(self.timeout)),
        };

        if let Err(ref error) = outcome {
            tracing::warn!(url = %self.url, attempt, error = %error, "HTTP attempt failed");
        }
        outcome
    }

    async fn transform(
        &self,
        script: &Script,
        binding: &str,
        value: Value,
        ctx: &HandlerContext,
    ) -> Result<Value, HandlerError> {
        script
            .eval_with(vec![(binding.to_string(), value)], ctx, Some(self.timeout))
            .await
            .map_err(|error| match error.kind {
                HandlerErrorKind::Aborted | HandlerErrorKind::PermissionDenied => error,
                _ => HandlerError::transform(format!("{} failed: {}", script.name(), error.message))
                    .with_details(serde_json::json!({ "cause": error.code })),
            })
    }
}

#[async_trait]
impl Handler for HttpHandler {
    async fn call(&self, args: Value, ctx: &HandlerContext) -> Result<HandlerResult, HandlerError> {
        check_network_access(&self.host, &ctx.permissions).into_result()?;

        let body = match &self.request_transform {
            Some(script) => self.transform(script, "args", args, ctx).await?,
            None => args,
        };

        let this = self;
        let body = &body;
        let outcome = with_retry(&self.retry, move |attempt| this.send_once(attempt, body)).await;
        let attempts = outcome.attempts;
        let response = outcome
            .result
            .map_err(|error| annotate(error, &self.url, attempts))?;

        ctx.logger.debug(&format!(
            "HTTP {} {} succeeded after {} attempt(s)",
            self.method.as_str(),
            self.url,
            outcome.attempts
        ));

        match &self.response_transform {
            Some(script) => {
                let value = self.transform(script, "response", response, ctx).await?;
                value_to_result(value)
            }
            None => value_to_result(response.get("body").cloned().unwrap_or(Value::Null)),
        }
    }
}

fn annotate(mut error: HandlerError, url: &Url, attempts: u32) -> HandlerError {
    let mut details = match error.details.take() {
        Some(Value::Object(map)) => map,
        Some(other) => Map::from_iter([("cause".to_string(), other)]),
        None => Map::new(),
    };
    details.insert("url".to_string(), Value::String(url.to_string()));
    details.insert("attempts".to_string(), Value::from(attempts));
    error.details = Some(Value::Object(details));
    error
}

fn header_map(config: &HttpConfig) -> Result<HeaderMap, HandlerError> {
    let mut headers = HeaderMap::new();
    for (name, value) in &config.headers {
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
            HandlerError::invalid_config(format!("Invalid header name '{}': {}", name, e))
        })?;
        let value = HeaderValue::from_str(value).map_err(|e| {
            HandlerError::invalid_config(format!("Invalid value for header '{}': {}", name, e))
        })?;
        headers.insert(name, value);
    }
    Ok(headers)
}

fn parse_url(raw: &str) -> Result<Url, HandlerError> {
    let url = Url::parse(raw)
        .map_err(|e| HandlerError::invalid_config(format!("Invalid URL '{}': {}", raw, e)))?;
    match url.scheme() {
        "http" | "https" if url.host_str().is_some() => Ok(url),
        _ => Err(HandlerError::invalid_config(format!(
            "URL '{}' must be http(s) with a host",
            raw
        ))),
    }
}

fn query_pairs(body: &Value) -> Vec<(String, String)> {
    match body {
        Value::Object(map) => map
            .iter()
            .filter(|(_, value)| !value.is_null())
            .map(|(key, value)| {
                let value = match value {
                    Value::String(text) => text.clone(),
                    other => other.to_string(),
                };
                (key.clone(), value)
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// Read a response body, failing once it exceeds `limit` bytes
pub(crate) async fn read_body_limited(
    mut response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, HandlerError> {
    if let Some(expected) = response.content_length()
        && expected > limit as u64
    {
        return Err(HandlerError::network(format!(
            "Response of {} bytes exceeds the {} byte limit",
            expected, limit
        )));
    }

    let mut body = Vec::new();
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| HandlerError::network(format!("Failed to read response: {}", e)))?
    {
        if body.len() + chunk.len() > limit {
            return Err(HandlerError::network(format!(
                "Response exceeds the {} byte limit",
                limit
            )));
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}

/// Shape a response as `{status, headers, body}`
///
/// The body is JSON when it parses, otherwise text; an empty body is null.
pub(crate) fn response_value(status: StatusCode, headers: &HeaderMap, body: &[u8]) -> Value {
    let mut header_map = Map::new();
    for (name, value) in headers {
        let Ok(value) = value.to_str() else {
            continue;
        };
        match header_map.get_mut(name.as_str()) {
            Some(Value::String(existing)) => {
                existing.push_str(", ");
                existing.push_str(value);
            }
            _ => {
                header_map.insert(name.as_str().to_string(), Value::String(value.to_string()));
            }
        }
    }

    let body = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(body)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(body).into_owned()))
    };

    serde_json::json!({
        "status": status.as_u16(),
        "headers": Value::Object(header_map),
        "body": body,
    })
}
