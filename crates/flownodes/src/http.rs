use crate::interpolate::{interpolate, interpolate_value};
use async_trait::async_trait;
use flowcore::{
    ConfigExt, NodeContext, NodeError, NodeExecutor, NodeMetadata, NodeOutput, Value, ValueMap,
};
use reqwest::{header::CONTENT_TYPE, Method};
use std::time::Duration;
use tracing::debug;

const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// HTTP request node
///
/// Config: `method` (default GET), `url`, `headers`, `body`, `timeout` (ms),
/// `auth: {type: bearer|basic|apiKey, ...}`, `failOnError`. Strings are
/// interpolated against the node inputs.
pub struct HttpRequestNode {
    client: reqwest::Client,
}

impl HttpRequestNode {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn apply_auth(
        &self,
        ctx: &NodeContext,
        mut request: reqwest::RequestBuilder,
    ) -> Result<reqwest::RequestBuilder, NodeError> {
        let Some(auth) = ctx.config.get_object("auth") else {
            return Ok(request);
        };
        let field = |key: &str| interpolate(&auth.get_string(key), &ctx.inputs, &ctx.run);

        match auth.get_string("type").to_ascii_lowercase().as_str() {
            "" | "none" => {}
            "bearer" => request = request.bearer_auth(field("token")),
            "basic" => request = request.basic_auth(field("username"), Some(field("password"))),
            "apikey" | "api_key" => {
                let header = auth.get_string_or("headerName", "X-API-Key");
                let key = match auth.get_str("key") {
                    Some(_) => field("key"),
                    None => field("value"),
                };
                request = request.header(header, key);
            }
            other => {
                return Err(NodeError::Configuration(format!(
                    "Unsupported auth type: {}",
                    other
                )))
            }
        }
        Ok(request)
    }
}

impl Default for HttpRequestNode {
    fn default() -> Self {
        Self::new()
    }
}

fn classify(error: reqwest::Error, timeout_ms: u64) -> NodeError {
    if error.is_timeout() {
        return NodeError::Timeout { millis: timeout_ms };
    }
    NodeError::Network {
        retryable: error.is_connect() || error.is_request() || error.is_body(),
        message: format!("HTTP request failed: {}", error),
    }
}

#[async_trait]
impl NodeExecutor for HttpRequestNode {
    fn node_type(&self) -> &str {
        "http"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let raw_url = match ctx.config.get_str("url").filter(|u| !u.is_empty()) {
            Some(url) => url.to_string(),
            None => ctx
                .require_input("url")?
                .as_str()
                .ok_or_else(|| NodeError::InvalidInputType {
                    field: "url".to_string(),
                    expected: "string".to_string(),
                    actual: "other".to_string(),
                })?
                .to_string(),
        };
        let url = interpolate(&raw_url, &ctx.inputs, &ctx.run);
        let method = ctx
            .config
            .get_string_or("method", "GET")
            .to_uppercase()
            .parse::<Method>()
            .map_err(|e| NodeError::Configuration(format!("Invalid method: {}", e)))?;
        let timeout_ms = match ctx.config.get_i64_or("timeout", 0) {
            ms if ms > 0 => ms as u64,
            _ => DEFAULT_TIMEOUT_MS,
        };

        ctx.events.info(format!("{} {}", method, url));

        let mut request = self
            .client
            .request(method.clone(), &url)
            .timeout(Duration::from_millis(timeout_ms));

        let mut has_content_type = false;
        if let Some(headers) = ctx.config.get_object("headers") {
            for (key, value) in headers {
                let value = interpolate(&value.to_display_string(), &ctx.inputs, &ctx.run);
                has_content_type |= key.eq_ignore_ascii_case("content-type");
                request = request.header(key.as_str(), value);
            }
        }
        request = self.apply_auth(&ctx, request)?;

        if method != Method::GET && method != Method::HEAD {
            match ctx.config.get("body").or_else(|| ctx.inputs.get("body")) {
                Some(Value::String(text)) => {
                    let text = interpolate(text, &ctx.inputs, &ctx.run);
                    if !has_content_type && serde_json::from_str::<serde_json::Value>(&text).is_ok() {
                        request = request.header(CONTENT_TYPE, "application/json");
                    }
                    request = request.body(text);
                }
                Some(Value::Null) | None => {}
                Some(body) => {
                    request = request.json(&interpolate_value(body, &ctx.inputs, &ctx.run).to_json());
                }
            }
        }

        ctx.ensure_not_cancelled()?;
        let response = tokio::select! {
            _ = ctx.cancellation.cancelled() => return Err(NodeError::Cancelled),
            sent = request.send() => sent.map_err(|e| classify(e, timeout_ms))?,
        };

        let status = response.status();
        let mut headers = ValueMap::new();
        for (name, value) in response.headers() {
            headers.insert(
                name.to_string(),
                Value::from(value.to_str().unwrap_or_default()),
            );
        }
        let body = response.text().await.map_err(|e| classify(e, timeout_ms))?;
        debug!(node_id = %ctx.node.id, status = status.as_u16(), bytes = body.len(), "HTTP response");
        ctx.events.info(format!("Response status: {}", status.as_u16()));

        if !status.is_success() && ctx.config.get_bool("failOnError") {
            return Err(NodeError::Network {
                message: format!("HTTP {} from {}", status.as_u16(), url),
                retryable: status.is_server_error() || status.as_u16() == 429,
            });
        }

        let data = serde_json::from_str::<serde_json::Value>(&body)
            .map(Value::from)
            .unwrap_or_else(|_| Value::String(body.clone()));

        Ok(NodeOutput::new()
            .with_output("status", status.as_u16() as i64)
            .with_output("statusText", status.canonical_reason().unwrap_or_default())
            .with_output("ok", status.is_success())
            .with_output("headers", headers)
            .with_output("data", data)
            .with_output("body", body))
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::new("http", "Make HTTP requests")
            .input("url", "Request URL when not configured", false)
            .output("status", "Response status code")
            .output("data", "Parsed JSON body, or the raw text")
            .output("body", "Raw response body")
    }
}
