//! Gateway for OpenRouter and other OpenAI-compatible chat APIs.
//!
//! Endpoint: `{base_url}/chat/completions` (always chat mode). Usage is read
//! from the `usage` object; HTTP failures are classified through
//! [`GatewayError::from_status`].

use super::{GatewayError, GatewayRequest, GatewayResponse, ModelGateway, Role, TokenUsage};
use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";
const API_KEY_VAR: &str = "OPENROUTER_API_KEY";
const BASE_URL_VAR: &str = "OPENROUTER_BASE_URL";

/// # Example
///
/// ```
/// use resonance_pipeline::gateway::OpenRouterGateway;
///
/// let gateway = OpenRouterGateway::new("sk-or-...")
///     .with_app("https://example.com", "Market Research");
/// ```
#[derive(Clone)]
pub struct OpenRouterGateway {
    client: Client,
    base_url: String,
    api_key: String,
    /// Sent as `HTTP-Referer` for OpenRouter attribution.
    referer: Option<String>,
    /// Sent as `X-Title`.
    title: Option<String>,
}

impl std::fmt::Debug for OpenRouterGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let key = match self.api_key.char_indices().nth(6) {
            Some((idx, _)) => format!("{}***", &self.api_key[..idx]),
            None => "***".to_string(),
        };
        f.debug_struct("OpenRouterGateway")
            .field("base_url", &self.base_url)
            .field("api_key", &key)
            .field("referer", &self.referer)
            .field("title", &self.title)
            .finish()
    }
}

impl OpenRouterGateway {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: api_key.into(),
            referer: None,
            title: None,
        }
    }

    /// Build from `OPENROUTER_API_KEY` and optional `OPENROUTER_BASE_URL`.
    pub fn from_env() -> Result<Self> {
        let key = std::env::var(API_KEY_VAR)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| PipelineError::InvalidConfig(format!("{} is not set", API_KEY_VAR)))?;
        let mut gateway = Self::new(key);
        if let Ok(url) = std::env::var(BASE_URL_VAR) {
            gateway = gateway.with_base_url(url);
        }
        Ok(gateway)
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    /// Set the attribution headers OpenRouter shows in its dashboard.
    pub fn with_app(mut self, referer: impl Into<String>, title: impl Into<String>) -> Self {
        self.referer = Some(referer.into());
        self.title = Some(title.into());
        self
    }

    fn build_messages(request: &GatewayRequest) -> Vec<Value> {
        let mut messages = Vec::new();
        if let Some(sys) = request.system_prompt.as_deref().filter(|s| !s.is_empty()) {
            messages.push(json!({"role": "system", "content": sys}));
        }
        for msg in request.conversation() {
            let role = match msg.role {
                Role::System => "system",
                Role::User => "user",
                Role::Assistant => "assistant",
            };
            messages.push(json!({"role": role, "content": msg.content}));
        }
        messages
    }

    fn build_body(request: &GatewayRequest) -> Value {
        let mut body = json!({
            "model": request.model,
            "messages": Self::build_messages(request),
            "temperature": request.params.temperature,
            "max_tokens": request.params.max_tokens,
        });
        if request.params.json_mode {
            body["response_format"] = json!({"type": "json_object"});
        }
        body
    }

    fn build_http_request(&self, body: &Value) -> reqwest::RequestBuilder {
        let url = format!("{}/chat/completions", self.base_url);
        let mut req = self
            .client
            .post(url)
            .bearer_auth(&self.api_key)
            .json(body);
        if let Some(ref referer) = self.referer {
            req = req.header("HTTP-Referer", referer.as_str());
        }
        if let Some(ref title) = self.title {
            req = req.header("X-Title", title.as_str());
        }
        req
    }

    fn parse_retry_after(value: &str) -> Option<Duration> {
        value.trim().parse::<u64>().ok().map(Duration::from_secs)
    }

    fn extract_usage(json_resp: &Value) -> Option<TokenUsage> {
        let usage = json_resp.get("usage")?;
        let field = |name: &str| usage.get(name).and_then(Value::as_u64).unwrap_or(0);
        Some(TokenUsage::new(
            field("prompt_tokens"),
            field("completion_tokens"),
        ))
    }

    /// Turn a 200 response body into text plus usage. Providers sometimes
    /// return an error object with a success status.
    fn parse_completion(json_resp: &Value) -> std::result::Result<GatewayResponse, GatewayError> {
        let usage = Self::extract_usage(json_resp);
        let bill = |err: GatewayError| match usage {
            Some(u) => err.billed(u),
            None => err,
        };

        if let Some(err) = json_resp.get("error") {
            let code = err
                .get("code")
                .and_then(Value::as_u64)
                .and_then(|c| u16::try_from(c).ok())
                .unwrap_or(500);
            let message = err
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("provider error");
            return Err(bill(GatewayError::from_status(code, message, None)));
        }

        let text = json_resp
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(Value::as_str)
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| {
                bill(GatewayError::MalformedResponse(
                    "response has no message content".to_string(),
                ))
            })?;

        Ok(GatewayResponse {
            text: text.to_string(),
            usage: usage.unwrap_or_default(),
        })
    }
}

#[async_trait]
impl ModelGateway for OpenRouterGateway {
    async fn invoke(&self, request: &GatewayRequest) -> std::result::Result<GatewayResponse, GatewayError> {
        let body = Self::build_body(request);
        let resp = self.build_http_request(&body).send().await.map_err(|e| {
            if e.is_timeout() {
                GatewayError::timeout(e.to_string())
            } else {
                GatewayError::Connection(e.to_string())
            }
        })?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(Self::parse_retry_after);
            let text = resp.text().await.unwrap_or_default();
            return Err(GatewayError::from_status(status, &text, retry_after));
        }

        let json_resp: Value = resp
            .json()
            .await
            .map_err(|e| GatewayError::MalformedResponse(e.to_string()))?;
        Self::parse_completion(&json_resp)
    }

    fn name(&self) -> &'static str {
        "openrouter"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{CallOrigin, ChatMessage, ModelParams};
    use crate::stage::StageId;

    fn test_request() -> GatewayRequest {
        GatewayRequest {
            model: "anthropic/claude-sonnet-4.5".into(),
            system_prompt: None,
            prompt: "Describe Acme.".into(),
            messages: Vec::new(),
            params: ModelParams::default(),
            origin: CallOrigin {
                stage: StageId::Ingestion,
                entity: None,
                attempt: 1,
            },
        }
    }

    #[test]
    fn test_body_with_system_and_json_mode() {
        let mut request = test_request();
        request.system_prompt = Some("You are a market analyst.".into());
        let body = OpenRouterGateway::build_body(&request);

        assert_eq!(body["model"], "anthropic/claude-sonnet-4.5");
        assert_eq!(body["max_tokens"], 4096);
        assert_eq!(body["response_format"]["type"], "json_object");
        let messages = body["messages"].as_array().expect("messages");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[1]["content"], "Describe Acme.");
    }

    #[test]
    fn test_body_with_repair_history() {
        let mut request = test_request();
        request.params.json_mode = false;
        request.messages = vec![
            ChatMessage::user("Describe Acme."),
            ChatMessage::assistant("Acme is great"),
            ChatMessage::user("Your previous response was invalid"),
        ];
        let body = OpenRouterGateway::build_body(&request);
        let messages = body["messages"].as_array().expect("messages");
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1]["role"], "assistant");
        assert!(body.get("response_format").is_none());
    }

    #[test]
    fn test_headers() {
        let gateway = OpenRouterGateway::new("sk-or-test")
            .with_base_url("https://proxy.local/api/v1/")
            .with_app("https://example.com", "Research");
        let req = gateway
            .build_http_request(&json!({}))
            .build()
            .expect("build request");
        assert_eq!(req.url().as_str(), "https://proxy.local/api/v1/chat/completions");
        assert_eq!(req.headers()["Authorization"], "Bearer sk-or-test");
        assert_eq!(req.headers()["HTTP-Referer"], "https://example.com");
        assert_eq!(req.headers()["X-Title"], "Research");
    }

    #[test]
    fn test_parse_completion_reads_usage() {
        let resp = json!({
            "choices": [{"message": {"content": "{\"a\": 1}"}}],
            "usage": {"prompt_tokens": 1200, "completion_tokens": 350}
        });
        let parsed = OpenRouterGateway::parse_completion(&resp).unwrap();
        assert_eq!(parsed.text, "{\"a\": 1}");
        assert_eq!(parsed.usage, TokenUsage::new(1200, 350));
    }

    #[test]
    fn test_out_of_range_error_code_is_not_truncated() {
        // 65937 would wrap to 401 if narrowed to u16.
        let resp = json!({"error": {"code": 65937, "message": "upstream exploded"}});
        let err = OpenRouterGateway::parse_completion(&resp).unwrap_err();
        assert!(err.is_retryable(), "{:?}", err);

        let resp = json!({"error": {"code": 401, "message": "no key"}});
        assert!(!OpenRouterGateway::parse_completion(&resp).unwrap_err().is_retryable());
    }

    #[test]
    fn test_empty_content_is_billed_malformed() {
        let resp = json!({
            "choices": [{"message": {"content": ""}}],
            "usage": {"prompt_tokens": 900, "completion_tokens": 0}
        });
        let err = OpenRouterGateway::parse_completion(&resp).unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(err.usage(), Some(TokenUsage::new(900, 0)));
    }

    #[test]
    fn test_error_object_with_success_status() {
        let resp = json!({"error": {"code": 429, "message": "upstream rate limit"}});
        let err = OpenRouterGateway::parse_completion(&resp).unwrap_err();
        assert!(matches!(err, GatewayError::RateLimited { .. }));
        assert_eq!(err.usage(), None);
    }

    #[test]
    fn test_debug_redacts_api_key() {
        let gateway = OpenRouterGateway::new("sk-or-1234567890abcdef");
        let debug_output = format!("{:?}", gateway);
        assert!(!debug_output.contains("1234567890abcdef"));
        assert!(debug_output.contains("sk-or-***"));
    }
}
