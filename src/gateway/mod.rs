//! Model gateway trait and normalized request/response types.
//!
//! The [`ModelGateway`] trait is the orchestrator's only view of the model
//! provider: send one request, get back text plus token usage, or a
//! [`GatewayError`] already classified as retryable or fatal. Transport
//! details (HTTP, auth headers) stay inside the implementations.
//!
//! ```text
//! StageExecutor ──► GatewayRequest ──► ModelGateway::invoke() ──► GatewayResponse
//!                                              │
//!                                   ┌──────────┴──────────┐
//!                             OpenRouterGateway       MockGateway
//!                           /chat/completions      scripted replies
//! ```
//!
//! Retry policy is not applied here. The executor owns the attempt budget
//! so transport retries and validation repairs share one ceiling.

pub mod backoff;
pub mod mock;
pub mod openrouter;

pub use backoff::{BackoffConfig, JitterStrategy};
pub use mock::{MockGateway, MockReply};
pub use openrouter::OpenRouterGateway;

use crate::stage::StageId;
use crate::types::EntityId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Sampling parameters sent with each call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelParams {
    pub temperature: f64,
    pub max_tokens: u32,
    /// Ask the provider for a JSON object response when supported.
    pub json_mode: bool,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 4096,
            json_mode: true,
        }
    }
}

/// A single message in a chat conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
}

/// Which stage invocation a call belongs to. Carried for logging and
/// routing; providers never see it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallOrigin {
    pub stage: StageId,
    pub entity: Option<EntityId>,
    /// 1-based attempt number within the stage invocation.
    pub attempt: u32,
}

/// A normalized, provider-agnostic model request.
#[derive(Debug, Clone)]
pub struct GatewayRequest {
    pub model: String,
    pub system_prompt: Option<String>,
    /// The rendered stage prompt.
    pub prompt: String,
    /// Conversation history for repair calls (original prompt, the invalid
    /// answer, and the correction). Empty for first attempts.
    pub messages: Vec<ChatMessage>,
    pub params: ModelParams,
    pub origin: CallOrigin,
}

impl GatewayRequest {
    /// The conversation to send: history when present, otherwise the prompt.
    pub fn conversation(&self) -> Vec<ChatMessage> {
        if self.messages.is_empty() {
            vec![ChatMessage::user(self.prompt.clone())]
        } else {
            self.messages.clone()
        }
    }
}

/// Tokens consumed by one call, as reported by the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GatewayResponse {
    pub text: String,
    pub usage: TokenUsage,
}

/// Transport failures, classified for the retry loop.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GatewayError {
    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        /// Provider's `Retry-After` hint, if any.
        retry_after: Option<Duration>,
    },

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("provider unavailable (HTTP {status}): {message}")]
    Unavailable { status: u16, message: String },

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("malformed provider response: {0}")]
    MalformedResponse(String),

    /// A failure after which the provider still reported consumed tokens.
    #[error("{inner}")]
    Billed {
        inner: Box<GatewayError>,
        usage: TokenUsage,
    },
}

impl GatewayError {
    pub fn rate_limited(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self::RateLimited {
            message: message.into(),
            retry_after,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout(message.into())
    }

    pub fn unavailable(status: u16, message: impl Into<String>) -> Self {
        Self::Unavailable {
            status,
            message: message.into(),
        }
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth(message.into())
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    /// Classify a non-success HTTP status.
    pub fn from_status(status: u16, body: &str, retry_after: Option<Duration>) -> Self {
        let message = truncate(body, 300);
        match status {
            429 => Self::rate_limited(message, retry_after),
            401 | 402 | 403 => Self::auth(format!("HTTP {}: {}", status, message)),
            408 => Self::timeout(format!("HTTP 408: {}", message)),
            500..=599 => Self::unavailable(status, message),
            _ => Self::invalid_request(format!("HTTP {}: {}", status, message)),
        }
    }

    /// Attach provider-reported usage to this error.
    pub fn billed(self, usage: TokenUsage) -> Self {
        match self {
            Self::Billed { inner, .. } => Self::Billed { inner, usage },
            other => Self::Billed {
                inner: Box::new(other),
                usage,
            },
        }
    }

    /// Tokens consumed despite the failure.
    pub fn usage(&self) -> Option<TokenUsage> {
        match self {
            Self::Billed { usage, .. } => Some(*usage),
            _ => None,
        }
    }

    /// Whether the same request may succeed if sent again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. }
            | Self::Timeout(_)
            | Self::Unavailable { .. }
            | Self::Connection(_)
            | Self::MalformedResponse(_) => true,
            Self::Auth(_) | Self::InvalidRequest(_) => false,
            Self::Billed { inner, .. } => inner.is_retryable(),
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            Self::Billed { inner, .. } => inner.retry_after(),
            _ => None,
        }
    }
}

pub(crate) fn truncate(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

/// Abstraction over model providers.
///
/// Implementations must be safe to call concurrently; the scheduler shares
/// one instance across every entity chain as `Arc<dyn ModelGateway>`.
#[async_trait]
pub trait ModelGateway: Send + Sync {
    /// Issue exactly one request to the provider.
    async fn invoke(&self, request: &GatewayRequest) -> Result<GatewayResponse, GatewayError>;

    /// Human-readable name for logging and diagnostics.
    fn name(&self) -> &'static str;
}
