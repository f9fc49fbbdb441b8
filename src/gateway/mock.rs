//! Scripted gateway for tests and offline demos.
//!
//! [`MockGateway`] answers each call from a script chosen by the call's
//! stage and entity, records every request it sees, and tracks how many
//! calls were in flight at once.
//!
//! # Example
//!
//! ```
//! use resonance_pipeline::gateway::{GatewayError, MockGateway, MockReply};
//! use resonance_pipeline::StageId;
//!
//! let mock = MockGateway::new()
//!     .stage(StageId::Ingestion, vec![
//!         MockReply::error(GatewayError::rate_limited("slow down", None)),
//!         MockReply::text(r#"{"company_name": "Acme"}"#),
//!     ]);
//! ```

use super::{
    CallOrigin, ChatMessage, GatewayError, GatewayRequest, GatewayResponse, ModelGateway,
    TokenUsage,
};
use crate::stage::StageId;
use crate::types::EntityId;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// One scripted answer.
#[derive(Debug, Clone)]
pub enum MockReply {
    Text(String),
    Error(GatewayError),
}

impl MockReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    pub fn json(value: &serde_json::Value) -> Self {
        Self::Text(value.to_string())
    }

    pub fn error(err: GatewayError) -> Self {
        Self::Error(err)
    }
}

/// Replies are consumed in order; the last one repeats forever.
#[derive(Debug)]
struct Script {
    replies: Vec<MockReply>,
    next: usize,
}

impl Script {
    fn next_reply(&mut self) -> Option<MockReply> {
        let idx = self.next.min(self.replies.len().checked_sub(1)?);
        self.next += 1;
        self.replies.get(idx).cloned()
    }
}

type RouteKey = (StageId, Option<EntityId>);

/// A request as the mock saw it.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub origin: CallOrigin,
    pub model: String,
    pub prompt: String,
    pub messages: Vec<ChatMessage>,
}

#[derive(Debug, Default)]
pub struct MockGateway {
    routes: Mutex<HashMap<RouteKey, Script>>,
    usage: TokenUsage,
    latency: Duration,
    calls: Mutex<Vec<RecordedCall>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script replies for `stage` regardless of entity. An entity-specific
    /// route takes precedence.
    pub fn stage(self, stage: StageId, replies: Vec<MockReply>) -> Self {
        self.insert((stage, None), replies)
    }

    /// Script replies for `stage` when run for `entity`.
    pub fn entity(self, stage: StageId, entity: impl Into<String>, replies: Vec<MockReply>) -> Self {
        self.insert((stage, Some(EntityId::new(entity))), replies)
    }

    fn insert(self, key: RouteKey, replies: Vec<MockReply>) -> Self {
        self.routes.lock().insert(key, Script { replies, next: 0 });
        self
    }

    /// Usage reported on every successful reply.
    pub fn with_usage(mut self, input_tokens: u64, output_tokens: u64) -> Self {
        self.usage = TokenUsage::new(input_tokens, output_tokens);
        self
    }

    /// Simulated provider latency per call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Calls recorded for one stage and (optional) entity.
    pub fn calls_for(&self, stage: StageId, entity: Option<&str>) -> Vec<RecordedCall> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.origin.stage == stage && c.origin.entity.as_ref().map(|e| e.as_str()) == entity)
            .cloned()
            .collect()
    }

    /// Highest number of calls observed executing at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn next_reply(&self, origin: &CallOrigin) -> Option<MockReply> {
        let mut routes = self.routes.lock();
        let exact = (origin.stage, origin.entity.clone());
        if let Some(script) = routes.get_mut(&exact) {
            return script.next_reply();
        }
        routes.get_mut(&(origin.stage, None))?.next_reply()
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ModelGateway for MockGateway {
    async fn invoke(&self, request: &GatewayRequest) -> Result<GatewayResponse, GatewayError> {
        self.calls.lock().push(RecordedCall {
            origin: request.origin.clone(),
            model: request.model.clone(),
            prompt: request.prompt.clone(),
            messages: request.messages.clone(),
        });

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        // Released on drop, so a call abandoned by a timeout still counts down.
        let _in_flight = InFlight(&self.in_flight);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        } else {
            tokio::task::yield_now().await;
        }

        match self.next_reply(&request.origin) {
            Some(MockReply::Text(text)) => Ok(GatewayResponse {
                text,
                usage: self.usage,
            }),
            Some(MockReply::Error(err)) => Err(err),
            None => Err(GatewayError::invalid_request(format!(
                "no scripted reply for {:?} / {:?}",
                request.origin.stage, request.origin.entity
            ))),
        }
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}
