//! Stage executor: one stage invocation for one (optional) entity.
//!
//! Renders the stage prompt from upstream artifacts, calls the model
//! gateway under the run's call gate, validates the answer against the
//! stage schema, and retries within a single attempt budget:
//!
//! - retryable transport failures back off and resend the same request;
//! - a validation failure triggers one repair call that quotes the invalid
//!   answer and the validator's complaint back to the model;
//! - fatal transport failures stop immediately.
//!
//! Every gateway attempt, successful or not, produces exactly one usage
//! record in the cost ledger.

use crate::diagnostics::ExecutionDiagnostics;
use crate::error::{StageCause, StageError, StageErrorKind};
use crate::events::{emit, RunEvent};
use crate::exec_ctx::ExecutionContext;
use crate::gateway::{CallOrigin, ChatMessage, GatewayError, GatewayRequest, ModelParams};
use crate::ledger::UsageRecord;
use crate::prompt::{self, PromptVars};
use crate::retry::repair_messages;
use crate::run_state::{Artifact, ValidationOutcome};
use crate::schema;
use crate::stage::StageDefinition;
use crate::types::{Entity, EntityId, PipelineRequest};
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// What a stage invocation reads: the run request, the entity it runs
/// for, and the upstream artifacts named by the stage's `inputs`.
#[derive(Debug, Clone)]
pub struct StageInputs<'a> {
    pub request: &'a PipelineRequest,
    pub entity: Option<&'a Entity>,
    pub artifacts: Vec<Arc<Artifact>>,
}

impl<'a> StageInputs<'a> {
    pub fn new(request: &'a PipelineRequest) -> Self {
        Self {
            request,
            entity: None,
            artifacts: Vec::new(),
        }
    }

    pub fn for_entity(mut self, entity: &'a Entity) -> Self {
        self.entity = Some(entity);
        self
    }

    pub fn with_artifact(mut self, artifact: Arc<Artifact>) -> Self {
        self.artifacts.push(artifact);
        self
    }

    /// Template variables for this stage.
    ///
    /// `request`, `business_name`, and `segment_count` are always set;
    /// `entity` and `entity_name` when running for an entity; one variable
    /// per upstream artifact, named after its stage; `schema` holds the
    /// expected output skeleton.
    pub fn vars(&self, stage: &StageDefinition) -> PromptVars {
        let mut vars = PromptVars::new();
        vars.insert_json("request", &request_view(self.request))
            .insert("business_name", self.request.business_name.clone())
            .insert("segment_count", self.request.bounds.requested.to_string())
            .insert_json("schema", &stage.schema.skeleton());
        if let Some(entity) = self.entity {
            vars.insert_json("entity", &entity.profile)
                .insert("entity_name", entity.name.clone());
        }
        for artifact in &self.artifacts {
            vars.insert_json(artifact.stage.as_str(), &artifact.value);
        }
        vars
    }
}

/// The request as the model should see it: business facts only.
fn request_view(request: &PipelineRequest) -> Value {
    let mut view = json!({ "business_name": request.business_name });
    let optional = [
        ("website_url", &request.website_url),
        ("industry", &request.industry),
        ("business_model", &request.business_model),
        ("target_market", &request.target_market),
        ("additional_context", &request.additional_context),
    ];
    for (key, value) in optional {
        if let Some(v) = value {
            view[key] = json!(v);
        }
    }
    if !request.source_urls.is_empty() {
        view["source_urls"] = json!(request.source_urls);
    }
    if !request.known_competitors.is_empty() {
        view["known_competitors"] = json!(request.known_competitors);
    }
    view
}

/// Runs stage invocations against a shared [`ExecutionContext`].
///
/// Cheap to clone; entity chains each hold one.
#[derive(Debug, Clone)]
pub struct StageExecutor {
    ctx: Arc<ExecutionContext>,
}

impl StageExecutor {
    pub fn new(ctx: Arc<ExecutionContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.ctx
    }

    /// Execute `stage` with `model` until an answer validates or the
    /// attempt budget runs out.
    ///
    /// On success the artifact is already stored in the run state.
    pub async fn execute(
        &self,
        stage: &StageDefinition,
        inputs: &StageInputs<'_>,
        model: &str,
    ) -> Result<Arc<Artifact>, StageError> {
        let ctx = &*self.ctx;
        let policy = &ctx.retry;
        let entity_id: Option<EntityId> = inputs.entity.map(|e| e.id.clone());
        let entity_label = entity_id.as_ref().map(|e| e.as_str()).unwrap_or("-");

        let vars = inputs.vars(stage);
        let prompt = prompt::render(&stage.prompt_template, &vars);
        let system = stage.system_prompt.as_ref().map(|t| prompt::render(t, &vars));

        let mut diag = ExecutionDiagnostics::default();
        let mut messages: Vec<ChatMessage> = Vec::new();
        let mut attempt: u32 = 0;

        emit(
            &ctx.event_handler,
            RunEvent::StageStarted {
                run_id: ctx.run_id,
                stage: stage.id,
                entity: entity_id.clone(),
            },
        );

        loop {
            let fail = |kind: StageErrorKind, cause: StageCause, attempts: u32| {
                self.failed(stage, entity_id.clone(), kind, cause, attempts)
            };

            if ctx.is_cancelled() {
                return Err(fail(StageErrorKind::Cancelled, StageCause::Cancelled, attempt));
            }
            let permit = tokio::select! {
                permit = ctx.gate.acquire() => permit,
                _ = ctx.cancelled() => None,
            };
            let Some(permit) = permit else {
                return Err(fail(StageErrorKind::Cancelled, StageCause::Cancelled, attempt));
            };
            // Cancellation may have arrived while waiting for a slot.
            if ctx.is_cancelled() {
                return Err(fail(StageErrorKind::Cancelled, StageCause::Cancelled, attempt));
            }

            attempt += 1;
            diag.attempts = attempt;
            let request = GatewayRequest {
                model: model.to_string(),
                system_prompt: system.clone(),
                prompt: prompt.clone(),
                messages: messages.clone(),
                params: ModelParams {
                    temperature: policy.temperature_for(stage.params.temperature, diag.repairs),
                    ..stage.params.clone()
                },
                origin: CallOrigin {
                    stage: stage.id,
                    entity: entity_id.clone(),
                    attempt,
                },
            };

            let invocation = ctx.state.begin_invocation(stage.id, entity_id.clone(), attempt, model);
            tracing::debug!(
                run_id = %ctx.run_id,
                stage = %stage.id,
                entity = entity_label,
                attempt,
                model,
                "dispatching stage invocation"
            );

            let started = Instant::now();
            let outcome = match tokio::time::timeout(policy.attempt_timeout, ctx.gateway.invoke(&request)).await {
                Ok(result) => result,
                Err(_) => Err(GatewayError::timeout(format!(
                    "no response within {}s",
                    policy.attempt_timeout.as_secs_f64()
                ))),
            };
            drop(permit);
            let latency_ms = started.elapsed().as_millis() as u64;

            match outcome {
                Err(err) => {
                    let usage = err.usage().unwrap_or_default();
                    ctx.ledger.record(
                        UsageRecord::new(ctx.run_id, stage.id, entity_id.clone(), attempt, model, usage)
                            .failed(err.to_string())
                            .latency_ms(latency_ms),
                    );
                    if is_timeout(&err) {
                        diag.timeouts += 1;
                    }

                    let retryable = err.is_retryable();
                    let can_retry = retryable && attempt < policy.max_attempts && !ctx.is_cancelled();
                    self.record_failure(
                        invocation,
                        can_retry,
                        None,
                        ValidationOutcome::NotChecked,
                        err.to_string(),
                    );

                    if !retryable {
                        tracing::error!(
                            run_id = %ctx.run_id,
                            stage = %stage.id,
                            entity = entity_label,
                            attempt,
                            error = %err,
                            "fatal gateway error"
                        );
                        return Err(fail(StageErrorKind::Fatal, err.into(), attempt));
                    }
                    if !can_retry {
                        let kind = if ctx.is_cancelled() {
                            StageErrorKind::Cancelled
                        } else {
                            StageErrorKind::Exhausted
                        };
                        return Err(fail(kind, err.into(), attempt));
                    }

                    let delay = policy.backoff.delay_for_retry(diag.transport_retries, err.retry_after());
                    diag.transport_retries += 1;
                    tracing::warn!(
                        run_id = %ctx.run_id,
                        stage = %stage.id,
                        entity = entity_label,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retryable gateway error; backing off"
                    );
                    emit(
                        &ctx.event_handler,
                        RunEvent::TransportRetry {
                            run_id: ctx.run_id,
                            stage: stage.id,
                            entity: entity_id.clone(),
                            attempt,
                            delay,
                            reason: err.to_string(),
                        },
                    );
                    if !delay.is_zero() {
                        // The next loop turn reports a cancel that cuts the wait short.
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {
                                diag.backoff_total_ms += delay.as_millis() as u64;
                            }
                            _ = ctx.cancelled() => {}
                        }
                    }
                }

                Ok(response) => {
                    ctx.ledger.record(
                        UsageRecord::new(ctx.run_id, stage.id, entity_id.clone(), attempt, model, response.usage)
                            .latency_ms(latency_ms),
                    );

                    match schema::validate(&response.text, &stage.schema) {
                        Ok(valid) => {
                            diag.repaired_json = valid.repaired;
                            let artifact = Artifact {
                                stage: stage.id,
                                entity: entity_id.clone(),
                                value: valid.value,
                                model: model.to_string(),
                                invocation_id: invocation,
                                diagnostics: diag,
                                created_at: Utc::now(),
                            };
                            let stored = ctx
                                .state
                                .complete_invocation(invocation, response.text, artifact)
                                .map_err(|e| {
                                    fail(StageErrorKind::Fatal, StageCause::Store(e.to_string()), attempt)
                                })?;

                            tracing::info!(
                                run_id = %ctx.run_id,
                                stage = %stage.id,
                                entity = entity_label,
                                attempts = attempt,
                                repaired_json = stored.diagnostics.repaired_json,
                                "stage succeeded"
                            );
                            emit(
                                &ctx.event_handler,
                                RunEvent::StageSucceeded {
                                    run_id: ctx.run_id,
                                    stage: stage.id,
                                    entity: entity_id.clone(),
                                    attempts: attempt,
                                },
                            );
                            return Ok(stored);
                        }

                        Err(invalid) => {
                            let reason = invalid.to_string();
                            diag.validation_errors.push(reason.clone());
                            let can_repair = diag.repairs < policy.max_repairs
                                && attempt < policy.max_attempts
                                && !ctx.is_cancelled();
                            self.record_failure(
                                invocation,
                                can_repair,
                                Some(response.text.clone()),
                                ValidationOutcome::Invalid {
                                    error: invalid.clone(),
                                },
                                reason.clone(),
                            );

                            if !can_repair {
                                let kind = if ctx.is_cancelled() {
                                    StageErrorKind::Cancelled
                                } else {
                                    StageErrorKind::Exhausted
                                };
                                return Err(fail(kind, invalid.into(), attempt));
                            }

                            diag.repairs += 1;
                            tracing::warn!(
                                run_id = %ctx.run_id,
                                stage = %stage.id,
                                entity = entity_label,
                                attempt,
                                issues = invalid.issues.len(),
                                "answer failed validation; requesting repair"
                            );
                            emit(
                                &ctx.event_handler,
                                RunEvent::RepairRequested {
                                    run_id: ctx.run_id,
                                    stage: stage.id,
                                    entity: entity_id.clone(),
                                    attempt,
                                    reason: reason.clone(),
                                },
                            );
                            messages = repair_messages(&prompt, &response.text, &reason);
                        }
                    }
                }
            }
        }
    }

    fn record_failure(
        &self,
        invocation: Uuid,
        retryable: bool,
        raw_response: Option<String>,
        validation: ValidationOutcome,
        error: String,
    ) {
        if let Err(err) = self
            .ctx
            .state
            .fail_invocation(invocation, retryable, raw_response, validation, error)
        {
            tracing::error!(run_id = %self.ctx.run_id, error = %err, "invocation log out of sync");
        }
    }

    fn failed(
        &self,
        stage: &StageDefinition,
        entity: Option<EntityId>,
        kind: StageErrorKind,
        cause: StageCause,
        attempts: u32,
    ) -> StageError {
        let err = StageError::new(stage.id, entity.clone(), kind, cause, attempts);
        if kind != StageErrorKind::Fatal {
            tracing::warn!(
                run_id = %self.ctx.run_id,
                stage = %stage.id,
                entity = entity.as_ref().map(|e| e.as_str()).unwrap_or("-"),
                attempts,
                %kind,
                error = %err.cause,
                "stage failed"
            );
        }
        emit(
            &self.ctx.event_handler,
            RunEvent::StageFailed {
                run_id: self.ctx.run_id,
                stage: stage.id,
                entity,
                kind,
                reason: err.cause.to_string(),
            },
        );
        err
    }
}

fn is_timeout(err: &GatewayError) -> bool {
    match err {
        GatewayError::Timeout(_) => true,
        GatewayError::Billed { inner, .. } => is_timeout(inner),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec_ctx::CallGate;
    use crate::gateway::{BackoffConfig, MockGateway, MockReply, Role, TokenUsage};
    use crate::ledger::{CallStatus, CostLedger};
    use crate::pricing::PriceTable;
    use crate::retry::RetryPolicy;
    use crate::run_state::{InvocationStatus, NodeKey};
    use crate::schema::{Field, Shape};
    use crate::stage::StageId;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn stage() -> StageDefinition {
        StageDefinition::new(
            StageId::Ingestion,
            "Company research",
            "Research {business_name}.\n{schema}",
            Shape::object(vec![
                Field::required("company_name", Shape::text()),
                Field::required("employees", Shape::integer(1, 1_000_000)),
            ]),
            "test/model",
        )
    }

    fn request() -> PipelineRequest {
        PipelineRequest::builder("Acme Analytics").build().unwrap()
    }

    fn ctx(mock: Arc<MockGateway>, retry: RetryPolicy) -> Arc<ExecutionContext> {
        Arc::new(
            ExecutionContext::builder(mock)
                .ledger(Arc::new(CostLedger::new(PriceTable::empty())))
                .retry(retry.with_backoff(BackoffConfig::none()))
                .build(),
        )
    }

    const GOOD: &str = r#"{"company_name": "Acme", "employees": 40}"#;

    #[tokio::test]
    async fn test_first_try_success() {
        let mock = Arc::new(MockGateway::new().stage(StageId::Ingestion, vec![MockReply::text(GOOD)]));
        let exec = StageExecutor::new(ctx(mock.clone(), RetryPolicy::default()));
        let req = request();

        let artifact = exec.execute(&stage(), &StageInputs::new(&req), "test/model").await.unwrap();
        assert_eq!(artifact.value["company_name"], "Acme");
        assert!(artifact.diagnostics.first_try());

        let calls = mock.calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].prompt.starts_with("Research Acme Analytics."));
        assert!(calls[0].prompt.contains("\"employees\""));
        assert_eq!(exec.context().ledger.len(), 1);
        assert!(exec.context().state.has_artifact(&NodeKey::run(StageId::Ingestion)));
    }

    #[tokio::test]
    async fn test_rate_limit_then_success_records_every_attempt() {
        let mock = Arc::new(MockGateway::new().with_usage(100, 50).stage(
            StageId::Ingestion,
            vec![
                MockReply::error(GatewayError::rate_limited("429", None)),
                MockReply::error(GatewayError::rate_limited("429", None).billed(TokenUsage::new(10, 0))),
                MockReply::text(GOOD),
            ],
        ));
        let exec = StageExecutor::new(ctx(mock.clone(), RetryPolicy::default()));
        let req = request();

        let artifact = exec.execute(&stage(), &StageInputs::new(&req), "test/model").await.unwrap();
        assert_eq!(artifact.diagnostics.attempts, 3);
        assert_eq!(artifact.diagnostics.transport_retries, 2);

        let records = exec.context().ledger.records_for(StageId::Ingestion, None);
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].status, CallStatus::Error);
        assert_eq!(records[1].input_tokens, 10);
        assert_eq!(records[2].status, CallStatus::Success);
        assert_eq!(records[2].input_tokens, 100);
        assert_eq!(
            records.iter().map(|r| r.attempt).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );

        let log = exec.context().state.invocations();
        assert_eq!(log[0].status, InvocationStatus::FailedRetryable);
        assert_eq!(log[2].status, InvocationStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_repair_quotes_invalid_answer() {
        let bad = r#"{"company_name": "Acme", "employees": 0}"#;
        let mock = Arc::new(
            MockGateway::new().stage(StageId::Ingestion, vec![MockReply::text(bad), MockReply::text(GOOD)]),
        );
        let exec = StageExecutor::new(ctx(mock.clone(), RetryPolicy::default()));
        let req = request();

        let artifact = exec.execute(&stage(), &StageInputs::new(&req), "test/model").await.unwrap();
        assert_eq!(artifact.diagnostics.repairs, 1);
        assert_eq!(artifact.diagnostics.validation_errors.len(), 1);

        let calls = mock.calls();
        assert_eq!(calls.len(), 2);
        let repair = &calls[1].messages;
        assert_eq!(repair.len(), 3);
        assert_eq!(repair[1].role, Role::Assistant);
        assert_eq!(repair[1].content, bad);
        assert!(repair[2].content.contains("$.employees"));
    }

    #[tokio::test]
    async fn test_second_invalid_answer_exhausts() {
        let mock = Arc::new(MockGateway::new().stage(StageId::Ingestion, vec![MockReply::text("no json here")]));
        let exec = StageExecutor::new(ctx(mock.clone(), RetryPolicy::default()));
        let req = request();

        let err = exec.execute(&stage(), &StageInputs::new(&req), "test/model").await.unwrap_err();
        assert_eq!(err.kind, StageErrorKind::Exhausted);
        assert_eq!(err.attempts, 2);
        assert!(matches!(err.cause, StageCause::Validation(_)));
        assert_eq!(mock.call_count(), 2);
        assert_eq!(exec.context().ledger.len(), 2);
        assert!(!exec.context().state.has_artifact(&NodeKey::run(StageId::Ingestion)));
    }

    #[tokio::test]
    async fn test_attempt_budget_is_shared() {
        // Two transport failures, one invalid answer, one more failure: four attempts.
        let mock = Arc::new(MockGateway::new().stage(
            StageId::Ingestion,
            vec![
                MockReply::error(GatewayError::unavailable(503, "down")),
                MockReply::error(GatewayError::unavailable(503, "down")),
                MockReply::text("{}"),
                MockReply::error(GatewayError::unavailable(503, "down")),
            ],
        ));
        let exec = StageExecutor::new(ctx(mock.clone(), RetryPolicy::new(4)));
        let req = request();

        let err = exec.execute(&stage(), &StageInputs::new(&req), "test/model").await.unwrap_err();
        assert_eq!(err.kind, StageErrorKind::Exhausted);
        assert_eq!(err.attempts, 4);
        assert!(matches!(err.cause, StageCause::Gateway(_)));
        assert_eq!(mock.call_count(), 4);
        assert_eq!(exec.context().ledger.len(), 4);
    }

    #[tokio::test]
    async fn test_fatal_error_stops_immediately() {
        let mock = Arc::new(
            MockGateway::new().stage(StageId::Ingestion, vec![MockReply::error(GatewayError::auth("bad key"))]),
        );
        let exec = StageExecutor::new(ctx(mock.clone(), RetryPolicy::default()));
        let req = request();

        let err = exec.execute(&stage(), &StageInputs::new(&req), "test/model").await.unwrap_err();
        assert_eq!(err.kind, StageErrorKind::Fatal);
        assert_eq!(err.attempts, 1);
        assert_eq!(mock.call_count(), 1);
        assert_eq!(exec.context().state.invocations()[0].status, InvocationStatus::FailedFatal);
    }

    #[tokio::test]
    async fn test_attempt_timeout_is_retryable() {
        let mock = Arc::new(
            MockGateway::new()
                .with_latency(Duration::from_millis(200))
                .stage(StageId::Ingestion, vec![MockReply::text(GOOD)]),
        );
        let retry = RetryPolicy::new(2).with_attempt_timeout(Duration::from_millis(10));
        let exec = StageExecutor::new(ctx(mock.clone(), retry));
        let req = request();

        let err = exec.execute(&stage(), &StageInputs::new(&req), "test/model").await.unwrap_err();
        assert_eq!(err.kind, StageErrorKind::Exhausted);
        assert_eq!(err.attempts, 2);
        assert_eq!(exec.context().ledger.len(), 2);
        assert!(exec.context().ledger.records().iter().all(|r| r.status == CallStatus::Error));
    }

    #[tokio::test]
    async fn test_cancelled_before_dispatch() {
        let mock = Arc::new(MockGateway::new().stage(StageId::Ingestion, vec![MockReply::text(GOOD)]));
        let flag = Arc::new(AtomicBool::new(false));
        let ctx = Arc::new(
            ExecutionContext::builder(mock.clone())
                .cancellation(flag.clone())
                .build(),
        );
        flag.store(true, Ordering::SeqCst);
        let req = request();

        let err = StageExecutor::new(ctx)
            .execute(&stage(), &StageInputs::new(&req), "test/model")
            .await
            .unwrap_err();
        assert_eq!(err.kind, StageErrorKind::Cancelled);
        assert_eq!(err.attempts, 0);
        assert_eq!(mock.call_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_cuts_backoff_short() {
        let mock = Arc::new(MockGateway::new().stage(
            StageId::Ingestion,
            vec![
                MockReply::error(GatewayError::rate_limited("429", Some(Duration::from_secs(30)))),
                MockReply::text(GOOD),
            ],
        ));
        let ctx = Arc::new(
            ExecutionContext::builder(mock.clone())
                .retry(RetryPolicy::default().with_backoff(BackoffConfig::standard()))
                .build(),
        );
        let exec = StageExecutor::new(ctx.clone());
        let req = request();
        let def = stage();
        let inputs = StageInputs::new(&req);

        let started = Instant::now();
        let canceller = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            ctx.cancel();
        };
        let (result, ()) = tokio::join!(exec.execute(&def, &inputs, "test/model"), canceller);

        let err = result.unwrap_err();
        assert_eq!(err.kind, StageErrorKind::Cancelled);
        assert_eq!(err.attempts, 1);
        assert!(started.elapsed() < Duration::from_secs(5), "took {:?}", started.elapsed());
        assert_eq!(mock.call_count(), 1);
        assert_eq!(ctx.ledger.len(), 1);
        assert_eq!(ctx.state.invocations()[0].status, InvocationStatus::FailedRetryable);
    }

    #[tokio::test]
    async fn test_cancel_releases_gate_waiter() {
        let mock = Arc::new(MockGateway::new().stage(StageId::Ingestion, vec![MockReply::text(GOOD)]));
        let gate = CallGate::new(1);
        let _held = gate.acquire().await.unwrap();
        let ctx = Arc::new(ExecutionContext::builder(mock.clone()).gate(gate.clone()).build());
        let exec = StageExecutor::new(ctx.clone());
        let req = request();
        let def = stage();
        let inputs = StageInputs::new(&req);

        let canceller = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            ctx.cancel();
        };
        let (result, ()) = tokio::time::timeout(
            Duration::from_secs(2),
            async { tokio::join!(exec.execute(&def, &inputs, "test/model"), canceller) },
        )
        .await
        .unwrap();

        let err = result.unwrap_err();
        assert_eq!(err.kind, StageErrorKind::Cancelled);
        assert_eq!(err.attempts, 0);
        assert_eq!(mock.call_count(), 0);
        assert_eq!(gate.in_flight(), 1);
    }

    #[test]
    fn test_failure_for_unknown_invocation_is_logged() {
        let exec = StageExecutor::new(ctx(Arc::new(MockGateway::new()), RetryPolicy::default()));
        exec.record_failure(
            Uuid::new_v4(),
            false,
            None,
            ValidationOutcome::NotChecked,
            "lost".to_string(),
        );
        assert!(exec.context().state.invocations().is_empty());
    }

    #[test]
    fn test_vars_include_entity_and_artifacts() {
        let req = PipelineRequest::builder("Acme")
            .industry("Logistics")
            .competitor("Globex")
            .build()
            .unwrap();
        let entity = Entity {
            id: EntityId::new("smb-retail"),
            name: "SMB retail".into(),
            index: 0,
            profile: json!({"name": "SMB retail"}),
        };
        let upstream = Arc::new(Artifact {
            stage: StageId::ValueMapping,
            entity: Some(entity.id.clone()),
            value: json!({"fit_score": 80}),
            model: "m".into(),
            invocation_id: uuid::Uuid::new_v4(),
            diagnostics: ExecutionDiagnostics::default(),
            created_at: Utc::now(),
        });
        let inputs = StageInputs::new(&req).for_entity(&entity).with_artifact(upstream);

        let vars = inputs.vars(&stage());
        assert_eq!(vars.get("entity_name"), Some("SMB retail"));
        assert_eq!(vars.get("segment_count"), Some("3"));
        assert!(vars.get("value_mapping").unwrap().contains("\"fit_score\": 80"));
        let request: Value = serde_json::from_str(vars.get("request").unwrap()).unwrap();
        assert_eq!(request, json!({"business_name": "Acme", "industry": "Logistics", "known_competitors": ["Globex"]}));
    }
}
