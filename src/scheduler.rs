//! Pipeline scheduler.
//!
//! A run is driven by one coordinating task. Run-level stages execute in
//! order; the fan-out stage's artifact is turned into entities; each entity
//! then walks the per-entity chain independently. Chains are polled
//! concurrently inside the coordinating task, and the shared [`CallGate`]
//! bounds how many gateway calls are actually in flight.
//!
//! One entity failing never stops its siblings. A run-level failure, an
//! empty fan-out, or a missing upstream artifact fails the whole run.

use crate::error::{PipelineError, Result, StageErrorKind};
use crate::events::{emit, EventHandler, RunEvent};
use crate::exec_ctx::{CallGate, ExecutionContext};
use crate::executor::{StageExecutor, StageInputs};
use crate::gateway::ModelGateway;
use crate::ledger::CostLedger;
use crate::pricing::PriceTable;
use crate::result::{EntityOutcome, NodeSnapshot, RunFailure, RunResult, RunSnapshot, RunStatus};
use crate::retry::RetryPolicy;
use crate::run_state::{Artifact, NodeKey, NodeState, RunState};
use crate::stage::{StageConfig, StageDefinition, StageId};
use crate::types::{Entity, EntityId, PipelineRequest, RunId};
use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// Scheduler-wide knobs.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// Gateway calls allowed in flight across all runs. Default: 4.
    pub max_in_flight: usize,
    /// Attempt budget for every stage invocation.
    pub retry: RetryPolicy,
    /// Prices used by each run's cost ledger.
    pub prices: PriceTable,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            max_in_flight: 4,
            retry: RetryPolicy::default(),
            prices: PriceTable::research_defaults(),
        }
    }
}

impl SchedulerSettings {
    pub fn max_in_flight(mut self, limit: usize) -> Self {
        self.max_in_flight = limit;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn prices(mut self, prices: PriceTable) -> Self {
        self.prices = prices;
        self
    }
}

/// Mutable bookkeeping of one run, outside the artifact store.
#[derive(Debug)]
struct Progress {
    status: RunStatus,
    entities: Vec<Entity>,
    outcomes: BTreeMap<EntityId, EntityOutcome>,
    warnings: Vec<String>,
    failure: Option<RunFailure>,
    finished_at: Option<DateTime<Utc>>,
    elapsed: Option<Duration>,
}

/// State shared between a run's coordinator, its handle, and the registry.
#[derive(Debug)]
struct RunShared {
    request: Arc<PipelineRequest>,
    started_at: DateTime<Utc>,
    started: Instant,
    ctx: Arc<ExecutionContext>,
    progress: Mutex<Progress>,
}

impl RunShared {
    fn run_id(&self) -> RunId {
        self.ctx.run_id
    }

    fn snapshot(&self) -> RunSnapshot {
        let progress = self.progress.lock();
        let elapsed = progress.elapsed.unwrap_or_else(|| self.started.elapsed());
        let nodes = self
            .ctx
            .state
            .nodes()
            .into_iter()
            .map(|(key, state)| NodeSnapshot {
                stage: key.stage,
                entity: key.entity,
                state,
            })
            .collect();
        RunSnapshot {
            run_id: self.run_id(),
            status: progress.status,
            started_at: self.started_at,
            elapsed_ms: elapsed.as_millis() as u64,
            nodes,
            entities: progress.entities.iter().map(|e| e.id.clone()).collect(),
            entity_status: progress.outcomes.clone(),
            calls_in_flight: self.ctx.gate.in_flight(),
            usage: self.ctx.ledger.snapshot(),
        }
    }

    fn result(&self) -> RunResult {
        let progress = self.progress.lock();
        let artifacts: Vec<Artifact> = self
            .ctx
            .state
            .artifacts()
            .iter()
            .map(|a| Artifact::clone(a))
            .collect();

        let mut usage_records = self.ctx.ledger.records();
        usage_records.sort_by(|a, b| {
            (a.stage, &a.entity, a.attempt).cmp(&(b.stage, &b.entity, b.attempt))
        });
        let mut invocations = self.ctx.state.invocations();
        invocations.sort_by(|a, b| {
            (a.stage, &a.entity, a.attempt).cmp(&(b.stage, &b.entity, b.attempt))
        });

        RunResult {
            run_id: self.run_id(),
            request: (*self.request).clone(),
            status: progress.status,
            failure: progress.failure.clone(),
            entities: progress.entities.clone(),
            entity_status: progress.outcomes.clone(),
            artifacts,
            usage: self.ctx.ledger.snapshot(),
            usage_records,
            invocations,
            warnings: progress.warnings.clone(),
            started_at: self.started_at,
            finished_at: progress.finished_at.unwrap_or_else(Utc::now),
        }
    }
}

/// Handle to a started run.
#[derive(Debug)]
pub struct RunHandle {
    run: Arc<RunShared>,
    task: JoinHandle<RunResult>,
}

impl RunHandle {
    pub fn run_id(&self) -> RunId {
        self.run.run_id()
    }

    /// Request cancellation. In-flight calls finish; nothing new starts.
    pub fn cancel(&self) {
        self.run.ctx.cancel();
    }

    pub fn snapshot(&self) -> RunSnapshot {
        self.run.snapshot()
    }

    /// Wait for the run to reach a terminal state.
    pub async fn wait(self) -> Result<RunResult> {
        Ok(self.task.await?)
    }
}

/// Starts runs against one stage graph and one model gateway.
///
/// # Example
///
/// ```no_run
/// use resonance_pipeline::{OpenRouterGateway, PipelineRequest, Scheduler};
/// use std::sync::Arc;
///
/// # async fn demo() -> resonance_pipeline::Result<()> {
/// let scheduler = Scheduler::research(Arc::new(OpenRouterGateway::from_env()?));
/// let request = PipelineRequest::builder("Acme Analytics")
///     .website("https://acme.example")
///     .build()?;
/// let result = scheduler.run(request).await?;
/// println!("{} cost ${:.4}", result.status, result.usage.total_cost_usd());
/// # Ok(())
/// # }
/// ```
pub struct Scheduler {
    config: Arc<StageConfig>,
    gateway: Arc<dyn ModelGateway>,
    settings: SchedulerSettings,
    gate: CallGate,
    event_handler: Option<Arc<dyn EventHandler>>,
    runs: RwLock<HashMap<RunId, Arc<RunShared>>>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("stages", &self.config.stages.iter().map(|s| s.id).collect::<Vec<_>>())
            .field("gateway", &self.gateway.name())
            .field("settings", &self.settings)
            .field("runs", &self.runs.read().len())
            .finish()
    }
}

impl Scheduler {
    /// A scheduler for a validated stage graph.
    pub fn new(config: StageConfig, gateway: Arc<dyn ModelGateway>) -> Result<Self> {
        config.validate()?;
        let settings = SchedulerSettings::default();
        Ok(Self {
            config: Arc::new(config),
            gateway,
            gate: CallGate::new(settings.max_in_flight),
            settings,
            event_handler: None,
            runs: RwLock::new(HashMap::new()),
        })
    }

    /// A scheduler for the built-in research graph.
    pub fn research(gateway: Arc<dyn ModelGateway>) -> Self {
        let settings = SchedulerSettings::default();
        Self {
            config: Arc::new(StageConfig::research_default()),
            gateway,
            gate: CallGate::new(settings.max_in_flight),
            settings,
            event_handler: None,
            runs: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_settings(mut self, settings: SchedulerSettings) -> Self {
        self.gate = CallGate::new(settings.max_in_flight);
        self.settings = settings;
        self
    }

    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.event_handler = Some(handler);
        self
    }

    pub fn config(&self) -> &StageConfig {
        &self.config
    }

    pub fn gate(&self) -> &CallGate {
        &self.gate
    }

    /// Validate `request` and start a run in the background.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self, request: PipelineRequest) -> Result<RunHandle> {
        request.validate()?;
        if let Some(stage) = request_overrides_unknown_stage(&self.config, &request) {
            return Err(PipelineError::InvalidRequest(format!(
                "model override for stage `{}`, which is not configured",
                stage
            )));
        }

        let run_id = RunId::new();
        let ctx = ExecutionContext::builder(self.gateway.clone())
            .run_id(run_id)
            .ledger(Arc::new(CostLedger::new(self.settings.prices.clone())))
            .state(Arc::new(RunState::new()))
            .gate(self.gate.clone())
            .retry(self.settings.retry.clone())
            .cancellation(Arc::new(AtomicBool::new(false)));
        let ctx = match &self.event_handler {
            Some(handler) => ctx.event_handler(handler.clone()),
            None => ctx,
        };
        let ctx = Arc::new(ctx.build());

        let run = Arc::new(RunShared {
            request: Arc::new(request),
            started_at: Utc::now(),
            started: Instant::now(),
            ctx: ctx.clone(),
            progress: Mutex::new(Progress {
                status: RunStatus::Running,
                entities: Vec::new(),
                outcomes: BTreeMap::new(),
                warnings: Vec::new(),
                failure: None,
                finished_at: None,
                elapsed: None,
            }),
        });
        self.runs.write().insert(run_id, run.clone());

        let coordinator = Coordinator {
            config: self.config.clone(),
            run: run.clone(),
            executor: StageExecutor::new(ctx),
        };
        let task = tokio::spawn(coordinator.drive());
        Ok(RunHandle { run, task })
    }

    /// Start a run and wait for its result.
    pub async fn run(&self, request: PipelineRequest) -> Result<RunResult> {
        self.start(request)?.wait().await
    }

    /// Request cancellation of a run. A finished run is left as is.
    pub fn cancel(&self, run_id: RunId) -> Result<()> {
        let run = self.lookup(run_id)?;
        tracing::info!(run_id = %run_id, "cancellation requested");
        run.ctx.cancel();
        Ok(())
    }

    pub fn status(&self, run_id: RunId) -> Result<RunSnapshot> {
        Ok(self.lookup(run_id)?.snapshot())
    }

    /// Known run ids, newest last.
    pub fn runs(&self) -> Vec<RunId> {
        let runs = self.runs.read();
        let mut ids: Vec<(DateTime<Utc>, RunId)> = runs.values().map(|r| (r.started_at, r.run_id())).collect();
        ids.sort();
        ids.into_iter().map(|(_, id)| id).collect()
    }

    /// Drop a finished run from the registry.
    pub fn forget(&self, run_id: RunId) -> Result<()> {
        let run = self.lookup(run_id)?;
        if !run.progress.lock().status.is_terminal() {
            return Err(PipelineError::InvalidRequest(format!("run {} is still running", run_id)));
        }
        self.runs.write().remove(&run_id);
        Ok(())
    }

    fn lookup(&self, run_id: RunId) -> Result<Arc<RunShared>> {
        self.runs
            .read()
            .get(&run_id)
            .cloned()
            .ok_or_else(|| PipelineError::UnknownRun(run_id.to_string()))
    }
}

fn request_overrides_unknown_stage(config: &StageConfig, request: &PipelineRequest) -> Option<StageId> {
    StageId::ALL
        .into_iter()
        .find(|id| request.models.get(*id).is_some() && config.get(*id).is_none())
}

/// Drives one run to completion.
struct Coordinator {
    config: Arc<StageConfig>,
    run: Arc<RunShared>,
    executor: StageExecutor,
}

/// How an entity chain ended, plus a run-level failure when the chain hit
/// a structural problem.
struct ChainEnd {
    entity: EntityId,
    outcome: EntityOutcome,
    structural: Option<RunFailure>,
}

impl Coordinator {
    fn ctx(&self) -> &ExecutionContext {
        self.executor.context()
    }

    async fn drive(self) -> RunResult {
        let run_id = self.run.run_id();
        tracing::info!(run_id = %run_id, business = %self.run.request.business_name, "run started");
        emit(
            &self.ctx().event_handler,
            RunEvent::RunStarted {
                run_id,
                business_name: self.run.request.business_name.clone(),
            },
        );

        let status = self.execute().await;

        let elapsed = self.run.started.elapsed();
        {
            let mut progress = self.run.progress.lock();
            progress.status = status;
            progress.finished_at = Some(Utc::now());
            progress.elapsed = Some(elapsed);
        }
        let usage = self.ctx().ledger.snapshot();
        tracing::info!(
            run_id = %run_id,
            %status,
            elapsed_ms = elapsed.as_millis() as u64,
            calls = usage.calls,
            cost_usd = usage.total_cost_usd(),
            "run finished"
        );
        emit(
            &self.ctx().event_handler,
            RunEvent::RunFinished {
                run_id,
                status,
                elapsed,
            },
        );
        self.run.result()
    }

    async fn execute(&self) -> RunStatus {
        let ctx = self.ctx();
        let request = &*self.run.request;

        for stage in self.config.run_stages() {
            ctx.state.register_node(NodeKey::run(stage.id));
        }

        for stage in self.config.run_stages() {
            if ctx.is_cancelled() {
                ctx.state.skip_pending(|_| true);
                return RunStatus::Cancelled;
            }
            let artifacts = match self.inputs_for(stage, None) {
                Ok(a) => a,
                Err(missing) => {
                    ctx.state.skip_pending(|_| true);
                    return self.fail_run(RunFailure::MissingArtifact {
                        stage: stage.id,
                        missing,
                    });
                }
            };

            let key = NodeKey::run(stage.id);
            self.mark(&key, NodeState::Running);
            let inputs = StageInputs {
                request,
                entity: None,
                artifacts,
            };
            let model = request.models.resolve(stage.id, &stage.default_model);
            match self.executor.execute(stage, &inputs, model).await {
                Ok(_) => self.mark(&key, NodeState::Succeeded),
                Err(err) => {
                    self.mark(&key, NodeState::Failed);
                    ctx.state.skip_pending(|_| true);
                    if err.kind == StageErrorKind::Cancelled {
                        return RunStatus::Cancelled;
                    }
                    return self.fail_run(RunFailure::StageFailed {
                        stage: stage.id,
                        kind: err.kind,
                        attempts: err.attempts,
                        reason: err.cause.to_string(),
                    });
                }
            }
        }

        let entities = match self.fan_out() {
            Ok(entities) => entities,
            Err(failure) => return self.fail_run(failure),
        };

        let mut chains: FuturesUnordered<_> = entities.iter().map(|e| self.run_chain(e)).collect();
        let mut structural: Option<RunFailure> = None;
        let mut cancelled = false;
        while let Some(end) = chains.next().await {
            let ok = end.outcome.is_success();
            if let EntityOutcome::Failed { kind, .. } = &end.outcome {
                cancelled |= *kind == StageErrorKind::Cancelled;
            }
            if let Some(failure) = end.structural {
                if structural.is_none() {
                    // Stop the remaining chains from dispatching anything new.
                    ctx.cancel();
                    structural = Some(failure);
                }
            }
            self.run.progress.lock().outcomes.insert(end.entity.clone(), end.outcome);
            emit(
                &ctx.event_handler,
                RunEvent::EntityFinished {
                    run_id: ctx.run_id,
                    entity: end.entity,
                    ok,
                },
            );
        }

        if let Some(failure) = structural {
            return self.fail_run(failure);
        }
        if cancelled {
            RunStatus::Cancelled
        } else {
            RunStatus::Completed
        }
    }

    /// Read entities out of the fan-out artifact and register their nodes.
    fn fan_out(&self) -> std::result::Result<Vec<Entity>, RunFailure> {
        let ctx = self.ctx();
        let Some((stage, rule)) = self.config.fan_out_stage() else {
            return Err(RunFailure::NoEntities {
                warnings: vec!["no fan-out stage configured".to_string()],
            });
        };
        let key = NodeKey::run(stage.id);
        let Some(artifact) = ctx.state.artifact(&key) else {
            return Err(RunFailure::MissingArtifact {
                stage: stage.id,
                missing: key,
            });
        };

        let extraction = rule.extract(&artifact.value, &self.run.request.bounds);
        for warning in &extraction.warnings {
            tracing::warn!(run_id = %ctx.run_id, stage = %stage.id, "{}", warning);
        }
        {
            let mut progress = self.run.progress.lock();
            progress.warnings.extend(extraction.warnings.iter().cloned());
            progress.entities = extraction.entities.clone();
        }
        if extraction.entities.is_empty() {
            return Err(RunFailure::NoEntities {
                warnings: extraction.warnings,
            });
        }

        for entity in &extraction.entities {
            for stage in self.config.entity_stages() {
                ctx.state.register_node(NodeKey::new(stage.id, Some(entity.id.clone())));
            }
        }
        tracing::info!(
            run_id = %ctx.run_id,
            count = extraction.entities.len(),
            "fanning out over entities"
        );
        emit(
            &ctx.event_handler,
            RunEvent::EntitiesDiscovered {
                run_id: ctx.run_id,
                entities: extraction
                    .entities
                    .iter()
                    .map(|e| (e.id.clone(), e.name.clone()))
                    .collect(),
            },
        );
        Ok(extraction.entities)
    }

    /// Walk the per-entity chain for one entity.
    async fn run_chain(&self, entity: &Entity) -> ChainEnd {
        let ctx = self.ctx();
        let request = &*self.run.request;
        let skip_rest = || ctx.state.skip_pending(|k| k.entity.as_ref() == Some(&entity.id));
        let end = |outcome: EntityOutcome, structural: Option<RunFailure>| ChainEnd {
            entity: entity.id.clone(),
            outcome,
            structural,
        };

        for stage in self.config.entity_stages() {
            if ctx.is_cancelled() {
                skip_rest();
                return end(
                    EntityOutcome::Failed {
                        stage: stage.id,
                        kind: StageErrorKind::Cancelled,
                        attempts: 0,
                        reason: "run cancelled".to_string(),
                    },
                    None,
                );
            }

            let artifacts = match self.inputs_for(stage, Some(&entity.id)) {
                Ok(a) => a,
                Err(missing) => {
                    skip_rest();
                    let failure = RunFailure::MissingArtifact {
                        stage: stage.id,
                        missing: missing.clone(),
                    };
                    return end(
                        EntityOutcome::Failed {
                            stage: stage.id,
                            kind: StageErrorKind::Fatal,
                            attempts: 0,
                            reason: failure.to_string(),
                        },
                        Some(failure),
                    );
                }
            };

            let key = NodeKey::new(stage.id, Some(entity.id.clone()));
            self.mark(&key, NodeState::Running);
            let inputs = StageInputs {
                request,
                entity: Some(entity),
                artifacts,
            };
            let model = request.models.resolve(stage.id, &stage.default_model);
            match self.executor.execute(stage, &inputs, model).await {
                Ok(_) => self.mark(&key, NodeState::Succeeded),
                Err(err) => {
                    self.mark(&key, NodeState::Failed);
                    skip_rest();
                    return end(
                        EntityOutcome::Failed {
                            stage: stage.id,
                            kind: err.kind,
                            attempts: err.attempts,
                            reason: err.cause.to_string(),
                        },
                        None,
                    );
                }
            }
        }

        tracing::info!(run_id = %ctx.run_id, entity = %entity.id, "entity chain succeeded");
        end(EntityOutcome::Succeeded, None)
    }

    /// Upstream artifacts for `stage`. Per-entity inputs resolve against
    /// `entity`; run-level inputs against the run.
    fn inputs_for(
        &self,
        stage: &StageDefinition,
        entity: Option<&EntityId>,
    ) -> std::result::Result<Vec<Arc<Artifact>>, NodeKey> {
        stage
            .inputs
            .iter()
            .map(|input| {
                let per_entity = self.config.get(*input).is_some_and(|s| s.is_per_entity());
                let key = if per_entity {
                    NodeKey::new(*input, entity.cloned())
                } else {
                    NodeKey::run(*input)
                };
                self.ctx().state.artifact(&key).ok_or(key)
            })
            .collect()
    }

    fn mark(&self, key: &NodeKey, to: NodeState) {
        if let Err(err) = self.ctx().state.transition(key, to) {
            tracing::error!(run_id = %self.ctx().run_id, error = %err, "node state out of sync");
        }
    }

    fn fail_run(&self, failure: RunFailure) -> RunStatus {
        tracing::error!(run_id = %self.ctx().run_id, failure = %failure, "run failed");
        self.run.progress.lock().failure = Some(failure);
        RunStatus::Failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::FnEventHandler;
    use crate::gateway::{BackoffConfig, GatewayError, MockGateway, MockReply};
    use crate::ledger::CallStatus;
    use crate::run_state::InvocationStatus;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};

    fn profile() -> Value {
        json!({
            "company_name": "Acme Analytics",
            "description": "Warehouse analytics for mid-size retailers",
            "products_services": ["Dashboards"],
            "value_propositions": ["Fewer stockouts"]
        })
    }

    fn segment(id: &str) -> Value {
        json!({
            "id": id,
            "name": format!("Segment {}", id),
            "description": "A buyer group",
            "goals": ["grow"],
            "challenges": ["churn"],
            "fit_score": 75
        })
    }

    fn segments(ids: &[&str]) -> Value {
        json!({ "segments": ids.iter().map(|id| segment(id)).collect::<Vec<_>>() })
    }

    fn canvas() -> Value {
        json!({
            "customer_jobs": [{"job": "forecast demand", "importance": 8}],
            "pains": [{"pain": "stockouts", "severity": 9}],
            "gains": [{"gain": "margin", "relevance": 7}],
            "pain_relievers": [{"reliever": "alerts", "addresses_pain": "stockouts", "relief_significance": 8}],
            "gain_creators": [{"creator": "reports", "addresses_gain": "margin"}],
            "fit_score": 82,
            "value_proposition_statement": "Never run out."
        })
    }

    fn taxonomy() -> Value {
        let pains = json!([{"pain": "p", "severity": 5}]);
        let forces = json!([{"force": "f", "intensity": 5}]);
        json!({
            "functional_pains": pains,
            "financial_pains": pains,
            "emotional_pains": pains,
            "forces_analysis": {"push": forces, "pull": forces, "habit": forces, "anxiety": forces},
            "pain_priority_ranking": [{"pain": "p", "priority_score": 90}],
            "messaging_implications": ["lead with uptime"]
        })
    }

    fn journey() -> Value {
        let stage = json!({
            "objective": "o",
            "key_questions": ["q"],
            "content_ideas": [{"title": "t"}],
            "preferred_channels": ["email"],
            "kpis": ["ctr"]
        });
        let mut doc = json!({"cross_stage_recommendations": ["r"]});
        for name in crate::research::JOURNEY_STAGES {
            doc[format!("{}_stage", name)] = stage.clone();
        }
        doc
    }

    fn happy_mock(ids: &[&str]) -> MockGateway {
        MockGateway::new()
            .with_usage(1_000, 500)
            .stage(StageId::Ingestion, vec![MockReply::json(&profile())])
            .stage(StageId::SegmentGeneration, vec![MockReply::json(&segments(ids))])
            .stage(StageId::ValueMapping, vec![MockReply::json(&canvas())])
            .stage(StageId::PainTaxonomy, vec![MockReply::json(&taxonomy())])
            .stage(StageId::JourneyMapping, vec![MockReply::json(&journey())])
    }

    fn scheduler(mock: Arc<MockGateway>, max_in_flight: usize) -> Scheduler {
        Scheduler::research(mock).with_settings(
            SchedulerSettings::default()
                .max_in_flight(max_in_flight)
                .retry(RetryPolicy::default().with_backoff(BackoffConfig::none())),
        )
    }

    fn request() -> PipelineRequest {
        PipelineRequest::builder("Acme Analytics")
            .website("https://acme.example")
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_full_run_with_one_failing_entity() {
        let mock = Arc::new(
            happy_mock(&["a", "b", "c"])
                .entity(StageId::PainTaxonomy, "b", vec![MockReply::text(r#"{"functional_pains": []}"#)]),
        );
        let result = scheduler(mock.clone(), 4).run(request()).await.unwrap();

        assert_eq!(result.status, RunStatus::Completed);
        assert!(result.is_partial());
        assert_eq!(result.entity_status.len(), 3);
        assert_eq!(result.entity_status[&EntityId::new("a")], EntityOutcome::Succeeded);
        assert_eq!(result.entity_status[&EntityId::new("c")], EntityOutcome::Succeeded);
        match &result.entity_status[&EntityId::new("b")] {
            EntityOutcome::Failed { stage, kind, attempts, .. } => {
                assert_eq!(*stage, StageId::PainTaxonomy);
                assert_eq!(*kind, StageErrorKind::Exhausted);
                assert_eq!(*attempts, 2);
            }
            other => panic!("unexpected outcome {:?}", other),
        }

        // b never reaches the journey stage.
        assert!(result.artifact(StageId::JourneyMapping, Some("b")).is_none());
        assert!(mock.calls_for(StageId::JourneyMapping, Some("b")).is_empty());
        assert!(result.artifact(StageId::JourneyMapping, Some("a")).is_some());

        // 2 run-level + 3 value maps + 2 good taxonomies + 2 bad + 2 journeys.
        assert_eq!(result.usage.calls, 11);
        assert_eq!(result.usage_records.len(), mock.call_count());
        assert_eq!(result.artifacts.len(), 2 + 3 + 2 + 2);
        assert!(result.failure.is_none());
    }

    #[tokio::test]
    async fn test_rate_limited_stage_records_each_attempt() {
        let mock = Arc::new(happy_mock(&["a", "b"]).stage(
            StageId::Ingestion,
            vec![
                MockReply::error(GatewayError::rate_limited("429", None)),
                MockReply::error(GatewayError::rate_limited("429", None)),
                MockReply::json(&profile()),
            ],
        ));
        let result = scheduler(mock.clone(), 4).run(request()).await.unwrap();

        assert_eq!(result.status, RunStatus::Completed);
        let ingestion: Vec<_> = result
            .usage_records
            .iter()
            .filter(|r| r.stage == StageId::Ingestion)
            .collect();
        assert_eq!(ingestion.len(), 3);
        assert_eq!(
            ingestion.iter().map(|r| r.status).collect::<Vec<_>>(),
            vec![CallStatus::Error, CallStatus::Error, CallStatus::Success]
        );
        assert_eq!(
            result.artifact(StageId::Ingestion, None).unwrap().diagnostics.transport_retries,
            2
        );
    }

    #[tokio::test]
    async fn test_empty_fan_out_fails_run() {
        let mock = Arc::new(happy_mock(&[]));
        let result = scheduler(mock.clone(), 4).run(request()).await.unwrap();

        assert_eq!(result.status, RunStatus::Failed);
        assert!(matches!(result.failure, Some(RunFailure::NoEntities { .. })));
        assert!(result.entity_status.is_empty());
        assert_eq!(mock.call_count(), 2);
        assert!(mock.calls_for(StageId::ValueMapping, None).is_empty());
    }

    #[tokio::test]
    async fn test_run_level_failure_skips_everything_downstream() {
        let mock = Arc::new(
            happy_mock(&["a"]).stage(StageId::Ingestion, vec![MockReply::error(GatewayError::auth("bad key"))]),
        );
        let sched = scheduler(mock.clone(), 4);
        let handle = sched.start(request()).unwrap();
        let run_id = handle.run_id();
        let result = handle.wait().await.unwrap();

        assert_eq!(result.status, RunStatus::Failed);
        match result.failure {
            Some(RunFailure::StageFailed { stage, kind, attempts, .. }) => {
                assert_eq!(stage, StageId::Ingestion);
                assert_eq!(kind, StageErrorKind::Fatal);
                assert_eq!(attempts, 1);
            }
            other => panic!("unexpected failure {:?}", other),
        }
        assert_eq!(mock.call_count(), 1);

        let snapshot = sched.status(run_id).unwrap();
        assert_eq!(snapshot.count(NodeState::Failed), 1);
        assert_eq!(snapshot.count(NodeState::Skipped), 1);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let mock = Arc::new(
            happy_mock(&["a", "b", "c", "d", "e"]).with_latency(Duration::from_millis(15)),
        );
        let request = PipelineRequest::builder("Acme").segments(5).build().unwrap();
        let sched = scheduler(mock.clone(), 2);
        let result = sched.run(request).await.unwrap();

        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.succeeded_entities().count(), 5);
        assert!(mock.peak_in_flight() <= 2, "peak was {}", mock.peak_in_flight());
        assert_eq!(sched.gate().peak(), 2);
        assert_eq!(sched.gate().in_flight(), 0);
    }

    #[tokio::test]
    async fn test_downstream_starts_after_upstream_finishes() {
        let mock = Arc::new(happy_mock(&["a", "b", "c"]));
        let result = scheduler(mock, 3).run(request()).await.unwrap();

        let finished = |stage: StageId, entity: Option<&str>| {
            result
                .invocations
                .iter()
                .filter(|i| i.stage == stage && i.entity.as_ref().map(|e| e.as_str()) == entity)
                .filter(|i| i.status == InvocationStatus::Succeeded)
                .map(|i| i.finished_seq.unwrap())
                .max()
                .unwrap()
        };
        let first_start = |stage: StageId, entity: Option<&str>| {
            result
                .invocations
                .iter()
                .filter(|i| i.stage == stage && i.entity.as_ref().map(|e| e.as_str()) == entity)
                .map(|i| i.started_seq)
                .min()
                .unwrap()
        };

        let segments_done = finished(StageId::SegmentGeneration, None);
        for id in ["a", "b", "c"] {
            let e = Some(id);
            assert!(first_start(StageId::ValueMapping, e) > segments_done);
            assert!(first_start(StageId::PainTaxonomy, e) > finished(StageId::ValueMapping, e));
            assert!(first_start(StageId::JourneyMapping, e) > finished(StageId::PainTaxonomy, e));
        }
    }

    #[tokio::test]
    async fn test_cancel_stops_new_work() {
        let mock = Arc::new(happy_mock(&["a", "b", "c"]).with_latency(Duration::from_millis(30)));
        let sched = scheduler(mock.clone(), 4);
        let handle = sched.start(request()).unwrap();
        let run_id = handle.run_id();

        // Wait until the fan-out happened, then cancel.
        loop {
            let snapshot = sched.status(run_id).unwrap();
            if !snapshot.entities.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        sched.cancel(run_id).unwrap();
        let result = handle.wait().await.unwrap();

        assert_eq!(result.status, RunStatus::Cancelled);
        assert_eq!(result.entity_status.len(), 3);
        assert!(result.entity_status.values().all(|o| matches!(
            o,
            EntityOutcome::Failed { kind: StageErrorKind::Cancelled, .. }
        )));
        // Only calls already in flight at cancel time completed.
        assert!(mock.calls_for(StageId::JourneyMapping, Some("a")).is_empty());
        assert_eq!(result.usage_records.len(), mock.call_count());
    }

    #[tokio::test]
    async fn test_cancel_during_long_retry_after_ends_promptly() {
        let mock = Arc::new(happy_mock(&["a"]).stage(
            StageId::Ingestion,
            vec![
                MockReply::error(GatewayError::rate_limited("429", Some(Duration::from_secs(3)))),
                MockReply::json(&profile()),
            ],
        ));
        let sched = Scheduler::research(mock.clone()).with_settings(
            SchedulerSettings::default().retry(RetryPolicy::default().with_backoff(BackoffConfig::standard())),
        );
        let handle = sched.start(request()).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let cancelled_at = std::time::Instant::now();
        handle.cancel();
        let result = tokio::time::timeout(Duration::from_secs(1), handle.wait())
            .await
            .expect("run should end soon after cancel")
            .unwrap();

        assert!(cancelled_at.elapsed() < Duration::from_secs(1));
        assert_eq!(result.status, RunStatus::Cancelled);
        assert_eq!(mock.call_count(), 1);
        assert_eq!(result.usage_records.len(), 1);
        assert!(result.artifacts.is_empty());
    }

    #[tokio::test]
    async fn test_events_follow_run() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler = Arc::new(FnEventHandler(move |event: RunEvent| {
            let tag = match event {
                RunEvent::RunStarted { .. } => "run_started",
                RunEvent::EntitiesDiscovered { .. } => "entities",
                RunEvent::RunFinished { .. } => "run_finished",
                _ => return,
            };
            sink.lock().push(tag);
        }));
        let mock = Arc::new(happy_mock(&["a", "b"]));
        let result = scheduler(mock, 4)
            .with_event_handler(handler)
            .run(request())
            .await
            .unwrap();

        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(*seen.lock(), vec!["run_started", "entities", "run_finished"]);
    }

    #[tokio::test]
    async fn test_model_override_reaches_gateway() {
        let mock = Arc::new(happy_mock(&["a", "b"]));
        let request = PipelineRequest::builder("Acme")
            .model(StageId::JourneyMapping, "openai/gpt-4.1")
            .build()
            .unwrap();
        let result = scheduler(mock.clone(), 4).run(request).await.unwrap();

        assert_eq!(result.status, RunStatus::Completed);
        assert!(mock
            .calls_for(StageId::JourneyMapping, Some("a"))
            .iter()
            .all(|c| c.model == "openai/gpt-4.1"));
        assert_eq!(
            result.artifact(StageId::JourneyMapping, Some("a")).unwrap().model,
            "openai/gpt-4.1"
        );
    }

    #[tokio::test]
    async fn test_unknown_run_is_an_error() {
        let sched = scheduler(Arc::new(MockGateway::new()), 1);
        let missing = RunId::new();
        assert!(matches!(sched.status(missing), Err(PipelineError::UnknownRun(_))));
        assert!(matches!(sched.cancel(missing), Err(PipelineError::UnknownRun(_))));
    }

    #[tokio::test]
    async fn test_forget_finished_run() {
        let sched = scheduler(Arc::new(happy_mock(&["a", "b"])), 4);
        let handle = sched.start(request()).unwrap();
        let run_id = handle.run_id();
        handle.wait().await.unwrap();

        assert_eq!(sched.runs(), vec![run_id]);
        sched.forget(run_id).unwrap();
        assert!(sched.runs().is_empty());
    }
}
