//! Run outcomes: the final [`RunResult`], live [`RunSnapshot`]s, and the
//! [`ReportCompiler`] seam for turning results into documents.

use crate::error::StageErrorKind;
use crate::ledger::{LedgerSnapshot, UsageRecord};
use crate::run_state::{Artifact, NodeKey, NodeState, StageInvocation};
use crate::stage::StageId;
use crate::types::{Entity, EntityId, PipelineRequest, RunId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    /// All run-level stages succeeded and every entity chain reached a
    /// terminal state. Some entities may still have failed.
    Completed,
    /// A run-level stage failed or the run could not fan out.
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Why a run as a whole failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunFailure {
    /// A run-level stage failed; nothing downstream can run.
    StageFailed {
        stage: StageId,
        kind: StageErrorKind,
        attempts: u32,
        reason: String,
    },
    /// The fan-out stage produced no usable entities.
    NoEntities { warnings: Vec<String> },
    /// A stage was ready to run but an upstream artifact was absent.
    MissingArtifact { stage: StageId, missing: NodeKey },
}

impl fmt::Display for RunFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunFailure::StageFailed {
                stage,
                kind,
                attempts,
                reason,
            } => write!(f, "stage {} {} after {} attempt(s): {}", stage, kind, attempts, reason),
            RunFailure::NoEntities { .. } => f.write_str("fan-out produced no entities"),
            RunFailure::MissingArtifact { stage, missing } => {
                write!(f, "stage {} is missing upstream artifact {}", stage, missing)
            }
        }
    }
}

/// Terminal state of one entity chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EntityOutcome {
    Succeeded,
    Failed {
        stage: StageId,
        kind: StageErrorKind,
        attempts: u32,
        reason: String,
    },
}

impl EntityOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, EntityOutcome::Succeeded)
    }
}

/// Everything a finished run produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: RunId,
    pub request: PipelineRequest,
    pub status: RunStatus,
    pub failure: Option<RunFailure>,
    /// Entities in fan-out order.
    pub entities: Vec<Entity>,
    /// Exactly one terminal outcome per entity.
    pub entity_status: BTreeMap<EntityId, EntityOutcome>,
    /// Ordered by (stage, entity).
    pub artifacts: Vec<Artifact>,
    pub usage: LedgerSnapshot,
    /// Ordered by (stage, entity, attempt).
    pub usage_records: Vec<UsageRecord>,
    /// Ordered by (stage, entity, attempt).
    pub invocations: Vec<StageInvocation>,
    pub warnings: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunResult {
    /// The artifact for `stage`, for one entity or at run level.
    pub fn artifact(&self, stage: StageId, entity: Option<&str>) -> Option<&Artifact> {
        self.artifacts
            .iter()
            .find(|a| a.stage == stage && a.entity.as_ref().map(|e| e.as_str()) == entity)
    }

    pub fn succeeded_entities(&self) -> impl Iterator<Item = &EntityId> {
        self.entity_status
            .iter()
            .filter(|(_, o)| o.is_success())
            .map(|(id, _)| id)
    }

    pub fn failed_entities(&self) -> impl Iterator<Item = (&EntityId, &EntityOutcome)> {
        self.entity_status.iter().filter(|(_, o)| !o.is_success())
    }

    /// Completed with at least one failed entity.
    pub fn is_partial(&self) -> bool {
        self.status == RunStatus::Completed && self.failed_entities().next().is_some()
    }

    pub fn elapsed(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }

    /// Serialize the whole result.
    pub fn to_json(&self) -> serde_json::Result<Value> {
        serde_json::to_value(self)
    }
}

/// Live view of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run_id: RunId,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub nodes: Vec<NodeSnapshot>,
    pub entities: Vec<EntityId>,
    pub entity_status: BTreeMap<EntityId, EntityOutcome>,
    /// Gateway calls in flight across every run sharing the call gate.
    pub calls_in_flight: usize,
    pub usage: LedgerSnapshot,
}

impl RunSnapshot {
    pub fn count(&self, state: NodeState) -> usize {
        self.nodes.iter().filter(|n| n.state == state).count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub stage: StageId,
    pub entity: Option<EntityId>,
    pub state: NodeState,
}

/// Turns a finished run into a deliverable. Formatting and export live
/// behind this trait; the pipeline only hands over the result.
pub trait ReportCompiler {
    type Output;

    fn compile(&self, result: &RunResult) -> anyhow::Result<Self::Output>;
}

/// Compiles a completed or cancelled run into a compact JSON report: the
/// company profile, one section per succeeded entity, failures, and costs.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonReport;

impl ReportCompiler for JsonReport {
    type Output = Value;

    fn compile(&self, result: &RunResult) -> anyhow::Result<Value> {
        // A cancelled run keeps every segment that finished; the rest are
        // listed as failures.
        if !matches!(result.status, RunStatus::Completed | RunStatus::Cancelled) {
            anyhow::bail!(
                "run {} is {}; only completed or cancelled runs can be compiled",
                result.run_id,
                result.status
            );
        }

        let mut segments = Vec::new();
        for entity in &result.entities {
            if !result.entity_status.get(&entity.id).is_some_and(EntityOutcome::is_success) {
                continue;
            }
            let mut section = json!({ "id": entity.id, "name": entity.name, "profile": entity.profile });
            for artifact in result
                .artifacts
                .iter()
                .filter(|a| a.entity.as_ref() == Some(&entity.id))
            {
                section[artifact.stage.as_str()] = artifact.value.clone();
            }
            segments.push(section);
        }

        let failures: Vec<Value> = result
            .failed_entities()
            .map(|(id, outcome)| json!({ "entity": id, "outcome": outcome }))
            .collect();

        Ok(json!({
            "run_id": result.run_id,
            "business_name": result.request.business_name,
            "status": result.status,
            "company_profile": result.artifact(StageId::Ingestion, None).map(|a| &a.value),
            "segments": segments,
            "failed_segments": failures,
            "warnings": result.warnings,
            "cost_usd": result.usage.total_cost_usd(),
            "uncosted_calls": result.usage.uncosted_calls,
        }))
    }
}
