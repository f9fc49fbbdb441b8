//! In-memory state of one run.
//!
//! Holds the artifacts, the per-(stage, entity) node state machine, and the
//! invocation log. Writes are serialized behind short locks; artifacts are
//! immutable once stored and handed out as `Arc`s, so readers never block
//! writers for longer than a map lookup.

use crate::diagnostics::ExecutionDiagnostics;
use crate::schema::ValidationError;
use crate::stage::StageId;
use crate::types::EntityId;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Address of an artifact or a node: a stage, optionally for one entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeKey {
    pub stage: StageId,
    pub entity: Option<EntityId>,
}

impl NodeKey {
    pub fn new(stage: StageId, entity: Option<EntityId>) -> Self {
        Self { stage, entity }
    }

    pub fn run(stage: StageId) -> Self {
        Self::new(stage, None)
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.entity {
            Some(e) => write!(f, "{}[{}]", self.stage, e),
            None => write!(f, "{}", self.stage),
        }
    }
}

/// Validated output of a successful stage invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub stage: StageId,
    pub entity: Option<EntityId>,
    pub value: Value,
    pub model: String,
    /// The invocation that produced this artifact.
    pub invocation_id: Uuid,
    pub diagnostics: ExecutionDiagnostics,
    pub created_at: DateTime<Utc>,
}

impl Artifact {
    pub fn key(&self) -> NodeKey {
        NodeKey::new(self.stage, self.entity.clone())
    }
}

/// Lifecycle of one (stage, entity) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Pending,
    Running,
    Succeeded,
    Failed,
    /// Never started: an upstream stage failed or the run was cancelled.
    Skipped,
}

impl NodeState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeState::Succeeded | NodeState::Failed | NodeState::Skipped)
    }

    fn can_become(self, next: NodeState) -> bool {
        matches!(
            (self, next),
            (NodeState::Pending, NodeState::Running)
                | (NodeState::Pending, NodeState::Skipped)
                | (NodeState::Running, NodeState::Succeeded)
                | (NodeState::Running, NodeState::Failed)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationStatus {
    /// Not dispatched yet. [`RunState::begin_invocation`] opens entries
    /// directly as `Running` since it is called once a gateway slot is held.
    Pending,
    Running,
    Succeeded,
    FailedRetryable,
    FailedFatal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ValidationOutcome {
    /// No response text to validate (transport failure).
    NotChecked,
    Valid { repaired: bool },
    Invalid { error: ValidationError },
}

/// One gateway attempt of a stage for a run and optional entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageInvocation {
    pub id: Uuid,
    pub stage: StageId,
    pub entity: Option<EntityId>,
    pub attempt: u32,
    pub model: String,
    pub status: InvocationStatus,
    pub raw_response: Option<String>,
    pub validation: ValidationOutcome,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Run-wide logical clock readings, for ordering checks that must not
    /// depend on wall-clock resolution.
    pub started_seq: u64,
    pub finished_seq: Option<u64>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RunStateError {
    #[error("artifact for {0} already stored")]
    DuplicateArtifact(NodeKey),

    #[error("node {key} cannot go from {from:?} to {to:?}")]
    IllegalTransition {
        key: NodeKey,
        from: NodeState,
        to: NodeState,
    },

    #[error("unknown node {0}")]
    UnknownNode(NodeKey),

    #[error("unknown invocation {0}")]
    UnknownInvocation(Uuid),
}

#[derive(Debug, Default)]
pub struct RunState {
    artifacts: RwLock<HashMap<NodeKey, Arc<Artifact>>>,
    nodes: Mutex<BTreeMap<NodeKey, NodeState>>,
    invocations: Mutex<Vec<StageInvocation>>,
    clock: AtomicU64,
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::SeqCst) + 1
    }

    // ── artifacts ──

    pub fn artifact(&self, key: &NodeKey) -> Option<Arc<Artifact>> {
        self.artifacts.read().get(key).cloned()
    }

    pub fn has_artifact(&self, key: &NodeKey) -> bool {
        self.artifacts.read().contains_key(key)
    }

    /// All artifacts, ordered by key.
    pub fn artifacts(&self) -> Vec<Arc<Artifact>> {
        let mut all: Vec<Arc<Artifact>> = self.artifacts.read().values().cloned().collect();
        all.sort_by_key(|a| a.key());
        all
    }

    fn insert_artifact(&self, artifact: Artifact) -> Result<Arc<Artifact>, RunStateError> {
        let key = artifact.key();
        let mut map = self.artifacts.write();
        if map.contains_key(&key) {
            return Err(RunStateError::DuplicateArtifact(key));
        }
        let artifact = Arc::new(artifact);
        map.insert(key, artifact.clone());
        Ok(artifact)
    }

    // ── nodes ──

    pub fn register_node(&self, key: NodeKey) {
        self.nodes.lock().entry(key).or_insert(NodeState::Pending);
    }

    pub fn transition(&self, key: &NodeKey, to: NodeState) -> Result<(), RunStateError> {
        let mut nodes = self.nodes.lock();
        let state = nodes
            .get_mut(key)
            .ok_or_else(|| RunStateError::UnknownNode(key.clone()))?;
        if !state.can_become(to) {
            return Err(RunStateError::IllegalTransition {
                key: key.clone(),
                from: *state,
                to,
            });
        }
        *state = to;
        Ok(())
    }

    /// Mark every still-pending node matching `filter` as skipped.
    pub fn skip_pending(&self, filter: impl Fn(&NodeKey) -> bool) -> usize {
        let mut nodes = self.nodes.lock();
        let mut skipped = 0;
        for (key, state) in nodes.iter_mut() {
            if *state == NodeState::Pending && filter(key) {
                *state = NodeState::Skipped;
                skipped += 1;
            }
        }
        skipped
    }

    pub fn node_state(&self, key: &NodeKey) -> Option<NodeState> {
        self.nodes.lock().get(key).copied()
    }

    pub fn nodes(&self) -> BTreeMap<NodeKey, NodeState> {
        self.nodes.lock().clone()
    }

    // ── invocation log ──

    /// Open a new invocation in `Running` state and return its id.
    pub fn begin_invocation(
        &self,
        stage: StageId,
        entity: Option<EntityId>,
        attempt: u32,
        model: &str,
    ) -> Uuid {
        let id = Uuid::new_v4();
        let invocation = StageInvocation {
            id,
            stage,
            entity,
            attempt,
            model: model.to_string(),
            status: InvocationStatus::Running,
            raw_response: None,
            validation: ValidationOutcome::NotChecked,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
            started_seq: self.tick(),
            finished_seq: None,
        };
        self.invocations.lock().push(invocation);
        id
    }

    /// Close an invocation that did not produce an artifact.
    pub fn fail_invocation(
        &self,
        id: Uuid,
        retryable: bool,
        raw_response: Option<String>,
        validation: ValidationOutcome,
        error: String,
    ) -> Result<(), RunStateError> {
        let status = if retryable {
            InvocationStatus::FailedRetryable
        } else {
            InvocationStatus::FailedFatal
        };
        self.close_invocation(id, status, raw_response, validation, Some(error))
    }

    /// Close an invocation as succeeded and store its artifact.
    pub fn complete_invocation(
        &self,
        id: Uuid,
        raw_response: String,
        artifact: Artifact,
    ) -> Result<Arc<Artifact>, RunStateError> {
        let stored = self.insert_artifact(artifact)?;
        let validation = ValidationOutcome::Valid {
            repaired: stored.diagnostics.repaired_json,
        };
        self.close_invocation(id, InvocationStatus::Succeeded, Some(raw_response), validation, None)?;
        Ok(stored)
    }

    fn close_invocation(
        &self,
        id: Uuid,
        status: InvocationStatus,
        raw_response: Option<String>,
        validation: ValidationOutcome,
        error: Option<String>,
    ) -> Result<(), RunStateError> {
        let seq = self.tick();
        let mut log = self.invocations.lock();
        let inv = log
            .iter_mut()
            .rev()
            .find(|i| i.id == id)
            .ok_or(RunStateError::UnknownInvocation(id))?;
        inv.status = status;
        inv.raw_response = raw_response;
        inv.validation = validation;
        inv.error = error;
        inv.finished_at = Some(Utc::now());
        inv.finished_seq = Some(seq);
        Ok(())
    }

    /// The invocation log in start order.
    pub fn invocations(&self) -> Vec<StageInvocation> {
        self.invocations.lock().clone()
    }

    pub fn invocations_for(&self, key: &NodeKey) -> Vec<StageInvocation> {
        self.invocations
            .lock()
            .iter()
            .filter(|i| i.stage == key.stage && i.entity == key.entity)
            .cloned()
            .collect()
    }
}
