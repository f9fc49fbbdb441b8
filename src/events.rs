//! Progress events for run observers.
//!
//! Provides an optional, non-intrusive way to watch a run: the scheduler
//! and executor emit [`RunEvent`]s as stages start, retry, and finish.
//! Implement [`EventHandler`] to drive a progress display or an audit log.
//! Handlers are called inline from the run's tasks, so they should return
//! quickly.

use crate::error::StageErrorKind;
use crate::stage::StageId;
use crate::types::{EntityId, RunId};
use std::sync::Arc;
use std::time::Duration;

/// Events emitted during a run.
#[derive(Debug, Clone)]
pub enum RunEvent {
    RunStarted {
        run_id: RunId,
        business_name: String,
    },
    /// A stage invocation is about to make its first gateway call.
    StageStarted {
        run_id: RunId,
        stage: StageId,
        entity: Option<EntityId>,
    },
    /// A retryable transport failure; the next attempt follows `delay`.
    TransportRetry {
        run_id: RunId,
        stage: StageId,
        entity: Option<EntityId>,
        attempt: u32,
        delay: Duration,
        reason: String,
    },
    /// The answer failed validation and a repair call follows.
    RepairRequested {
        run_id: RunId,
        stage: StageId,
        entity: Option<EntityId>,
        attempt: u32,
        reason: String,
    },
    StageSucceeded {
        run_id: RunId,
        stage: StageId,
        entity: Option<EntityId>,
        attempts: u32,
    },
    StageFailed {
        run_id: RunId,
        stage: StageId,
        entity: Option<EntityId>,
        kind: StageErrorKind,
        reason: String,
    },
    /// The fan-out stage produced its entities.
    EntitiesDiscovered {
        run_id: RunId,
        entities: Vec<(EntityId, String)>,
    },
    /// An entity chain reached a terminal state.
    EntityFinished {
        run_id: RunId,
        entity: EntityId,
        ok: bool,
    },
    RunFinished {
        run_id: RunId,
        status: crate::result::RunStatus,
        elapsed: Duration,
    },
}

/// Handler for run events.
///
/// # Example
///
/// ```
/// use resonance_pipeline::events::{EventHandler, RunEvent};
///
/// struct PrintHandler;
///
/// impl EventHandler for PrintHandler {
///     fn on_event(&self, event: RunEvent) {
///         match event {
///             RunEvent::StageSucceeded { stage, entity, .. } => {
///                 println!("[done] {} {:?}", stage, entity)
///             }
///             RunEvent::StageFailed { stage, reason, .. } => println!("[fail] {}: {}", stage, reason),
///             _ => {}
///         }
///     }
/// }
/// ```
pub trait EventHandler: Send + Sync {
    fn on_event(&self, event: RunEvent);
}

/// Emit an event if a handler is present. No-op otherwise.
pub(crate) fn emit(handler: &Option<Arc<dyn EventHandler>>, event: RunEvent) {
    if let Some(ref h) = handler {
        h.on_event(event);
    }
}

/// An [`EventHandler`] backed by a closure.
///
/// # Example
///
/// ```
/// use resonance_pipeline::events::{FnEventHandler, RunEvent};
/// use std::sync::Arc;
///
/// let handler = Arc::new(FnEventHandler(|event: RunEvent| {
///     if let RunEvent::EntitiesDiscovered { entities, .. } = event {
///         println!("{} segments", entities.len());
///     }
/// }));
/// ```
pub struct FnEventHandler<F: Fn(RunEvent) + Send + Sync>(pub F);

impl<F: Fn(RunEvent) + Send + Sync> EventHandler for FnEventHandler<F> {
    fn on_event(&self, event: RunEvent) {
        (self.0)(event);
    }
}
