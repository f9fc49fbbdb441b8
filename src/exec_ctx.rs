//! Execution context shared by every stage invocation of a run.
//!
//! [`ExecutionContext`] carries the model gateway, the cost ledger, the
//! run's state store, the global call gate, the attempt budget, the
//! cancellation flag, and the optional event handler. It is built once per
//! run and shared across all entity chains.

use crate::events::EventHandler;
use crate::gateway::ModelGateway;
use crate::ledger::CostLedger;
use crate::pricing::PriceTable;
use crate::retry::RetryPolicy;
use crate::run_state::RunState;
use crate::types::RunId;
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};

/// Bounds the number of gateway calls in flight at once.
///
/// Clones share the same permits, so one gate handed to several runs caps
/// their combined concurrency.
#[derive(Debug, Clone)]
pub struct CallGate {
    semaphore: Arc<Semaphore>,
    limit: usize,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl CallGate {
    /// A gate admitting at most `limit` concurrent calls (at least one).
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            limit,
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Wait for a free slot. `None` once the gate has been closed.
    pub async fn acquire(&self) -> Option<GatePermit> {
        let permit = self.semaphore.clone().acquire_owned().await.ok()?;
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        Some(GatePermit {
            _permit: permit,
            in_flight: self.in_flight.clone(),
        })
    }

    /// Stop admitting calls. Waiters wake up with `None`.
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous calls observed.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// A held slot. Released on drop.
#[derive(Debug)]
pub struct GatePermit {
    _permit: OwnedSemaphorePermit,
    in_flight: Arc<AtomicUsize>,
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Shared execution context for stage invocations.
///
/// # Example
///
/// ```
/// use resonance_pipeline::exec_ctx::ExecutionContext;
/// use resonance_pipeline::gateway::MockGateway;
/// use resonance_pipeline::retry::RetryPolicy;
/// use std::sync::Arc;
///
/// let ctx = ExecutionContext::builder(Arc::new(MockGateway::new()))
///     .retry(RetryPolicy::new(2))
///     .max_in_flight(2)
///     .build();
/// assert_eq!(ctx.gate.limit(), 2);
/// ```
pub struct ExecutionContext {
    pub run_id: RunId,
    pub gateway: Arc<dyn ModelGateway>,
    pub ledger: Arc<CostLedger>,
    pub state: Arc<RunState>,
    pub gate: CallGate,
    pub retry: RetryPolicy,
    /// Checked before every new gateway call and before every backoff sleep.
    pub cancellation: Arc<AtomicBool>,
    pub event_handler: Option<Arc<dyn EventHandler>>,
    cancel_signal: Arc<Notify>,
}

impl ExecutionContext {
    pub fn builder(gateway: Arc<dyn ModelGateway>) -> ExecutionContextBuilder {
        ExecutionContextBuilder {
            run_id: None,
            gateway,
            ledger: None,
            state: None,
            gate: None,
            retry: None,
            cancellation: None,
            event_handler: None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.load(Ordering::SeqCst)
    }

    /// Set the flag and wake every task parked in [`cancelled`](Self::cancelled).
    pub fn cancel(&self) {
        self.cancellation.store(true, Ordering::SeqCst);
        self.cancel_signal.notify_waiters();
    }

    /// Resolves once [`cancel`](Self::cancel) has been called. A flag set
    /// directly through a shared [`AtomicBool`] is only seen here if it was
    /// already set when this was polled.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.cancel_signal.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("run_id", &self.run_id)
            .field("gateway", &self.gateway.name())
            .field("gate", &self.gate)
            .field("retry", &self.retry)
            .field("cancelled", &self.is_cancelled())
            .field("has_event_handler", &self.event_handler.is_some())
            .finish()
    }
}

/// Builder for [`ExecutionContext`].
pub struct ExecutionContextBuilder {
    run_id: Option<RunId>,
    gateway: Arc<dyn ModelGateway>,
    ledger: Option<Arc<CostLedger>>,
    state: Option<Arc<RunState>>,
    gate: Option<CallGate>,
    retry: Option<RetryPolicy>,
    cancellation: Option<Arc<AtomicBool>>,
    event_handler: Option<Arc<dyn EventHandler>>,
}

impl ExecutionContextBuilder {
    pub fn run_id(mut self, run_id: RunId) -> Self {
        self.run_id = Some(run_id);
        self
    }

    /// Default: a ledger with the built-in research price table.
    pub fn ledger(mut self, ledger: Arc<CostLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn state(mut self, state: Arc<RunState>) -> Self {
        self.state = Some(state);
        self
    }

    /// Share an existing gate. Overrides [`max_in_flight`](Self::max_in_flight).
    pub fn gate(mut self, gate: CallGate) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Create a private gate with this limit. Default: 4.
    pub fn max_in_flight(mut self, limit: usize) -> Self {
        self.gate = Some(CallGate::new(limit));
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn cancellation(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancellation = Some(flag);
        self
    }

    pub fn event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.event_handler = Some(handler);
        self
    }

    pub fn build(self) -> ExecutionContext {
        ExecutionContext {
            run_id: self.run_id.unwrap_or_default(),
            gateway: self.gateway,
            ledger: self
                .ledger
                .unwrap_or_else(|| Arc::new(CostLedger::new(PriceTable::research_defaults()))),
            state: self.state.unwrap_or_default(),
            gate: self.gate.unwrap_or_else(|| CallGate::new(4)),
            retry: self.retry.unwrap_or_default(),
            cancellation: self.cancellation.unwrap_or_default(),
            event_handler: self.event_handler,
            cancel_signal: Arc::new(Notify::new()),
        }
    }
}
