//! # Resonance Pipeline
//!
//! Orchestrates staged AI research runs: a company profile, a set of
//! customer segments, and per-segment value, pain, and journey analyses.
//!
//! Every stage is a model call whose answer must match a declared shape.
//! The crate handles the parts that make that reliable and affordable:
//! prompt rendering from upstream artifacts, lenient JSON extraction,
//! schema validation with one repair round, transport retries with
//! backoff, a global bound on in-flight calls, and a cost ledger that
//! records every attempt.
//!
//! ## Core Concepts
//!
//! - **[`StageConfig`]**: the static stage graph of run-level stages, one
//!   fan-out stage, and a per-entity chain.
//! - **[`ModelGateway`]**: provider-agnostic model calls.
//!   [`OpenRouterGateway`] talks HTTP; [`MockGateway`] answers from a script.
//! - **[`StageExecutor`]**: one stage invocation under the attempt budget.
//! - **[`Scheduler`]**: starts, tracks, and cancels runs.
//! - **[`CostLedger`]**: append-only usage records priced in integer
//!   nanodollars.
//! - **[`RunResult`]**: artifacts, per-entity outcomes, and usage of a
//!   finished run.
//!
//! ## Quick Start
//!
//! ```no_run
//! use resonance_pipeline::{OpenRouterGateway, PipelineRequest, Scheduler, StageId};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let gateway = Arc::new(OpenRouterGateway::from_env()?);
//!     let scheduler = Scheduler::research(gateway);
//!
//!     let request = PipelineRequest::builder("Acme Analytics")
//!         .website("https://acme.example")
//!         .industry("Retail analytics")
//!         .segments(3)
//!         .build()?;
//!
//!     let result = scheduler.run(request).await?;
//!     for id in result.succeeded_entities() {
//!         let journey = result.artifact(StageId::JourneyMapping, Some(id.as_str()));
//!         println!("{}: {}", id, journey.is_some());
//!     }
//!     println!("total ${:.4}", result.usage.total_cost_usd());
//!     Ok(())
//! }
//! ```

pub mod diagnostics;
pub mod error;
pub mod events;
pub mod exec_ctx;
pub mod executor;
pub mod gateway;
pub mod ledger;
pub mod pricing;
pub mod prompt;
pub mod research;
pub mod result;
pub mod retry;
pub mod run_state;
pub mod scheduler;
pub mod schema;
pub mod stage;
pub mod types;

pub use diagnostics::ExecutionDiagnostics;
pub use error::{PipelineError, Result, StageError, StageErrorKind};
pub use events::{EventHandler, FnEventHandler, RunEvent};
pub use exec_ctx::{CallGate, ExecutionContext};
pub use executor::{StageExecutor, StageInputs};
pub use gateway::{
    BackoffConfig, GatewayError, GatewayRequest, GatewayResponse, MockGateway, MockReply,
    ModelGateway, OpenRouterGateway, TokenUsage,
};
pub use ledger::{CostLedger, LedgerSnapshot, UsageRecord};
pub use pricing::{ModelPricing, PriceTable};
pub use result::{EntityOutcome, JsonReport, ReportCompiler, RunFailure, RunResult, RunSnapshot, RunStatus};
pub use retry::RetryPolicy;
pub use run_state::{Artifact, NodeKey, NodeState};
pub use scheduler::{RunHandle, Scheduler, SchedulerSettings};
pub use schema::{Shape, ValidationError};
pub use stage::{StageConfig, StageDefinition, StageId};
pub use types::{Entity, EntityBounds, EntityId, PipelineRequest, RunId};
