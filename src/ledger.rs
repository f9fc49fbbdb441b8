//! Append-only cost ledger.
//!
//! One [`CostLedger`] is created per run and handed to every stage
//! execution of that run, so concurrent runs never share accounting. Every
//! gateway attempt, successful or not, appends exactly one [`UsageRecord`].
//! Writers hold the lock only for a `Vec::push`; snapshots copy out under
//! the same lock and aggregate outside it.

use crate::gateway::TokenUsage;
use crate::pricing::PriceTable;
use crate::stage::StageId;
use crate::types::{EntityId, RunId};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Success,
    Error,
}

/// One gateway call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub id: Uuid,
    pub run_id: RunId,
    pub stage: StageId,
    pub entity: Option<EntityId>,
    /// 1-based attempt within the stage invocation.
    pub attempt: u32,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// `None` when the model has no entry in the price table.
    pub cost_nanodollars: Option<i64>,
    pub status: CallStatus,
    pub error: Option<String>,
    pub latency_ms: u64,
    pub timestamp: DateTime<Utc>,
}

impl UsageRecord {
    /// A successful call. Cost is filled in by [`CostLedger::record`].
    pub fn new(
        run_id: RunId,
        stage: StageId,
        entity: Option<EntityId>,
        attempt: u32,
        model: impl Into<String>,
        usage: TokenUsage,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id,
            stage,
            entity,
            attempt,
            model: model.into(),
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            cost_nanodollars: None,
            status: CallStatus::Success,
            error: None,
            latency_ms: 0,
            timestamp: Utc::now(),
        }
    }

    pub fn failed(mut self, error: impl Into<String>) -> Self {
        self.status = CallStatus::Error;
        self.error = Some(error.into());
        self
    }

    pub fn latency_ms(mut self, ms: u64) -> Self {
        self.latency_ms = ms;
        self
    }

    pub fn usage(&self) -> TokenUsage {
        TokenUsage::new(self.input_tokens, self.output_tokens)
    }

    pub fn is_uncosted(&self) -> bool {
        self.cost_nanodollars.is_none()
    }
}

/// Totals for one slice of the ledger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageBreakdown {
    pub calls: usize,
    pub failed_calls: usize,
    pub uncosted_calls: usize,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_nanodollars: i64,
}

impl UsageBreakdown {
    fn add(&mut self, record: &UsageRecord) {
        self.calls += 1;
        if record.status == CallStatus::Error {
            self.failed_calls += 1;
        }
        match record.cost_nanodollars {
            Some(cost) => self.cost_nanodollars += cost,
            None => self.uncosted_calls += 1,
        }
        self.input_tokens += record.input_tokens;
        self.output_tokens += record.output_tokens;
    }

    pub fn cost_usd(&self) -> f64 {
        self.cost_nanodollars as f64 / 1e9
    }
}

/// Point-in-time aggregate over every record so far.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    /// Sum over costed records only.
    pub total_cost_nanodollars: i64,
    pub calls: usize,
    pub failed_calls: usize,
    /// Records whose model had no price; their tokens are still counted.
    pub uncosted_calls: usize,
    pub by_model: BTreeMap<String, UsageBreakdown>,
    pub by_stage: BTreeMap<StageId, UsageBreakdown>,
}

impl LedgerSnapshot {
    pub fn total_cost_usd(&self) -> f64 {
        self.total_cost_nanodollars as f64 / 1e9
    }

    fn from_records(records: &[UsageRecord]) -> Self {
        let mut total = UsageBreakdown::default();
        let mut by_model: BTreeMap<String, UsageBreakdown> = BTreeMap::new();
        let mut by_stage: BTreeMap<StageId, UsageBreakdown> = BTreeMap::new();

        for record in records {
            total.add(record);
            by_model.entry(record.model.clone()).or_default().add(record);
            by_stage.entry(record.stage).or_default().add(record);
        }

        Self {
            total_input_tokens: total.input_tokens,
            total_output_tokens: total.output_tokens,
            total_cost_nanodollars: total.cost_nanodollars,
            calls: total.calls,
            failed_calls: total.failed_calls,
            uncosted_calls: total.uncosted_calls,
            by_model,
            by_stage,
        }
    }
}

#[derive(Debug, Default)]
pub struct CostLedger {
    prices: PriceTable,
    records: Mutex<Vec<UsageRecord>>,
}

impl CostLedger {
    pub fn new(prices: PriceTable) -> Self {
        Self {
            prices,
            records: Mutex::new(Vec::new()),
        }
    }

    /// Price `record` from the table and append it. Unknown models are
    /// stored with no cost and logged, never rejected.
    pub fn record(&self, mut record: UsageRecord) -> Option<i64> {
        record.cost_nanodollars = self.prices.cost(&record.model, record.usage());
        if record.cost_nanodollars.is_none() {
            tracing::warn!(model = %record.model, stage = %record.stage, "no price for model; usage recorded uncosted");
        }
        let cost = record.cost_nanodollars;
        self.records.lock().push(record);
        cost
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        let records = self.records.lock().clone();
        LedgerSnapshot::from_records(&records)
    }

    pub fn records(&self) -> Vec<UsageRecord> {
        self.records.lock().clone()
    }

    /// Records for one stage and (optional) entity, in append order.
    pub fn records_for(&self, stage: StageId, entity: Option<&EntityId>) -> Vec<UsageRecord> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.stage == stage && r.entity.as_ref() == entity)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
