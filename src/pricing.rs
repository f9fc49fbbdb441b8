//! Per-model price table.
//!
//! Costs are integer nanodollars (1e-9 USD) per token so totals are exact
//! and independent of the order calls are recorded in.

use crate::gateway::TokenUsage;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input_nanos_per_token: i64,
    pub output_nanos_per_token: i64,
}

impl ModelPricing {
    pub const fn new(input: i64, output: i64) -> Self {
        Self {
            input_nanos_per_token: input,
            output_nanos_per_token: output,
        }
    }

    /// Build from the usual "USD per million tokens" quote.
    pub fn per_million_usd(input: f64, output: f64) -> Self {
        // $1 per 1M tokens is 1000 nanodollars per token.
        Self::new((input * 1_000.0).round() as i64, (output * 1_000.0).round() as i64)
    }

    pub fn cost(&self, usage: TokenUsage) -> i64 {
        (usage.input_tokens as i64) * self.input_nanos_per_token
            + (usage.output_tokens as i64) * self.output_nanos_per_token
    }
}

// OpenRouter list prices, USD per 1M tokens (input / output).
// sonar-deep-research: 5.00 / 5.00
// claude-sonnet-4.5:   3.00 / 15.00
// gemini-2.5-flash:    0.075 / 0.30
// gpt-5-mini:          0.15 / 0.60
// gpt-4.1:             2.00 / 8.00
// grok-4.1-fast:       2.00 / 8.00
const SONAR_DEEP_RESEARCH: ModelPricing = ModelPricing::new(5_000, 5_000);
const CLAUDE_SONNET_4_5: ModelPricing = ModelPricing::new(3_000, 15_000);
const GEMINI_25_FLASH: ModelPricing = ModelPricing::new(75, 300);
const GPT_5_MINI: ModelPricing = ModelPricing::new(150, 600);
const GPT_4_1: ModelPricing = ModelPricing::new(2_000, 8_000);
const GROK_4_1_FAST: ModelPricing = ModelPricing::new(2_000, 8_000);

static DEFAULT_PRICES: OnceLock<HashMap<String, ModelPricing>> = OnceLock::new();

fn init_prices() -> HashMap<String, ModelPricing> {
    [
        ("perplexity/sonar-deep-research", SONAR_DEEP_RESEARCH),
        ("anthropic/claude-sonnet-4.5", CLAUDE_SONNET_4_5),
        ("google/gemini-2.5-flash-preview-09-2025", GEMINI_25_FLASH),
        ("openai/gpt-5-mini", GPT_5_MINI),
        ("openai/gpt-4.1", GPT_4_1),
        ("x-ai/grok-4.1-fast", GROK_4_1_FAST),
    ]
    .into_iter()
    .map(|(model, price)| (model.to_string(), price))
    .collect()
}

/// Static lookup from model id to price, owned by one ledger.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PriceTable {
    prices: HashMap<String, ModelPricing>,
}

impl PriceTable {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Prices for the models the research stages use by default.
    pub fn research_defaults() -> Self {
        Self {
            prices: DEFAULT_PRICES.get_or_init(init_prices).clone(),
        }
    }

    pub fn with(mut self, model: impl Into<String>, pricing: ModelPricing) -> Self {
        self.prices.insert(model.into(), pricing);
        self
    }

    pub fn get(&self, model: &str) -> Option<ModelPricing> {
        self.prices.get(model).copied()
    }

    /// Cost of `usage` on `model`, or `None` for models with no price.
    pub fn cost(&self, model: &str, usage: TokenUsage) -> Option<i64> {
        self.get(model).map(|p| p.cost(usage))
    }
}
