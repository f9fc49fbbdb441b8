//! Example: a full research run against the scripted gateway.
//!
//! One segment's pain taxonomy comes back malformed twice, so the run ends
//! as a partial success. The first ingestion call is rate limited.
//!
//! Run with: `RUST_LOG=resonance_pipeline=debug cargo run --example mock_run`

use resonance_pipeline::gateway::{GatewayError, MockReply};
use resonance_pipeline::{
    BackoffConfig, FnEventHandler, JsonReport, MockGateway, PipelineRequest, ReportCompiler,
    RetryPolicy, RunEvent, Scheduler, SchedulerSettings, StageId,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

fn journey() -> Value {
    let stage = json!({
        "objective": "Earn a first conversation",
        "key_questions": ["Is this worth switching for?"],
        "content_ideas": [{"title": "Stockout cost calculator", "format": "tool"}],
        "preferred_channels": ["LinkedIn", "trade press"],
        "kpis": ["demo requests"]
    });
    let mut doc = json!({"cross_stage_recommendations": ["Reuse the calculator in onboarding"]});
    for name in resonance_pipeline::research::JOURNEY_STAGES {
        doc[format!("{}_stage", name)] = stage.clone();
    }
    doc
}

fn scripted_gateway() -> MockGateway {
    let pains = json!([{"pain": "Manual reorder spreadsheets", "severity": 8}]);
    let forces = json!([{"force": "Quarter-end stockouts", "intensity": 7}]);

    MockGateway::new()
        .with_usage(2_400, 900)
        .with_latency(Duration::from_millis(40))
        .stage(
            StageId::Ingestion,
            vec![
                MockReply::error(GatewayError::rate_limited("429 Too Many Requests", None)),
                MockReply::json(&json!({
                    "company_name": "Acme Analytics",
                    "description": "Inventory forecasting for mid-size retailers",
                    "products_services": ["Demand forecasting", "Reorder automation"],
                    "value_propositions": ["Fewer stockouts", "Less working capital tied up"],
                    "competitors": [{"name": "Globex Forecast"}]
                })),
            ],
        )
        .stage(
            StageId::SegmentGeneration,
            vec![MockReply::text(format!(
                "Here are the segments:\n```json\n{}\n```",
                json!({"segments": [
                    {"id": "regional-grocers", "name": "Regional grocers", "description": "10-80 store chains",
                     "goals": ["cut spoilage"], "challenges": ["thin margins"], "fit_score": 88},
                    {"id": "specialty-apparel", "name": "Specialty apparel", "description": "Seasonal fashion boutiques",
                     "goals": ["sell through"], "challenges": ["trend risk"], "fit_score": 71},
                    {"id": "hardware-coops", "name": "Hardware co-ops", "description": "Member-owned hardware stores",
                     "goals": ["shared buying"], "challenges": ["legacy ERP"], "fit_score": 64}
                ]})
            ))],
        )
        .stage(
            StageId::ValueMapping,
            vec![MockReply::json(&json!({
                "customer_jobs": [{"job": "Keep shelves stocked", "importance": 9}],
                "pains": [{"pain": "Stockouts", "severity": 8}],
                "gains": [{"gain": "Higher basket size", "relevance": 6}],
                "pain_relievers": [{"reliever": "Predictive reorders", "addresses_pain": "Stockouts", "relief_significance": 8}],
                "gain_creators": [{"creator": "Assortment insights", "addresses_gain": "Higher basket size"}],
                "fit_score": 80,
                "value_proposition_statement": "Stock what sells, before it runs out."
            }))],
        )
        .stage(
            StageId::PainTaxonomy,
            vec![MockReply::json(&json!({
                "functional_pains": pains,
                "financial_pains": pains,
                "emotional_pains": pains,
                "forces_analysis": {"push": forces, "pull": forces, "habit": forces, "anxiety": forces},
                "pain_priority_ranking": [{"pain": "Manual reorder spreadsheets", "priority_score": 92}],
                "messaging_implications": ["Lead with hours saved per week"]
            }))],
        )
        .entity(
            StageId::PainTaxonomy,
            "hardware-coops",
            vec![MockReply::text("I could not find enough information about this segment.")],
        )
        .stage(StageId::JourneyMapping, vec![MockReply::json(&journey())])
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let events = Arc::new(FnEventHandler(|event: RunEvent| match event {
        RunEvent::EntitiesDiscovered { entities, .. } => {
            for (id, name) in entities {
                println!("  segment {:<20} {}", id, name);
            }
        }
        RunEvent::EntityFinished { entity, ok, .. } => {
            println!("  [{}] {}", if ok { "done" } else { "FAIL" }, entity);
        }
        _ => {}
    }));

    let scheduler = Scheduler::research(Arc::new(scripted_gateway()))
        .with_settings(
            SchedulerSettings::default()
                .max_in_flight(2)
                .retry(RetryPolicy::default().with_backoff(BackoffConfig::none())),
        )
        .with_event_handler(events);

    let request = PipelineRequest::builder("Acme Analytics")
        .website("https://acme.example")
        .industry("Retail analytics")
        .build()?;

    println!("Running research pipeline for {}...", request.business_name);
    let result = scheduler.run(request).await?;

    println!("\nStatus: {} (partial: {})", result.status, result.is_partial());
    for (id, outcome) in result.failed_entities() {
        println!("Failed segment {}: {:?}", id, outcome);
    }
    println!(
        "Calls: {} ({} failed), tokens in/out: {}/{}, cost: ${:.4}",
        result.usage.calls,
        result.usage.failed_calls,
        result.usage.total_input_tokens,
        result.usage.total_output_tokens,
        result.usage.total_cost_usd()
    );

    let report = JsonReport.compile(&result)?;
    println!("\nReport:\n{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
