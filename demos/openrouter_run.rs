//! Example: a live research run through OpenRouter.
//!
//! Requires `OPENROUTER_API_KEY`. Writes the full run result to
//! `run-<id>.json` in the current directory.
//!
//! Run with: `cargo run --example openrouter_run -- "Acme Analytics" https://acme.example`

use resonance_pipeline::{
    FnEventHandler, OpenRouterGateway, PipelineRequest, RunEvent, RunStatus, Scheduler, StageId,
};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut args = std::env::args().skip(1);
    let business = args.next().unwrap_or_else(|| "Acme Analytics".to_string());
    let website = args.next();

    let gateway = OpenRouterGateway::from_env()?.with_app("https://resonance.example", "resonance-pipeline");
    let events = Arc::new(FnEventHandler(|event: RunEvent| {
        if let RunEvent::StageSucceeded { stage, entity, attempts, .. } = event {
            match entity {
                Some(e) => println!("  {} [{}] ok after {} call(s)", stage, e, attempts),
                None => println!("  {} ok after {} call(s)", stage, attempts),
            }
        }
    }));
    let scheduler = Scheduler::research(Arc::new(gateway)).with_event_handler(events);

    let mut request = PipelineRequest::builder(business).segments(3);
    if let Some(url) = website {
        request = request.website(url);
    }
    // A cheaper model for the long journey maps.
    let request = request
        .model(StageId::JourneyMapping, "google/gemini-2.5-flash-preview-09-2025")
        .build()?;

    let handle = scheduler.start(request)?;
    let run_id = handle.run_id();
    println!("Started run {}", run_id);

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let wait = handle.wait();
    tokio::pin!(wait);
    let result = tokio::select! {
        result = &mut wait => result?,
        _ = &mut ctrl_c => {
            println!("Cancelling; waiting for in-flight calls...");
            scheduler.cancel(run_id)?;
            wait.await?
        }
    };

    println!("\nRun {} {}", result.run_id, result.status);
    if let Some(failure) = &result.failure {
        println!("Failure: {}", failure);
    }
    if result.status == RunStatus::Completed {
        println!(
            "{} of {} segments succeeded",
            result.succeeded_entities().count(),
            result.entities.len()
        );
    }
    println!(
        "Cost: ${:.4} over {} calls ({} uncosted)",
        result.usage.total_cost_usd(),
        result.usage.calls,
        result.usage.uncosted_calls
    );

    let path = format!("run-{}.json", result.run_id);
    std::fs::write(&path, serde_json::to_string_pretty(&result.to_json()?)?)?;
    println!("Wrote {}", path);
    Ok(())
}
