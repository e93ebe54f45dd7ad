use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use seqflow::engine::TickScheduler;
use seqflow::observability::engine_metrics;

use super::CommandContext;

pub async fn execute(context: &CommandContext, paths: &[PathBuf], once: bool) -> Result<()> {
    let mut scheduler = TickScheduler::new(
        Arc::clone(&context.driver),
        Arc::clone(&context.store),
        Arc::clone(&context.environment),
    )
    .with_config(context.config.scheduler.clone());

    for path in paths {
        let definition = context.load_definition(path)?;
        println!("📋 Scheduling workflow {}", definition.name());
        scheduler = scheduler.with_definition(Arc::new(definition));
    }

    if once {
        let summary = scheduler.sweep().await?;
        println!(
            "✅ Sweep done: ticked={} fired={} contended={} halted={} errors={}",
            summary.ticked, summary.transitions_fired, summary.contended, summary.halted, summary.errors
        );
        engine_metrics().log_stats();
        return Ok(());
    }

    println!(
        "🔁 Ticking every {}s (Ctrl-C to stop)",
        context.config.scheduler.tick_interval().as_secs()
    );
    scheduler
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Could not listen for Ctrl-C");
            }
            info!("Received shutdown signal");
        })
        .await?;
    Ok(())
}
