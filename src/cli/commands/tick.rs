use anyhow::Result;
use std::path::Path;

use seqflow::engine::TickOutcome;

use super::{parse_instance_id, CommandContext};

pub async fn execute(context: &CommandContext, path: &Path, raw_id: &str) -> Result<()> {
    let definition = context.load_definition(path)?;
    let instance_id = parse_instance_id(raw_id)?;

    let report = context
        .driver
        .tick(context.store.as_ref(), &definition, instance_id, &context.environment)
        .await?;

    if report.outcome == TickOutcome::Skipped {
        println!("⏸️  Instance {} is not running; nothing to do", instance_id);
        return Ok(());
    }

    println!("🔄 Ticked {}", instance_id);
    for fired in &report.fired {
        println!("   ➡️  {} ({} → {})", fired.name, fired.from, fired.to);
    }
    for state in &report.running {
        println!("   ⏳ {} waiting on a running task", state);
    }
    for state in &report.failed {
        println!("   ❌ {} has a failed task", state);
    }
    for state in &report.deferred {
        println!("   💤 {} deferred by retry policy", state);
    }
    for (from, to) in &report.routed {
        println!("   🚑 {} routed to {}", from, to);
    }
    if !report.made_progress() && report.running.is_empty() && report.failed.is_empty() {
        println!("   Nothing changed");
    }
    Ok(())
}
