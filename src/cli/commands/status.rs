use anyhow::{anyhow, Result};

use seqflow::instance::ExecutionInstance;

use super::{parse_instance_id, CommandContext};

pub async fn show(context: &CommandContext, raw_id: &str, json: bool) -> Result<()> {
    let instance_id = parse_instance_id(raw_id)?;
    let instance = context
        .store
        .load(instance_id)
        .await?
        .ok_or_else(|| anyhow!("Instance {} not found", instance_id))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&instance)?);
        return Ok(());
    }

    println!("📊 INSTANCE {}", instance.id());
    println!("==============================================");
    println!("   Workflow: {}", instance.workflow());
    println!("   Status: {}", instance.status());
    println!("   Created: {}", instance.created_at());
    match instance.last_ticked_at() {
        Some(at) => println!("   Last tick: {}", at),
        None => println!("   Last tick: never"),
    }
    if let Some(reason) = instance.halted_reason() {
        println!("   🛑 Halted: {}", reason);
    }

    println!();
    println!("🎯 ACTIVE STATES:");
    if instance.is_complete() {
        println!("   (none)");
    }
    for state in instance.active_states() {
        match instance.failure(&state) {
            Some(failure) => println!(
                "   ❌ {} - {} failed {} time(s), exit {}: {}",
                state,
                failure.task,
                failure.attempts,
                failure.exit_code,
                failure.output.lines().last().unwrap_or("")
            ),
            None => println!("   🟢 {}", state),
        }
    }
    Ok(())
}

pub async fn list(context: &CommandContext, workflow: Option<&str>) -> Result<()> {
    let mut shown = 0;
    for instance_id in context.store.list().await? {
        let Some(instance) = context.store.load(instance_id).await? else {
            continue;
        };
        if workflow.is_some_and(|w| w != instance.workflow()) {
            continue;
        }
        println!("{}", summary_line(&instance));
        shown += 1;
    }
    if shown == 0 {
        println!("📋 No instances found");
    }
    Ok(())
}

fn summary_line(instance: &ExecutionInstance) -> String {
    let active: Vec<String> = instance.active_states().iter().map(ToString::to_string).collect();
    format!(
        "{}  {:<10} {:<20} [{}]",
        instance.id(),
        instance.status().to_string(),
        instance.workflow(),
        active.join(", ")
    )
}
