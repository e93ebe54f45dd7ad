use anyhow::Result;
use std::path::Path;

use seqflow::definition::StateId;
use seqflow::engine::{activate_state, cancel_instance, cancel_instance_with_jobs, deactivate_state, resume_instance};

use super::{parse_instance_id, CommandContext};

pub async fn cancel(context: &CommandContext, raw_id: &str, reason: &str, kill_jobs: bool) -> Result<()> {
    let instance_id = parse_instance_id(raw_id)?;
    if !kill_jobs {
        let cleared = cancel_instance(context.store.as_ref(), instance_id, reason).await?;
        println!("🛑 Cancelled {} ({} active state(s) cleared)", instance_id, cleared.len());
        println!("   Jobs already launched keep running; pass --kill-jobs to stop them");
        return Ok(());
    }

    let launcher = &context.environment.launcher;
    let (cleared, stopped) =
        cancel_instance_with_jobs(context.store.as_ref(), launcher.as_ref(), instance_id, reason).await?;
    println!("🛑 Cancelled {} ({} active state(s) cleared)", instance_id, cleared.len());
    for handle in &stopped {
        println!("   stopped job {}", handle);
    }
    Ok(())
}

pub async fn deactivate(context: &CommandContext, raw_id: &str, state: &str) -> Result<()> {
    let instance_id = parse_instance_id(raw_id)?;
    let state = StateId::from(state);
    if deactivate_state(context.store.as_ref(), instance_id, &state).await? {
        println!("✅ {} removed from {}", state, instance_id);
    } else {
        println!("ℹ️  {} was not active in {}", state, instance_id);
    }
    Ok(())
}

pub async fn activate(context: &CommandContext, path: &Path, raw_id: &str, state: &str) -> Result<()> {
    let definition = context.load_definition(path)?;
    let instance_id = parse_instance_id(raw_id)?;
    let state = StateId::from(state);
    if activate_state(context.store.as_ref(), &definition, instance_id, &state).await? {
        println!("✅ {} activated in {}", state, instance_id);
    } else {
        println!("ℹ️  {} was already active in {}", state, instance_id);
    }
    Ok(())
}

pub async fn resume(context: &CommandContext, raw_id: &str) -> Result<()> {
    let instance_id = parse_instance_id(raw_id)?;
    resume_instance(context.store.as_ref(), instance_id).await?;
    println!("▶️  Resumed {}", instance_id);
    Ok(())
}
