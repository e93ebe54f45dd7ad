use anyhow::Result;
use std::collections::BTreeMap;
use std::path::Path;

use seqflow::definition::StateId;

use super::CommandContext;

pub async fn execute(
    context: &CommandContext,
    path: &Path,
    vars: Vec<(String, String)>,
    seeds: Vec<String>,
) -> Result<()> {
    let definition = context.load_definition(path)?;
    let variables: BTreeMap<String, String> = vars.into_iter().collect();

    let instance = if seeds.is_empty() {
        context
            .driver
            .start_instance(context.store.as_ref(), &definition, variables)
            .await?
    } else {
        let seeds: Vec<StateId> = seeds.into_iter().map(StateId::from).collect();
        context
            .driver
            .start_seeded(context.store.as_ref(), &definition, &seeds, variables)
            .await?
    };

    println!("🚀 Started {} instance {}", definition.name(), instance.id());
    let active: Vec<String> = instance.active_states().iter().map(ToString::to_string).collect();
    println!("   Active: {}", active.join(", "));
    Ok(())
}
