use anyhow::Result;
use std::path::Path;

use super::CommandContext;

pub fn execute(context: &CommandContext, path: &Path) -> Result<()> {
    let definition = context.load_definition(path)?;
    let start = definition.start_state()?;

    println!("✅ {} is valid", definition.name());
    println!("   States: {}", definition.states().len());
    println!("   Transitions: {}", definition.transitions().len());
    println!("   Start state: {}", start.id());

    let terminal: Vec<String> = definition
        .states()
        .iter()
        .filter(|s| definition.is_terminal(s.id()))
        .map(|s| s.id().to_string())
        .collect();
    if !terminal.is_empty() {
        println!("   Terminal states: {}", terminal.join(", "));
    }
    Ok(())
}
