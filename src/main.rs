use anyhow::Result;
use clap::Parser;

mod cli;

use cli::Cli;
use seqflow::config::SeqflowConfig;
use seqflow::telemetry::init_telemetry;

fn main() -> Result<()> {
    let cli = Cli::parse();

    let _ = SeqflowConfig::load_env_file();
    let mut config = SeqflowConfig::load_from(&cli.config_dir)?;
    if let Some(dir) = cli.store_dir {
        config.persistence.directory = dir;
    }
    init_telemetry(&config.observability)?;

    tokio::runtime::Runtime::new()?.block_on(async { cli::commands::dispatch(cli.command, config).await })
}
