use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub mod commands;

#[derive(Parser)]
#[command(name = "seqflow")]
#[command(about = "Multi-token workflow engine for sequencing pipelines")]
#[command(long_about = "Seqflow advances workflow instances through a graph of states by invoking tasks \
                       and interpreting their results. Start an instance with 'seqflow start', then tick \
                       it by hand or keep 'seqflow run' going in the background.")]
pub struct Cli {
    /// Directory searched for seqflow.toml and .seqflow-rc
    #[arg(long, global = true, default_value = ".")]
    pub config_dir: PathBuf,

    /// Override persistence.directory from the configuration
    #[arg(long, global = true)]
    pub store_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Load a definition document and report problems
    Validate {
        /// Workflow document (.toml or .json)
        definition: PathBuf,
    },
    /// Create a new instance of a workflow
    Start {
        definition: PathBuf,
        /// Instance variable, repeatable
        #[arg(long = "var", value_parser = parse_key_val, help = "Instance variable as KEY=VALUE")]
        vars: Vec<(String, String)>,
        /// Seed state instead of the start state, repeatable
        #[arg(long = "seed", help = "Activate this state instead of the start state")]
        seeds: Vec<String>,
    },
    /// Tick one instance once
    Tick {
        definition: PathBuf,
        instance: String,
    },
    /// Tick every running instance of the given workflows until Ctrl-C
    Run {
        #[arg(required = true)]
        definitions: Vec<PathBuf>,
        /// Sweep once and exit
        #[arg(long)]
        once: bool,
    },
    /// Show one instance
    Status {
        instance: String,
        /// Print the stored document as JSON
        #[arg(long)]
        json: bool,
    },
    /// List stored instances
    List {
        /// Only instances of this workflow
        #[arg(long)]
        workflow: Option<String>,
    },
    /// Clear every active state of an instance
    Cancel {
        instance: String,
        #[arg(long, default_value = "cancelled by operator")]
        reason: String,
        /// Also stop jobs the instance's tasks launched
        #[arg(long)]
        kill_jobs: bool,
    },
    /// Force a state out of the active set (exit task is not run)
    Deactivate {
        instance: String,
        state: String,
    },
    /// Add a state to the active set (entry task runs on the next tick)
    Activate {
        definition: PathBuf,
        instance: String,
        state: String,
    },
    /// Clear a halt so the instance is ticked again
    Resume {
        instance: String,
    },
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", s))?;
    if key.is_empty() {
        return Err(format!("empty key in '{}'", s));
    }
    Ok((key.to_string(), value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key_val() {
        assert_eq!(
            parse_key_val("run_dir=/seq/a=b").unwrap(),
            ("run_dir".to_string(), "/seq/a=b".to_string())
        );
        assert!(parse_key_val("novalue").is_err());
        assert!(parse_key_val("=x").is_err());
    }

    #[test]
    fn test_start_arguments() {
        let cli = Cli::try_parse_from([
            "seqflow", "start", "run.toml", "--var", "run_dir=/seq/1", "--seed", "LANE_1", "--seed", "LANE_2",
        ])
        .unwrap();
        match cli.command {
            Commands::Start { definition, vars, seeds } => {
                assert_eq!(definition, PathBuf::from("run.toml"));
                assert_eq!(vars, vec![("run_dir".to_string(), "/seq/1".to_string())]);
                assert_eq!(seeds, vec!["LANE_1", "LANE_2"]);
            }
            _ => panic!("expected start"),
        }
    }

    #[test]
    fn test_cancel_kill_jobs_flag() {
        let cli = Cli::try_parse_from(["seqflow", "cancel", "abc", "--kill-jobs"]).unwrap();
        match cli.command {
            Commands::Cancel { instance, reason, kill_jobs } => {
                assert_eq!(instance, "abc");
                assert_eq!(reason, "cancelled by operator");
                assert!(kill_jobs);
            }
            _ => panic!("expected cancel"),
        }
    }
}
