//! labflow command-line host.
//!
//! `labflow check <file>` prints the diagnostics of a protocol; `labflow run <file>`
//! runs it against the simulated devices of the configuration.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::info;

use labflow::config::Settings;
use labflow::fiber::eval::ExpressionEngine;
use labflow::fiber::parser::ProtocolParser;
use labflow::host::Host;

#[derive(Parser)]
#[command(name = "labflow")]
#[command(about = "Run laboratory protocols against simulated devices")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse a protocol and print its diagnostics
    Check {
        /// Protocol source (YAML)
        file: PathBuf,
    },

    /// Run a protocol on a new chip and print the final snapshot
    Run {
        /// Protocol source (YAML)
        file: PathBuf,

        /// Print every snapshot update as a JSON line
        #[arg(long)]
        follow: bool,
    },
}

fn read_source(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = Settings::load(cli.config.as_deref()).context("Failed to load configuration")?;
    labflow::logging::init(&settings.logging)?;

    match cli.command {
        Commands::Check { file } => {
            let source = read_source(&file)?;
            let engine = ExpressionEngine::new(settings.engine.max_expression_operations);
            let draft = ProtocolParser::new(&engine).parse(&source);

            println!("{}", serde_json::to_string_pretty(&draft.export())?);

            if draft.has_errors() {
                bail!("{} has errors", file.display());
            }
        }
        Commands::Run { file, follow } => {
            let source = read_source(&file)?;

            let mut host = Host::new(settings);
            host.start().await;

            let chip_id = host.create_chip(file.file_stem().map(|stem| stem.to_string_lossy().into_owned()));
            info!(chip = %chip_id, file = %file.display(), "Running protocol");

            let master = host.start_plan(&chip_id, &source, None).await?.clone();

            if follow {
                let mut ticker = tokio::time::interval(std::time::Duration::from_millis(500));

                while !master.is_done() {
                    tokio::select! {
                        _ = ticker.tick() => {
                            println!("{}", serde_json::to_string(&host.snapshot())?);
                        }
                        _ = master.wait_done() => {}
                    }
                }
            } else {
                master.wait_done().await;
            }

            println!("{}", serde_json::to_string_pretty(&host.snapshot())?);
            host.shutdown().await;

            if let Some(failure) = master.export().failure {
                bail!("Protocol failed: {failure}");
            }
        }
    }

    Ok(())
}
