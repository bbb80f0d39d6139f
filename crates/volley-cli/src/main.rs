//! volley - run Connect/gRPC scenarios from the command line

mod logging;
mod runner;
mod scenario;

use std::path::PathBuf;

use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand};
use volley_core::SchemaRegistry;

use crate::runner::Runner;
use crate::scenario::Scenario;

#[derive(Parser, Debug)]
#[command(name = "volley", version, about = "Scriptable Connect/gRPC load scenarios")]
struct Cli {
    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a scenario file
    Run {
        scenario: PathBuf,
        /// Overrides the scenario's iteration count
        #[arg(long)]
        iterations: Option<u64>,
    },
    /// List the methods in a protoset or descriptor JSON file
    Methods { file: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    match cli.command {
        Command::Run {
            scenario,
            iterations,
        } => {
            let scenario = Scenario::load(&scenario)?;
            let iterations = iterations.unwrap_or(scenario.iterations);
            let report = Runner::new(scenario)?.run(iterations).await?;
            println!("{}", runner::render(&report)?);
        }
        Command::Methods { file } => {
            let registry = SchemaRegistry::new();
            for method in scenario::load_schema(&registry, &file)? {
                println!("{:<60} {}", method.full_method, method.kind());
            }
        }
    }
    Ok(())
}
