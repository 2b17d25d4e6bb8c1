mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use offsetguess_core::KernelVersion;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use commands::simulate::SimulateOptions;

#[derive(Parser)]
#[command(name = "offsetguess")]
#[command(about = "Runtime kernel structure offset guessing")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Calibrate against a simulated kernel and check the result
    Simulate {
        /// Kernel layout JSON file (built-in layout when omitted)
        #[arg(short, long)]
        layout: Option<PathBuf>,

        /// Calibration config JSON file
        #[arg(short, long, env = "OFFSETGUESS_CONFIG")]
        config: Option<PathBuf>,

        /// Upper bound on candidate offsets
        #[arg(short, long)]
        threshold: Option<u64>,

        /// Kernel release, e.g. 5.15.0
        #[arg(short, long)]
        kernel: Option<KernelVersion>,

        /// Skip the IPv6 fields
        #[arg(long)]
        no_ipv6: bool,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the built-in simulated kernel layout as JSON
    Layout,
    /// Show the aligned candidate probed for an offset
    Align {
        /// Object address in hex
        base: String,

        /// Candidate offset
        offset: u64,

        /// Field size in bytes
        #[arg(short, long, default_value_t = 4)]
        size: u64,
    },
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("offsetguess=info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match args.command {
        Command::Simulate {
            layout,
            config,
            threshold,
            kernel,
            no_ipv6,
            json,
        } => commands::simulate::run(&SimulateOptions {
            layout,
            config,
            threshold,
            kernel,
            no_ipv6,
            json,
        }),
        Command::Layout => commands::layout::run(),
        Command::Align { base, offset, size } => commands::align::run(&base, offset, size),
    }
}
