//! SLC Node - Generic slow-control node daemon
//!
//! Runs one node described by a TOML configuration file: builds the
//! callback selected by `[node] kind`, registers with the registry and
//! serves ticks and commands until stopped.
//!
//! # Usage
//!
//! ```bash
//! # Run in the foreground
//! slcnode --config /etc/slc/hv_arich.toml
//!
//! # Same file, different name, in the background
//! slcnode --config /etc/slc/hv.toml --name HV_TOP -d
//! ```
//!
//! Exit codes: 0 clean shutdown, 1 startup failure, 2 runtime fatal.

use std::path::PathBuf;
use std::process;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use slc_core::{Fault, NodeName};
use slc_node::{Daemon, NodeRunner, NodeSettings, EXIT_STARTUP};

/// SLC node daemon
#[derive(Parser, Debug)]
#[command(name = "slcnode", version, about)]
struct Args {
    /// Node configuration file (TOML)
    #[arg(short, long)]
    config: PathBuf,

    /// Override `[node] name`
    #[arg(long)]
    name: Option<String>,

    /// Run as a background daemon (fork to background)
    #[arg(short = 'd', long)]
    daemon: bool,
}

fn log_file_path(name: &NodeName) -> PathBuf {
    dirs::state_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("slc")
        .join(format!("{name}.log"))
}

fn init_tracing() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("slcnode=info".parse()?)
                .add_directive("slc_node=info".parse()?)
                .add_directive("slc_core=info".parse()?),
        )
        .init();
    Ok(())
}

fn main() {
    let args = Args::parse();

    if let Err(e) = init_tracing() {
        eprintln!("slcnode: {e:#}");
        process::exit(EXIT_STARTUP);
    }

    let settings = match NodeSettings::load(&args.config, args.name.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("slcnode: {}", Fault::from(e));
            process::exit(EXIT_STARTUP);
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        node = %settings.name,
        kind = %settings.kind,
        config = %args.config.display(),
        "SLC node starting"
    );

    let background = args.daemon || settings.daemonize;
    let log_file = log_file_path(&settings.name);
    let mut daemon = Daemon::new(settings.name.to_string(), NodeRunner::new(settings));
    if background {
        daemon = daemon.daemonize(log_file);
    }

    process::exit(daemon.start());
}
