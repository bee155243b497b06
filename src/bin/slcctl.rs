//! SLC Control - Operator CLI for the status registry
//!
//! # Usage
//!
//! ```bash
//! slcctl list
//! slcctl get HV_ARICH
//! slcctl send HV_ARICH configure cfg17
//! slcctl watch            # all nodes, until Ctrl+C
//! slcctl watch HV_ARICH
//! ```
//!
//! The socket defaults to `$SLC_SOCKET` or `/tmp/slc.sock`.

use std::path::PathBuf;
use std::process;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

use slc_core::{Command as NodeCommand, NodeName, PublishableStatus, StatusRecord};
use slc_node::{RemoteRegistry, StatusRegistry};
use slcd::registry::StatusEvent;

/// SLC operator CLI
#[derive(Parser, Debug)]
#[command(name = "slcctl", version, about)]
struct Args {
    /// Registry socket path
    #[arg(short, long)]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List all registered nodes
    List,
    /// Show one node's status record
    Get { node: String },
    /// Send a command to a node
    Send {
        node: String,
        verb: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Print status updates as they happen
    Watch { node: Option<String> },
}

fn format_time(secs: u64) -> String {
    i64::try_from(secs)
        .ok()
        .and_then(|s| DateTime::from_timestamp(s, 0))
        .map(|t| t.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn summary(name: &NodeName, record: &StatusRecord) -> String {
    format!(
        "{:<16} {:<8} {:<8} cfg{:<6} {:>4} ch  {}",
        name.as_str(),
        record.kind().to_string(),
        record.state().to_string(),
        record.config_id(),
        record.channels().len(),
        format_time(record.updated_at())
    )
}

fn print_record(name: &NodeName, record: &StatusRecord) {
    println!("node:       {name}");
    println!("kind:       {}", record.kind());
    println!("state:      {}", record.state());
    println!("config:     cfg{}", record.config_id());
    println!("updated:    {}", format_time(record.updated_at()));
    if let Some(readout) = record.as_readout() {
        println!(
            "run:        {}.{} ({} events)",
            readout.exp_number, readout.run_number, readout.event_count
        );
    }
    println!("channels:");
    for (i, ch) in record.channels().iter().enumerate() {
        println!(
            "  {i:>3}  {:<6} {:>10.2} V {:>10.4} mA",
            ch.state.to_string(),
            ch.vmon,
            ch.imon
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env().add_directive("slcctl=warn".parse()?))
        .init();

    let args = Args::parse();
    let socket = args.socket.unwrap_or_else(slc_protocol::socket_path);

    let registry = RemoteRegistry::connect(&socket, Some("slcctl".to_string()))
        .await
        .with_context(|| format!("Cannot reach registry at {}", socket.display()))?;

    match args.command {
        Command::List => {
            let nodes = registry.list().await?;
            if nodes.is_empty() {
                println!("No nodes registered.");
            }
            for node in &nodes {
                println!("{}", summary(&node.name, &node.record));
            }
        }
        Command::Get { node } => {
            let name = NodeName::new(node).context("Invalid node name")?;
            let record = registry.lookup(&name).await?;
            print_record(&name, &record);
        }
        Command::Send { node, verb, args } => {
            let name = NodeName::new(node).context("Invalid node name")?;
            let command = NodeCommand::new(name, verb, args);
            match registry.send_command(command.clone()).await {
                Ok(ack) => match ack.message {
                    Some(message) => println!("{command}: ok ({message})"),
                    None => println!("{command}: ok"),
                },
                Err(e) => {
                    eprintln!("{command}: {e}");
                    process::exit(1);
                }
            }
        }
        Command::Watch { node } => {
            let filter = node
                .map(NodeName::new)
                .transpose()
                .context("Invalid node name")?;
            watch(&registry, filter).await?;
        }
    }

    Ok(())
}

async fn watch(registry: &RemoteRegistry, filter: Option<NodeName>) -> Result<()> {
    let mut events = registry.subscribe(filter).await?;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => return Ok(()),
            event = events.recv() => match event {
                Ok(StatusEvent::Updated { name, record }) => println!("{}", summary(&name, &record)),
                Ok(StatusEvent::Registered { name }) => println!("{name} registered"),
                Ok(StatusEvent::Removed { name, .. }) => println!("{name} removed"),
                Err(RecvError::Lagged(n)) => eprintln!("(skipped {n} updates)"),
                Err(RecvError::Closed) => bail!("Registry connection lost"),
            },
        }
    }
}
