//! rpilot-node binary: runs a Terminal or a Pilot on TCP transports.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use rpilot_network::tcp::{bind_line_listener, subscribe};
use rpilot_network::{Filters, TcpPublisher, TcpPusher};
use rpilot_node::{EventKind, NodeConfig, Pilot, Terminal};

#[derive(Parser, Debug)]
#[command(name = "rpilot-node", about = "rpilot control-plane node")]
struct Cli {
    /// Path to the TOML config file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    role: Role,
}

#[derive(Subcommand, Debug)]
enum Role {
    /// Run the coordinator.
    Terminal,
    /// Run a worker.
    Pilot {
        /// Overrides `pilot.name` from the config.
        #[arg(long)]
        name: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut config = NodeConfig::load_or_default(cli.config.as_deref())?;

    match cli.role {
        Role::Terminal => run_terminal(config).await,
        Role::Pilot { name } => {
            if let Some(name) = name {
                config.pilot.name = name;
            }
            run_pilot(config).await
        }
    }
}

async fn run_terminal(config: NodeConfig) -> anyhow::Result<()> {
    let options = config.tcp_options();
    let publisher = TcpPublisher::bind(
        &format!("0.0.0.0:{}", config.network.broadcast_port),
        options.clone(),
    )
    .await?;
    let (_, funnel) = bind_line_listener(
        &format!("0.0.0.0:{}", config.network.funnel_port),
        options.queue_capacity,
    )
    .await?;
    let (_, intake) = bind_line_listener(&config.intake_addr(), options.queue_capacity).await?;

    let (terminal, mut events) = Terminal::new(Arc::new(publisher), config.terminal_settings());

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event.kind {
                EventKind::Alive(pilot) => tracing::info!(pilot = %pilot, "ALIVE"),
                EventKind::Dead(pilot) => tracing::warn!(pilot = %pilot, "DEAD"),
                EventKind::Confirmed { id, key } => tracing::debug!(id = %id, key = %key, "Confirmed"),
                EventKind::DeliveryFailed { id, envelope } => {
                    tracing::error!(id = %id, key = %envelope.key, target_addr = %envelope.target, "Delivery failed")
                }
                EventKind::Report { key, from, value } => {
                    tracing::info!(key = %key, pilot = %from, value = %value, "Report")
                }
            }
        }
    });

    tokio::select! {
        _ = terminal.run(intake, funnel) => {}
        _ = tokio::signal::ctrl_c() => tracing::info!("Shutting down"),
    }
    Ok(())
}

async fn run_pilot(config: NodeConfig) -> anyhow::Result<()> {
    let name = config.pilot_name()?;
    let options = config.tcp_options();

    let broadcast = subscribe(config.broadcast_addr(), Filters::for_node(&name), options.clone());
    let pusher = TcpPusher::connect(config.funnel_addr(), options.clone());
    let (_, intake) = bind_line_listener(&config.intake_addr(), options.queue_capacity).await?;

    // Task handlers belong to the embedding experiment process; standalone
    // the Pilot only logs the commands it acknowledges.
    let pilot = Pilot::builder(name, Arc::new(pusher))
        .max_in_flight(config.dispatch.max_in_flight)
        .drain_timeout(config.drain_timeout())
        .build();

    tokio::select! {
        _ = pilot.run(broadcast, intake) => {}
        _ = tokio::signal::ctrl_c() => tracing::info!("Shutting down"),
    }
    Ok(())
}
