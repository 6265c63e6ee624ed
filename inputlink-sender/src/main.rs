//! InputLink sender: entry point.
//!
//! ```text
//! inputlink-sender                    Run with inputlink-sender.toml (or defaults)
//! inputlink-sender --config <path>    Use a custom config TOML
//! inputlink-sender --receiver <addr>  Override the receiver host
//! inputlink-sender --gen-config       Dump default config and exit
//! ```

use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use inputlink_sender::config::SenderAppConfig;
use inputlink_sender::service::SenderService;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "inputlink-sender", about = "Forward local game controllers to a receiver")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "inputlink-sender.toml")]
    config: PathBuf,

    /// Receiver host (overrides config).
    #[arg(short, long)]
    receiver: Option<String>,

    /// Receiver port (overrides config).
    #[arg(short, long)]
    port: Option<u16>,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.gen_config {
        println!("{}", SenderAppConfig::default_toml()?);
        return Ok(());
    }

    let mut config = SenderAppConfig::load(&cli.config);
    if let Some(host) = cli.receiver {
        config.sender.receiver_host = host;
    }
    if let Some(port) = cli.port {
        config.sender.receiver_port = port;
    }

    // Init tracing.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("inputlink-sender v{}", env!("CARGO_PKG_VERSION"));
    info!("receiver: {}", config.sender.receiver_addr());
    for c in config.sender.enabled_controllers() {
        info!(
            "controller {} → #{} ({})",
            c.controller_id, c.assigned_number, c.input_method
        );
    }

    let service = SenderService::new(config);
    let stop = service.stop_handle();

    // Ctrl-C handler.
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received, shutting down");
        stop.cancel();
    });

    service.run().await?;

    Ok(())
}
