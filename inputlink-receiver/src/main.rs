//! InputLink receiver: entry point.
//!
//! ```text
//! inputlink-receiver                   Run with inputlink-receiver.toml (or defaults)
//! inputlink-receiver --config <path>   Load a custom config TOML
//! inputlink-receiver --port <port>     Override the listen port
//! inputlink-receiver --gen-config      Write default config to stdout
//! ```

use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use inputlink_receiver::config::ReceiverAppConfig;
use inputlink_receiver::service::ReceiverService;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "inputlink-receiver",
    about = "Accept forwarded controllers and expose them as virtual devices"
)]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "inputlink-receiver.toml")]
    config: PathBuf,

    /// Listen port (overrides config).
    #[arg(short, long)]
    port: Option<u16>,

    /// Maximum live virtual devices (overrides config).
    #[arg(long)]
    max_devices: Option<usize>,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // --gen-config: dump defaults and exit.
    if cli.gen_config {
        println!("{}", ReceiverAppConfig::default_toml()?);
        return Ok(());
    }

    // Load config.
    let mut config = ReceiverAppConfig::load(&cli.config);
    if let Some(port) = cli.port {
        config.receiver.listen_port = port;
    }
    if let Some(max) = cli.max_devices {
        config.receiver.max_virtual_devices = max;
    }

    // Init tracing.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("inputlink-receiver v{}", env!("CARGO_PKG_VERSION"));
    info!("listen address: {}", config.receiver.listen_addr());
    info!("session timeout: {:?}", config.receiver.session_timeout());

    let service = ReceiverService::new(config);
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
