use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use rover_link::config::LinkConfig;

/// Poll a rover's master controller and log board telemetry
#[derive(Parser, Debug)]
#[command(name = "rover-link")]
#[command(version)]
struct Args {
    /// JSON link configuration; flags below override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Serial port of the master
    #[arg(short, long)]
    port: Option<String>,

    #[arg(short, long)]
    baud: Option<u32>,

    /// Poll a simulated rover instead of the serial port
    #[arg(long)]
    sim: bool,

    /// Poll rate
    #[arg(long)]
    hz: Option<u64>,
}

#[tokio::main]
async fn main() {
    // Setup logging (set RUST_LOG=info or debug)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init(); // installs the subscriber globally

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => match LinkConfig::load(path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("Config error in {}: {}", path.display(), e);
                std::process::exit(1);
            }
        },
        None => LinkConfig::default(),
    };
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(baud) = args.baud {
        config.baud = baud;
    }
    if let Some(hz) = args.hz {
        config.loop_hz = hz;
    }
    config.simulate |= args.sim;
    info!("Link config: {:?}", config);

    if let Err(e) = rover_link::runtime::run(config).await {
        eprintln!("Runtime error: {}", e);
        std::process::exit(1);
    }
}
