use std::path::PathBuf;

use clap::Parser;
use dr_proxy::{run_server, Config};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, Parser)]
#[command(name = "dr_proxy")]
#[command(
    about = "UDP reverse proxy and load balancer with route-based upstream selection, weighted and consistent-hash peer selection, and active health checking"
)]
struct Args {
    #[arg(long, default_value = "config/dev.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = Config::from_file(&args.config)?;

    let shutdown = CancellationToken::new();
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_shutdown.cancel();
        }
    });

    run_server(config, shutdown).await
}
