use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;
use webtty_relay::{serve, RelayConfig};

#[derive(Parser, Debug)]
#[command(
    name = "webtty-relay",
    about = "Relay webtty signaling between peers sharing a room",
    version
)]
struct Cli {
    #[arg(long, env = "WEBTTY_RELAY_BIND", help = "Address to listen on")]
    bind: Option<IpAddr>,

    #[arg(long, short = 'p', env = "WEBTTY_RELAY_PORT", help = "Port to listen on")]
    port: Option<u16>,

    #[arg(
        long = "static-dir",
        value_name = "DIR",
        env = "WEBTTY_RELAY_STATIC_DIR",
        help = "Directory served under /static/"
    )]
    static_dir: Option<PathBuf>,

    #[arg(long, help = "Echo data frames back to their sender")]
    echo: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,webtty_relay=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let mut config = RelayConfig::from_env();
    if let Some(bind) = cli.bind {
        config.bind = bind;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(dir) = cli.static_dir {
        config.static_dir = dir;
    }
    config.echo |= cli.echo;

    let addr = config.addr();
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    serve(listener, config).await
}
