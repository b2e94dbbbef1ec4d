use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};
use std::path::PathBuf;
use std::time::Duration;

use crate::config::{PeerMode, SessionConfig};
use crate::telemetry::logging::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "webtty",
    about = "Attach to a remote terminal over WebSocket signaling with a WebRTC fast path",
    author,
    version
)]
pub struct Cli {
    #[command(flatten)]
    pub logging: LoggingArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        global = true,
        env = "WEBTTY_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        global = true,
        env = "WEBTTY_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Connect to a signaling endpoint and bridge the local terminal to it
    Connect(ConnectArgs),
}

#[derive(Args, Debug, Clone, Default)]
pub struct ConnectArgs {
    #[arg(
        value_name = "ENDPOINT",
        help = "Signaling endpoint (host:port, ws:// or wss:// URL); defaults to WEBTTY_ENDPOINT or localhost:8080/ws"
    )]
    pub endpoint: Option<String>,

    #[arg(
        long = "peer-mode",
        value_enum,
        help = "Whether to stay on WebSocket only, answer remote offers, or offer a peer channel ourselves"
    )]
    pub peer_mode: Option<PeerMode>,

    #[arg(
        long = "connect-timeout-ms",
        value_name = "MS",
        help = "Abort the signaling connection attempt after this many milliseconds"
    )]
    pub connect_timeout_ms: Option<u64>,

    #[arg(
        long = "negotiation-timeout-ms",
        value_name = "MS",
        help = "Give up on a peer negotiation after this many milliseconds"
    )]
    pub negotiation_timeout_ms: Option<u64>,

    #[arg(
        long = "retry-queue",
        value_name = "FRAMES",
        help = "Maximum number of outbound frames held while no transport is writable"
    )]
    pub retry_queue: Option<usize>,

    #[arg(
        long = "ice-server",
        value_name = "URL",
        help = "STUN/TURN server URL used for peer negotiation (repeatable)"
    )]
    pub ice_servers: Vec<String>,

    #[arg(
        long = "no-stun",
        num_args = 0..=1,
        default_missing_value = "true",
        value_parser = BoolishValueParser::new(),
        help = "Do not use any ICE servers (host candidates only)"
    )]
    pub no_stun: Option<bool>,
}

impl ConnectArgs {
    /// Apply command line overrides on top of an environment-derived config.
    pub fn apply(&self, base: SessionConfig) -> SessionConfig {
        let mut builder = base.to_builder();
        if let Some(endpoint) = &self.endpoint {
            builder = builder.endpoint(endpoint.clone());
        }
        if let Some(mode) = self.peer_mode {
            builder = builder.peer_mode(mode);
        }
        if let Some(ms) = self.connect_timeout_ms {
            builder = builder.connect_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = self.negotiation_timeout_ms {
            builder = builder.negotiation_timeout(Duration::from_millis(ms));
        }
        if let Some(capacity) = self.retry_queue {
            builder = builder.retry_queue_capacity(capacity);
        }
        if !self.ice_servers.is_empty() {
            builder = builder.ice_servers(self.ice_servers.clone());
        }
        if self.no_stun == Some(true) {
            builder = builder.ice_servers(Vec::<String>::new());
        }
        builder.build()
    }
}

pub fn parse() -> Cli {
    Cli::parse()
}
