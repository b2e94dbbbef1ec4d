use clap::ValueEnum;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }

    pub fn to_filter(self) -> LevelFilter {
        match self {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct LogConfig {
    pub level: LogLevel,
    /// Log to this file instead of stderr, which the terminal bridge shares.
    pub file: Option<PathBuf>,
}

#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error("failed to open log file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to configure logger: {0}")]
    Configure(String),
}

static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Install the global subscriber. Later calls are no-ops.
pub fn init(config: &LogConfig) -> Result<(), InitError> {
    if GUARD.get().is_some() {
        return Ok(());
    }

    let (env_filter, throttled_deps) = build_env_filter(config.level.to_filter());

    let (writer, guard) = match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| InitError::Io {
                    path: path.clone(),
                    source,
                })?;
            tracing_appender::non_blocking(file)
        }
        None => tracing_appender::non_blocking(std::io::stderr()),
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_level(true)
        .with_target(config.level >= LogLevel::Debug)
        .with_thread_ids(config.level >= LogLevel::Trace)
        .with_ansi(config.file.is_none())
        .with_writer(writer)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|err| InitError::Configure(err.to_string()))?;

    let _ = GUARD.set(guard);
    if throttled_deps {
        tracing::info!(
            target: "webtty::telemetry",
            "suppressing dependency trace noise; set WEBTTY_TRACE_DEPS=1 or WEBTTY_LOG_FILTER to override"
        );
    }
    Ok(())
}

fn build_env_filter(level: LevelFilter) -> (EnvFilter, bool) {
    if let Ok(filter) = std::env::var("WEBTTY_LOG_FILTER") {
        return (EnvFilter::new(filter), false);
    }
    if let Ok(filter) = std::env::var("RUST_LOG") {
        return (EnvFilter::new(filter), false);
    }
    let allow_deps = super::env_truthy("WEBTTY_TRACE_DEPS").unwrap_or(false);
    let (filter, throttled) = default_filter_for(level, allow_deps);
    (EnvFilter::new(filter), throttled)
}

const TRACE_DEP_TARGETS: &[&str] = &[
    "webrtc",
    "webrtc_ice",
    "webrtc_sctp",
    "webrtc_dtls",
    "webrtc_mdns",
    "tokio_tungstenite",
    "tungstenite",
    "rustls",
    "mio",
];

fn default_filter_for(level: LevelFilter, allow_deps: bool) -> (String, bool) {
    let base = match level {
        LevelFilter::TRACE => "info,webtty=trace,webtty_core=trace",
        LevelFilter::DEBUG => "info,webtty=debug,webtty_core=debug",
        LevelFilter::INFO => "info",
        LevelFilter::WARN => "warn",
        LevelFilter::ERROR => "error",
        LevelFilter::OFF => "off",
    };
    if level >= LevelFilter::DEBUG && !allow_deps {
        let mut filter = base.to_owned();
        for target in TRACE_DEP_TARGETS {
            filter.push(',');
            filter.push_str(target);
            filter.push_str("=warn");
        }
        (filter, true)
    } else {
        (base.to_owned(), false)
    }
}
