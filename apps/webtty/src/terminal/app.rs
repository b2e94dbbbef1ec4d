use std::io::{IsTerminal, Read, Write};

use bytes::Bytes;
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use tokio::io::AsyncWriteExt;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::session::{SessionEvent, SessionInput, SessionState, TerminalSession};
use crate::telemetry::logging;
use crate::terminal::cli::{Cli, Command, ConnectArgs};
use crate::terminal::error::CliError;

/// Ctrl-] detaches from the remote terminal.
const DETACH_BYTE: u8 = 0x1d;

pub async fn run(cli: Cli) -> Result<(), CliError> {
    let log_config = cli.logging.to_config();
    logging::init(&log_config).map_err(|err| CliError::Logging(err.to_string()))?;
    debug!(target: "webtty::terminal", log_level = ?log_config.level, log_file = ?log_config.file, "logging configured");

    match cli.command {
        Command::Connect(args) => connect(args).await,
    }
}

async fn connect(args: ConnectArgs) -> Result<(), CliError> {
    let config = args.apply(SessionConfig::from_env());
    info!(
        target: "webtty::terminal",
        endpoint = %config.endpoint,
        peer_mode = %config.peer_mode,
        "connecting"
    );
    let mut session = TerminalSession::start(config)?;

    let interactive = std::io::stdin().is_terminal();
    let raw = RawModeGuard::new(interactive);
    let (detach_tx, mut detach_rx) = oneshot::channel();
    spawn_stdin_pump(session.input_sender(), detach_tx);

    let mut stdout = tokio::io::stdout();
    let mut failure = None;
    let mut stdin_open = true;
    loop {
        tokio::select! {
            event = session.next_event() => {
                let Some(event) = event else { break };
                match event {
                    SessionEvent::Output(bytes) => {
                        stdout.write_all(&bytes).await?;
                        stdout.flush().await?;
                    }
                    SessionEvent::StateChanged(state) => {
                        if let Some(message) = state_notice(state) {
                            notice(raw.is_active(), message);
                        }
                    }
                    SessionEvent::TransportDegraded { reason } => {
                        notice(
                            raw.is_active(),
                            &format!("WebRTC DataChannel closed ({reason}); continuing over WebSocket"),
                        );
                    }
                    SessionEvent::Error(err) => {
                        warn!(target: "webtty::terminal", error = %err, "session error");
                        notice(raw.is_active(), &format!("error: {err}"));
                        if matches!(err, SessionError::Connection(_) | SessionError::TransportExhausted) {
                            failure = Some(err);
                        }
                    }
                }
            }
            detached = &mut detach_rx, if stdin_open => {
                stdin_open = false;
                if detached.is_ok() {
                    debug!(target: "webtty::terminal", "detach requested");
                    failure = None;
                    break;
                }
            }
        }
    }

    session.close().await;
    let was_raw = raw.is_active();
    drop(raw);
    notice(was_raw, "Connection closed");

    match failure {
        Some(err) => Err(err.into()),
        None => Ok(()),
    }
}

fn state_notice(state: SessionState) -> Option<&'static str> {
    match state {
        SessionState::SignalingActive => Some("Connected to WebTTY"),
        SessionState::Negotiating => Some("Negotiating WebRTC DataChannel"),
        SessionState::PeerActive => Some("WebRTC DataChannel open"),
        SessionState::Degraded => Some("Using WebSocket fallback"),
        SessionState::Connecting | SessionState::Closed => None,
    }
}

fn notice(raw: bool, message: &str) {
    let mut stderr = std::io::stderr().lock();
    let _ = if raw {
        write!(stderr, "\r\n[webtty] {message}\r\n")
    } else {
        writeln!(stderr, "[webtty] {message}")
    };
    let _ = stderr.flush();
}

/// Forward stdin to the session from a plain thread so a pending read never
/// holds up runtime shutdown.
fn spawn_stdin_pump(input: SessionInput, detach: oneshot::Sender<()>) {
    let spawned = std::thread::Builder::new()
        .name("webtty-stdin".into())
        .spawn(move || {
            pump_input(std::io::stdin().lock(), |bytes| input.send(bytes).is_ok(), detach);
        });
    if let Err(err) = spawned {
        warn!(target: "webtty::terminal", error = %err, "failed to start stdin reader");
    }
}

/// Copy `reader` into `forward` until EOF, a read error or the detach byte.
/// Only the detach byte fires `detach`; EOF leaves the session running.
fn pump_input<R: Read>(
    mut reader: R,
    mut forward: impl FnMut(Bytes) -> bool,
    detach: oneshot::Sender<()>,
) {
    let mut buf = [0u8; 4096];
    loop {
        let read = match reader.read(&mut buf) {
            Ok(0) => {
                debug!(target: "webtty::terminal", "stdin closed");
                return;
            }
            Ok(read) => read,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => {
                warn!(target: "webtty::terminal", error = %err, "stdin read failed");
                return;
            }
        };
        let chunk = &buf[..read];
        let (head, detached) = match chunk.iter().position(|byte| *byte == DETACH_BYTE) {
            Some(index) => (&chunk[..index], true),
            None => (chunk, false),
        };
        if !head.is_empty() && !forward(Bytes::copy_from_slice(head)) {
            return;
        }
        if detached {
            let _ = detach.send(());
            return;
        }
    }
}

struct RawModeGuard(bool);

impl RawModeGuard {
    fn new(enable: bool) -> Self {
        if enable {
            match enable_raw_mode() {
                Ok(()) => Self(true),
                Err(err) => {
                    eprintln!("failed to enable raw mode: {err}");
                    Self(false)
                }
            }
        } else {
            Self(false)
        }
    }

    fn is_active(&self) -> bool {
        self.0
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if self.0 {
            let _ = disable_raw_mode();
        }
    }
}
