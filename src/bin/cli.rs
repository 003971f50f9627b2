//! linkterm CLI - interactive terminal for serial, WebSocket and BLE links
//!
//! Lines typed on stdin are sent to the device; lines starting with `/` are
//! commands. Received data goes to stdout, everything else to stderr.

use anyhow::Context;
use bytes::Bytes;
use clap::{Parser, Subcommand, ValueEnum};
use futures::StreamExt;
use linkterm_core::cli::{exit_code_for, ExitCodes};
use linkterm_core::config::{self, AppConfig, LineEnding};
use linkterm_core::core::codec::{self, DisplayMode};
use linkterm_core::core::logger::{EntryKind, ExportFormat, LogEntry};
use linkterm_core::core::rate::LineRate;
use linkterm_core::core::session::{Session, SessionEvent, SessionState};
use linkterm_core::core::transport::{
    list_ports, BleCandidate, BleConfig, DeviceSelector, FirstCandidate, SerialFlowControl,
    SerialParity, SocketConfig, SystemConnector, TransportConfig,
};
use linkterm_core::utils::clipboard::{NativeClipboard, SelectionClipboard};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// How received data is printed
#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    /// Decoded text
    Text,
    /// Hex pairs
    Hex,
    /// One JSON object per entry
    Json,
}

/// linkterm CLI
#[derive(Parser, Debug)]
#[command(
    name = "linkterm",
    version,
    about = "Interactive terminal for serial, WebSocket and Bluetooth LE links",
    long_about = None
)]
struct Cli {
    /// Increase diagnostic output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Also write diagnostics to a daily log file in this directory
    #[arg(long, env = "LINKTERM_LOG_DIR", global = true)]
    log_dir: Option<PathBuf>,

    /// Received data format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text, global = true)]
    format: OutputFormat,

    /// Prefix printed entries with a timestamp
    #[arg(long, global = true)]
    timestamps: bool,

    /// Echo sent data to stderr
    #[arg(long, global = true)]
    echo: bool,

    /// Line ending appended to typed lines (none, cr, lf, crlf)
    #[arg(long, global = true)]
    line_ending: Option<LineEnding>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List available serial ports
    ListPorts {
        /// Show detailed info
        #[arg(short, long)]
        detailed: bool,
    },

    /// Connect to a serial port
    Serial {
        /// Serial port name (e.g., COM3, /dev/ttyUSB0)
        port: String,

        /// Baud rate
        #[arg(short, long)]
        baud: Option<u32>,

        /// Data bits (7, 8)
        #[arg(long)]
        data_bits: Option<u8>,

        /// Parity (none, odd, even)
        #[arg(long)]
        parity: Option<SerialParity>,

        /// Stop bits (1, 2)
        #[arg(long)]
        stop_bits: Option<u8>,

        /// Flow control (none, hardware)
        #[arg(long)]
        flow: Option<SerialFlowControl>,
    },

    /// Connect to a WebSocket server
    Socket {
        /// ws:// or wss:// URL; defaults to the last one used
        url: Option<String>,

        /// Handshake timeout (seconds)
        #[arg(long, default_value = "10")]
        timeout: u64,
    },

    /// Connect to a Bluetooth LE characteristic
    Ble {
        /// Service UUID; defaults to the last one used
        #[arg(long)]
        service: Option<String>,

        /// Characteristic UUID; defaults to the last one used
        #[arg(long)]
        characteristic: Option<String>,

        /// Only consider the device with exactly this name or address
        #[arg(long)]
        device: Option<String>,

        /// Scan duration (seconds)
        #[arg(long, default_value = "3")]
        scan: u64,

        /// Take the first device found instead of asking
        #[arg(long)]
        first: bool,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Print the config file location
    Path,
    /// Restore defaults
    Reset,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let _log_guard = init_tracing(cli.verbose, cli.log_dir.as_deref());

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::from(ExitCodes::ERROR)
        }
    }
}

fn init_tracing(verbose: u8, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let stderr = tracing_subscriber::fmt::layer()
        .with_writer(io::stderr)
        .with_target(false);

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "linkterm.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .with(file)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(filter).with(stderr).init();
            None
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<u8> {
    let mut app = AppConfig::load().unwrap_or_else(|e| {
        tracing::warn!("Using default config: {}", e);
        AppConfig::default()
    });

    let (transport, selector): (TransportConfig, Arc<dyn DeviceSelector>) = match &cli.command {
        Commands::ListPorts { detailed } => {
            print_ports(*detailed)?;
            return Ok(ExitCodes::SUCCESS);
        }
        Commands::Config { action } => {
            handle_config(action, &app)?;
            return Ok(ExitCodes::SUCCESS);
        }
        Commands::Serial {
            port,
            baud,
            data_bits,
            parity,
            stop_bits,
            flow,
        } => {
            let mut serial = app.serial_config(port);
            if let Some(baud) = baud {
                serial.baud_rate = *baud;
            }
            if let Some(bits) = data_bits {
                serial.data_bits = *bits;
            }
            if let Some(parity) = parity {
                serial.parity = *parity;
            }
            if let Some(bits) = stop_bits {
                serial.stop_bits = *bits;
            }
            if let Some(flow) = flow {
                serial.flow_control = *flow;
            }
            (TransportConfig::Serial(serial), Arc::new(FirstCandidate))
        }
        Commands::Socket { url, timeout } => {
            let url = url
                .clone()
                .or_else(|| app.preferences.last_socket_url.clone())
                .context("no URL given and none remembered")?;
            (
                TransportConfig::Socket(SocketConfig::new(&url).timeout(*timeout)),
                Arc::new(FirstCandidate),
            )
        }
        Commands::Ble {
            service,
            characteristic,
            device,
            scan,
            first,
        } => {
            let saved = app.ble_config();
            let mut ble = BleConfig::new(
                service.as_deref().unwrap_or(&saved.service_uuid),
                characteristic.as_deref().unwrap_or(&saved.characteristic_uuid),
            );
            if let Some(name) = device {
                ble = ble.device(name);
            }
            ble.scan_secs = *scan;
            let selector: Arc<dyn DeviceSelector> = if *first {
                Arc::new(FirstCandidate)
            } else {
                Arc::new(PromptSelector)
            };
            (TransportConfig::Ble(ble), selector)
        }
    };

    let session = Session::new(
        app.session_config(transport.clone()),
        Arc::new(SystemConnector::with_selector(selector)),
    );

    let printer = tokio::spawn(print_entries(
        session.log().subscribe(),
        cli.format,
        cli.timestamps,
        cli.echo,
    ));

    if let Err(e) = session.connect().await {
        printer.abort();
        if !e.is_user_cancelled() {
            eprintln!("Error: {e}");
        }
        return Ok(exit_code_for(&e));
    }

    app.remember(&transport);
    if let Err(e) = app.save() {
        tracing::warn!("Could not save config: {}", e);
    }

    let line_ending = cli.line_ending.unwrap_or(app.preferences.line_ending);
    let code = interactive(&session, &app, line_ending).await;

    session.disconnect().await;
    // Let the printer flush the closing entries.
    tokio::task::yield_now().await;
    printer.abort();
    Ok(code)
}

fn print_ports(detailed: bool) -> anyhow::Result<()> {
    let ports = list_ports()?;
    if ports.is_empty() {
        eprintln!("No serial ports found.");
        return Ok(());
    }
    for port in &ports {
        if detailed {
            println!("{:<24} {:?}", port.port_name, port.port_type);
        } else {
            println!("{}", port.port_name);
        }
    }
    Ok(())
}

fn handle_config(action: &ConfigAction, app: &AppConfig) -> anyhow::Result<()> {
    match action {
        ConfigAction::Show => print!("{}", app.to_toml()?),
        ConfigAction::Path => {
            let path = config::config_file().context("no config directory on this system")?;
            println!("{}", path.display());
        }
        ConfigAction::Reset => {
            let path = AppConfig::default().save()?;
            eprintln!("Defaults written to {}", path.display());
        }
    }
    Ok(())
}

/// Asks on stderr/stdin which scanned device to use
struct PromptSelector;

impl DeviceSelector for PromptSelector {
    fn select(&self, candidates: &[BleCandidate]) -> Option<usize> {
        eprintln!("Devices found:");
        for (i, c) in candidates.iter().enumerate() {
            let rssi = c.rssi.map_or_else(|| "N/A".to_string(), |r| format!("{r} dBm"));
            eprintln!("  [{}] {:<30} {:<20} {:>8}", i + 1, c.name, c.address, rssi);
        }
        eprint!("Select device (empty to cancel): ");
        let _ = io::stderr().flush();

        let mut line = String::new();
        io::stdin().lock().read_line(&mut line).ok()?;
        let choice: usize = line.trim().parse().ok()?;
        (1..=candidates.len()).contains(&choice).then(|| choice - 1)
    }
}

async fn print_entries(
    mut rx: tokio::sync::broadcast::Receiver<LogEntry>,
    format: OutputFormat,
    timestamps: bool,
    echo: bool,
) {
    loop {
        let entry = match rx.recv().await {
            Ok(entry) => entry,
            Err(RecvError::Lagged(n)) => {
                eprintln!("[{n} entries skipped]");
                continue;
            }
            Err(RecvError::Closed) => return,
        };

        match entry.kind {
            EntryKind::Received => {
                let mut out = io::stdout().lock();
                let _ = match format {
                    OutputFormat::Text if timestamps => writeln!(out, "{}", entry.to_line(true)),
                    OutputFormat::Text => write!(out, "{}", entry.text),
                    OutputFormat::Hex => {
                        writeln!(out, "{}", codec::encode(&entry.data, DisplayMode::Hex))
                    }
                    OutputFormat::Json => writeln!(out, "{}", entry_json(&entry)),
                };
                let _ = out.flush();
            }
            EntryKind::Sent if echo => eprintln!("{}", entry.to_line(timestamps)),
            EntryKind::Sent => {}
            EntryKind::Info | EntryKind::Error => eprintln!("{}", entry.to_line(timestamps)),
        }
    }
}

fn entry_json(entry: &LogEntry) -> serde_json::Value {
    serde_json::json!({
        "id": entry.id,
        "timestamp": entry.timestamp.to_rfc3339(),
        "hex": hex::encode(&entry.data),
        "text": entry.text,
    })
}

enum Command<'a> {
    Pause,
    Resume,
    File(&'a str),
    Quick(&'a str),
    Hex(&'a str),
    Export(&'a str),
    Copy,
    Clear,
    Stats,
    Quit,
    Help,
}

fn parse_command(line: &str) -> Option<Command<'_>> {
    let rest = line.strip_prefix('/')?;
    let (name, arg) = rest.split_once(' ').unwrap_or((rest, ""));
    let arg = arg.trim();
    Some(match name {
        "pause" => Command::Pause,
        "resume" => Command::Resume,
        "file" => Command::File(arg),
        "quick" => Command::Quick(arg),
        "hex" => Command::Hex(arg),
        "export" => Command::Export(arg),
        "copy" => Command::Copy,
        "clear" => Command::Clear,
        "stats" => Command::Stats,
        "quit" | "exit" => Command::Quit,
        _ => Command::Help,
    })
}

const HELP: &str = "Commands: /pause /resume /file <path> /quick <n> /hex <digits> \
/export txt|bin /copy /clear /stats /quit";

async fn interactive(session: &Session, app: &AppConfig, line_ending: LineEnding) -> u8 {
    let mut lines = FramedRead::new(tokio::io::stdin(), LinesCodec::new());
    let mut events = session.subscribe();
    let rate = LineRate::start(&session.log());

    loop {
        tokio::select! {
            line = lines.next() => {
                let Some(Ok(line)) = line else {
                    return ExitCodes::SUCCESS;
                };
                if let Some(command) = parse_command(&line) {
                    if matches!(command, Command::Quit) {
                        return ExitCodes::SUCCESS;
                    }
                    run_command(session, app, command, &rate);
                } else {
                    let input = format!("{}{}", line, line_ending.as_str());
                    // Errors are already in the log and printed from there.
                    let _ = session.send_text(&input, DisplayMode::Text);
                }
            }
            event = events.recv() => match event {
                Ok(SessionEvent::StateChanged(SessionState::Disconnected)) => {
                    return ExitCodes::LINK_LOST;
                }
                Ok(SessionEvent::StateChanged(state)) => {
                    tracing::debug!("Session {}", state);
                }
                Ok(SessionEvent::TransferProgress(p)) => {
                    eprint!("\rTransfer {:>3}% ({}/{} bytes)", p.percent, p.sent, p.total);
                    if p.sent == p.total {
                        eprintln!();
                    }
                }
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => return ExitCodes::ERROR,
            },
            _ = tokio::signal::ctrl_c() => return ExitCodes::SUCCESS,
        }
    }
}

fn run_command(session: &Session, app: &AppConfig, command: Command<'_>, rate: &LineRate) {
    match command {
        Command::Pause => {
            let _ = session.pause();
        }
        Command::Resume => {
            let _ = session.resume();
        }
        Command::File(path) => {
            let path = PathBuf::from(path);
            let session = session.clone();
            tokio::spawn(async move {
                let data = match tokio::fs::read(&path).await {
                    Ok(data) => data,
                    Err(e) => {
                        session.log().error(format!("Cannot read {}: {}", path.display(), e));
                        return;
                    }
                };
                let name = path.file_name().map_or_else(
                    || path.display().to_string(),
                    |n| n.to_string_lossy().into_owned(),
                );
                let _ = session.send_file(&name, Bytes::from(data)).await;
            });
        }
        Command::Quick(n) => {
            let quick = &app.preferences.quick_send;
            let picked = n
                .parse::<usize>()
                .ok()
                .and_then(|i| i.checked_sub(1))
                .and_then(|i| quick.get(i));
            match picked {
                Some(cmd) => {
                    let _ = session.send_quick(cmd);
                }
                None => {
                    for (i, cmd) in quick.iter().enumerate() {
                        eprintln!("  {}: {} ({:?})", i + 1, cmd.label, cmd.mode);
                    }
                }
            }
        }
        Command::Hex(digits) => {
            let _ = session.send_text(digits, DisplayMode::Hex);
        }
        Command::Export(format) => {
            let format = format.parse::<ExportFormat>().unwrap_or_default();
            let artifact = session.export(format);
            let dir = config::log_dir().unwrap_or_else(|| PathBuf::from("."));
            let written = std::fs::create_dir_all(&dir).and_then(|()| artifact.write_to(&dir));
            match written {
                Ok(path) => eprintln!("Saved {}", path.display()),
                Err(e) => {
                    session.log().error(format!("Export failed: {e}"));
                }
            }
        }
        Command::Copy => {
            if session.copy_log(&NativeClipboard, &SelectionClipboard::stdout()).is_ok() {
                eprintln!("Log copied to clipboard");
            }
        }
        Command::Clear => session.clear_log(),
        Command::Stats => {
            let log = session.log();
            eprintln!(
                "state: {} | entries: {} | data: {}/{} bytes | {} lines/s",
                session.state(),
                log.len(),
                log.total_bytes(),
                log.ceiling(),
                rate.lines_per_period()
            );
            if let Some(stats) = session.stats() {
                eprintln!(
                    "link: {} sent, {} received, up {}s",
                    stats.bytes_sent, stats.bytes_received, stats.uptime_secs
                );
            }
            let queue = session.queue_stats();
            eprintln!("queue: {} written, {} failed", queue.written, queue.failed);
        }
        Command::Quit => {}
        Command::Help => eprintln!("{HELP}"),
    }
}
