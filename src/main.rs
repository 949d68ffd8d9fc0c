use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use tokio::sync::watch;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use tftpd_rs::config::{DEFAULT_MAX_RETRIES, TFTP_PORT};
use tftpd_rs::{Server, ServerConfig};

/// A TFTP server with option negotiation and windowed transfers.
#[derive(Parser, Debug)]
#[command(name = "tftpd-rs", version, about)]
struct Cli {
    /// Address to listen on.
    #[arg(long, env = "TFTPD_HOST", default_value = "0.0.0.0")]
    host: IpAddr,

    /// UDP port to listen on.
    #[arg(short, long, env = "TFTPD_PORT", default_value_t = TFTP_PORT)]
    port: u16,

    /// Directory to serve / receive files.
    #[arg(short, long, env = "TFTPD_ROOT", default_value = ".")]
    dir: PathBuf,

    /// Accept write requests.
    #[arg(short = 'u', long, env = "TFTPD_ALLOW_UPLOAD")]
    allow_upload: bool,

    /// Receive timeout inside a transfer, in milliseconds.
    #[arg(short, long, env = "TFTPD_TIMEOUT_MS", default_value_t = 1500)]
    timeout_ms: u64,

    /// Retransmissions before a silent peer is dropped.
    #[arg(short, long, env = "TFTPD_MAX_RETRIES", default_value_t = DEFAULT_MAX_RETRIES)]
    retries: u32,

    /// Reply from the transfer port directly instead of announcing it with
    /// an ACK(port) from the listener.
    #[arg(long, env = "TFTPD_NO_PORT_HANDOFF")]
    no_port_handoff: bool,

    /// Log filter, e.g. `info` or `tftpd_rs=debug`.
    #[arg(long, env = "TFTPD_LOG", default_value = "info")]
    log_level: String,

    /// Optional file path to write logs to.
    #[arg(short, long, env = "TFTPD_LOG_FILE")]
    log_file: Option<PathBuf>,
}

fn init_logging(cli: &Cli) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log filter {:?}", cli.log_level))?;

    let Some(log_file) = cli.log_file.as_ref() else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        return Ok(None);
    };

    let dir = log_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| std::path::Path::new("."));
    let file_name = log_file
        .file_name()
        .ok_or_else(|| anyhow!("log file {} has no file name", log_file.display()))?;
    let file_appender = tracing_appender::rolling::never(dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(non_blocking)
        .with_ansi(false)
        .init();

    Ok(Some(guard))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_logging(&cli)?;

    let root_dir = std::fs::canonicalize(&cli.dir)
        .with_context(|| format!("cannot open directory {}", cli.dir.display()))?;

    let config = ServerConfig {
        bind_addr: SocketAddr::new(cli.host, cli.port),
        root_dir,
        allow_upload: cli.allow_upload,
        timeout: Duration::from_millis(cli.timeout_ms),
        max_retries: cli.retries,
        port_handoff: !cli.no_port_handoff,
    };

    let server = Server::bind(config).await?;

    // Shutdown signal: Ctrl-C -> server.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let run = server.run(shutdown_rx);
    tokio::pin!(run);

    tokio::select! {
        result = &mut run => return result,
        signal = tokio::signal::ctrl_c() => {
            signal.context("cannot listen for Ctrl-C")?;
            info!("Closing server...");
        }
    }

    let _ = shutdown_tx.send(true);
    run.await
}
