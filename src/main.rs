use std::path::PathBuf;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal;
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use keylimit::config::{Algorithm, KeylimitConfig};
use keylimit::facade::{Gate, PathExtractor};
use keylimit::ratelimit::Admission;

/// Reads JSON request records from stdin and prints one admission decision per line.
#[derive(Debug, Parser)]
#[command(name = "keylimit", version, about)]
struct Args {
    /// YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Counter algorithm (token-bucket or window)
    #[arg(short, long, value_parser = parse_algorithm)]
    algorithm: Option<Algorithm>,

    /// Dotted path of the rate limit key inside each record
    #[arg(short, long)]
    key: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

fn parse_algorithm(s: &str) -> Result<Algorithm, String> {
    s.parse()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if args.json_logs {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!("Starting keylimit");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = KeylimitConfig::load(args.config.as_deref())?;
    if let Some(algorithm) = args.algorithm {
        config.facade.algorithm = algorithm;
    }
    if let Some(key) = args.key {
        config.facade.key = key;
    }

    let gate = Gate::from_config(&config)?;

    tokio::select! {
        result = process_stdin(&gate) => result?,
        _ = shutdown_signal() => {},
    }

    gate.shutdown();
    info!("keylimit stopped");
    Ok(())
}

/// Answer every record on stdin until EOF.
async fn process_stdin(gate: &Gate<dyn Admission, PathExtractor>) -> anyhow::Result<()> {
    let mut lines = LinesStream::new(BufReader::new(tokio::io::stdin()).lines());
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next().await {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let record: serde_json::Value = match serde_json::from_str(&line) {
            Ok(record) => record,
            Err(e) => {
                warn!(error = %e, "Skipping malformed record");
                continue;
            }
        };

        let output = match gate.check(&record) {
            Ok(verdict) => serde_json::to_string(&verdict)?,
            Err(e) => {
                warn!(error = %e, "Rejecting record");
                serde_json::json!({ "allowed": false, "error": e.to_string() }).to_string()
            }
        };

        stdout.write_all(output.as_bytes()).await?;
        stdout.write_all(b"\n").await?;
        stdout.flush().await?;
    }

    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
