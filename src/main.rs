//! `triplegate` server binary
//!
//! ```bash
//! # Serve an N-Triples file on the configured port
//! triplegate --index data.nt
//!
//! # Custom address and an access token for administrative commands
//! triplegate --index data.nt --host 0.0.0.0 --port 7001 --access-token secret
//! ```
//!
//! Settings not given on the command line come from `config.toml`,
//! `config.local.toml` and `TRIPLEGATE_*` environment variables.

use std::env;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use anyhow::Context;
use clap::Parser;

use triplegate::config::LoggingConfig;
use triplegate::protocol::rest;
use triplegate::{Config, Server};

static TRACE_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();

#[derive(Debug, Parser)]
#[command(name = "triplegate", version, about = "SPARQL query server")]
struct Args {
    /// Configuration file (instead of config.toml / config.local.toml)
    #[arg(long)]
    config: Option<String>,

    /// N-Triples file to serve
    #[arg(short, long)]
    index: Option<PathBuf>,

    #[arg(long)]
    host: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    /// Token that unlocks administrative commands
    #[arg(long)]
    access_token: Option<String>,

    /// Queries executed concurrently (0 = one per CPU)
    #[arg(short = 'j', long)]
    num_threads: Option<usize>,
}

impl Args {
    fn apply(self, config: &mut Config) {
        if let Some(index) = self.index {
            config.index.path = Some(index);
        }
        if let Some(host) = self.host {
            config.server.host = host;
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(token) = self.access_token {
            config.server.access_token = Some(token);
        }
        if let Some(num_threads) = self.num_threads {
            config.server.num_threads = num_threads;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Could not load configuration from {path}"))?,
        None => Config::load().context("Could not load configuration")?,
    };
    args.apply(&mut config);

    init_tracing(&config.logging);
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        host = %config.server.host,
        port = config.server.port,
        num_threads = config.effective_num_threads(),
        "starting"
    );

    let server = Arc::new(Server::from_config(config.clone()).context("Could not start the server")?);
    rest::start_http_server(server, &config)
        .await
        .map_err(|e| anyhow::anyhow!("HTTP server failed: {e}"))?;
    Ok(())
}

fn init_tracing(logging_config: &LoggingConfig) {
    // TRIPLEGATE_LOG takes precedence over the configured level
    let level = env::var("TRIPLEGATE_LOG")
        .ok()
        .unwrap_or_else(|| logging_config.level.clone());
    let json = logging_config.format == "json";

    let (non_blocking, guard) = match &logging_config.file {
        Some(path) => {
            match std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
            {
                Ok(file) => tracing_appender::non_blocking(file),
                Err(e) => {
                    eprintln!("ERROR: Unable to open log file '{}': {e}", path.display());
                    tracing_appender::non_blocking(std::io::stderr())
                }
            }
        }
        None => tracing_appender::non_blocking(std::io::stderr()),
    };
    let _ = TRACE_GUARD.set(guard);

    let filter = tracing_subscriber::EnvFilter::try_new(level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let ansi = logging_config.file.is_none() && !json;

    let base = || {
        tracing_subscriber::fmt()
            .with_env_filter(filter.clone())
            .with_ansi(ansi)
            .with_thread_names(true)
            .with_writer(non_blocking.clone())
    };

    let subscriber: Box<dyn tracing::Subscriber + Send + Sync> = if json {
        Box::new(base().json().finish())
    } else {
        Box::new(base().compact().finish())
    };

    let _ = tracing::subscriber::set_global_default(subscriber);
}
