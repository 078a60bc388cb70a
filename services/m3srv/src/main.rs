//! M3 record service
//!
//! `m3srv run` scans a record table, `m3srv parse` checks one address,
//! `m3srv set-led` drives a front-panel LED and `m3srv gateway` serves a
//! simulated module over TCP.
//!
//! While `run` is scanning, SIGHUP re-reads `service.log_level` from the
//! config file and applies it without a restart.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{info, warn};

use common::logging::{self, LogConfig};
use common::{ReloadSignal, ShutdownTrigger};
use m3_protocols::seqdev::{serve_gateway, AddressParser, SimulatedTransport, Target};
use m3_protocols::sysctl;
use m3srv::{Backend, M3SrvConfig, RecordKind, Scanner, TransportKind};

#[derive(Parser)]
#[command(
    name = "m3srv",
    version = env!("CARGO_PKG_VERSION"),
    about = "M3 backplane record service",
    long_about = None
)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, global = true, env = "M3SRV_LOG_LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Scan the configured records
    Run {
        #[arg(short, long, default_value = "config/m3srv.yaml")]
        config: PathBuf,
        /// Stop after this many scan cycles and print the record table
        #[arg(long)]
        cycles: Option<u64>,
        /// Only validate the configuration
        #[arg(long)]
        validate: bool,
    },
    /// Parse an address and print its descriptor
    Parse {
        #[arg(short, long, value_enum)]
        kind: RecordKind,
        #[arg(short, long, default_value = "f3rp71", value_parser = parse_target)]
        target: Target,
        address: String,
    },
    /// Drive a front-panel LED (R, A, E, 1, 2, 3)
    SetLed {
        #[arg(short, long)]
        config: Option<PathBuf>,
        #[arg(long)]
        led: char,
        #[arg(long)]
        value: i64,
    },
    /// Serve a simulated module over the TCP gateway protocol
    Gateway {
        #[arg(long, default_value = "127.0.0.1:5020")]
        listen: String,
        #[arg(long, default_value_t = 1)]
        local_slot: u8,
    },
}

fn parse_target(s: &str) -> Result<Target, String> {
    match s.to_ascii_lowercase().as_str() {
        "f3rp61" => Ok(Target::F3rp61),
        "f3rp71" => Ok(Target::F3rp71),
        other => Err(format!("unknown target '{}'", other)),
    }
}

fn init_logging(config: &M3SrvConfig, cli_level: Option<&str>) -> anyhow::Result<()> {
    let service = &config.service;
    logging::init_with_config(LogConfig {
        service_name: service.name.clone(),
        level: cli_level.unwrap_or(&service.log_level).to_string(),
        log_dir: service.log_dir.as_ref().map(PathBuf::from),
        enable_json: service.json_logs,
    })
    .map_err(|e| anyhow::anyhow!("logging init failed: {}", e))
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<M3SrvConfig> {
    match path {
        Some(path) => M3SrvConfig::load(path)
            .with_context(|| format!("loading {}", path.display())),
        None => Ok(M3SrvConfig::default()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let level = cli.log_level.as_deref();

    match cli.command {
        Command::Run {
            config,
            cycles,
            validate,
        } => {
            let path = config;
            let config = load_config(Some(&path))?;
            init_logging(&config, level)?;
            if validate {
                info!("Configuration valid: {} records", config.records.len());
                return Ok(());
            }
            run(config, &path, cycles).await
        },
        Command::Parse {
            kind,
            target,
            address,
        } => {
            let descriptor = AddressParser::new(kind.profile(), target)
                .parse(&address)
                .map_err(|e| anyhow::anyhow!("{}", e))?;
            println!("{}", serde_json::to_string_pretty(&descriptor)?);
            Ok(())
        },
        Command::SetLed { config, led, value } => {
            let config = load_config(config.as_ref())?;
            init_logging(&config, level)?;
            let backend = Backend::from_config(&config.transport);
            sysctl::set_led(
                backend.transport.as_ref(),
                led,
                value,
                config.transport.target,
                config.transport.timeout(),
            )
            .await?;
            info!("LED {} set to {}", led, value);
            Ok(())
        },
        Command::Gateway { listen, local_slot } => {
            init_logging(&M3SrvConfig::default(), level)?;
            let listener = TcpListener::bind(&listen)
                .await
                .with_context(|| format!("binding {}", listen))?;
            let backend = Arc::new(SimulatedTransport::new(local_slot));

            tokio::select! {
                _ = serve_gateway(listener, backend) => bail!("gateway listener stopped"),
                _ = common::wait_for_shutdown() => info!("Gateway shutting down"),
            }
            Ok(())
        },
    }
}

/// SIGHUP: apply `service.log_level` from the config file again
fn reload_log_level(path: &Path) {
    let config = match M3SrvConfig::load(path) {
        Ok(config) => config,
        Err(e) => {
            warn!("Reload of {} failed: {}", path.display(), e);
            return;
        },
    };
    let previous = logging::get_log_level();
    match logging::set_log_level(&config.service.log_level) {
        Ok(()) => info!("Log level {} -> {}", previous, config.service.log_level),
        Err(e) => warn!("Log level unchanged: {}", e),
    }
}

async fn run(config: M3SrvConfig, path: &Path, cycles: Option<u64>) -> anyhow::Result<()> {
    let backend = Backend::from_config(&config.transport);
    if config.transport.kind == TransportKind::Tcp {
        info!(
            "Gateway {}:{} (local slot {})",
            config.transport.host, config.transport.port, config.transport.local_slot
        );
    }
    let mut scanner = Scanner::new(&config, &backend);

    if let Some(count) = cycles {
        scanner.run_cycles(count).await;
        scanner.queue().shutdown().await;
        println!("{}", serde_json::to_string_pretty(&scanner.snapshot())?);
        return Ok(());
    }

    let trigger = ShutdownTrigger::new();
    let rx = trigger.subscribe();
    let scan = tokio::spawn(async move {
        scanner.run(rx).await;
    });

    let mut reload = ReloadSignal::new();
    let shutdown = common::wait_for_shutdown();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = reload.recv() => reload_log_level(path),
        }
    }

    trigger.trigger();
    scan.await.context("scanner task")?;
    info!("m3srv stopped");
    Ok(())
}
