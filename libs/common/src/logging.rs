//! Logging bootstrap for M3 services
//!
//! Console output plus an optional daily log file, both filtered by one
//! reloadable `EnvFilter` so the level can change at runtime.

use std::path::PathBuf;
use std::sync::OnceLock;

use parking_lot::Mutex;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::Writer, FmtContext, FormatEvent, FormatFields},
    layer::SubscriberExt,
    registry::LookupSpan,
    reload,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Custom format for log level with brackets: `[INFO]`, `[WARN]`, etc.
fn format_level(level: &Level) -> &'static str {
    match *level {
        Level::TRACE => "[TRACE]",
        Level::DEBUG => "[DEBUG]",
        Level::INFO => "[INFO]",
        Level::WARN => "[WARN]",
        Level::ERROR => "[ERROR]",
    }
}

/// Event formatter that outputs: `timestamp [LEVEL] message`
///
/// Example output: `2025-12-02T00:50:44.809Z [INFO] Dispatch queue started`
struct BracketedLevelFormat;

impl<S, N> FormatEvent<S, N> for BracketedLevelFormat
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let now = chrono::Utc::now();
        write!(writer, "{} ", now.format("%Y-%m-%dT%H:%M:%S%.3fZ"))?;

        let level = *event.metadata().level();
        if writer.has_ansi_escapes() {
            let color = match level {
                Level::TRACE => "\x1b[35m",
                Level::DEBUG => "\x1b[34m",
                Level::INFO => "\x1b[32m",
                Level::WARN => "\x1b[33m",
                Level::ERROR => "\x1b[31m",
            };
            write!(writer, "{}{}\x1b[0m ", color, format_level(&level))?;
        } else {
            write!(writer, "{} ", format_level(&level))?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

// Keeps the non-blocking file writer alive for the whole process
static GUARD: OnceLock<Mutex<Option<WorkerGuard>>> = OnceLock::new();

type EnvFilterReloadHandle = reload::Handle<EnvFilter, tracing_subscriber::Registry>;
static LOG_FILTER_HANDLE: OnceLock<EnvFilterReloadHandle> = OnceLock::new();
static CURRENT_LOG_LEVEL: OnceLock<Mutex<String>> = OnceLock::new();

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Service name, used as the default debug target and file prefix
    pub service_name: String,
    /// Base level when `RUST_LOG` is not set
    pub level: String,
    /// Write a daily log file here when set
    pub log_dir: Option<PathBuf>,
    /// JSON lines in the log file instead of the bracketed format
    pub enable_json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "m3srv".to_string(),
            level: "info".to_string(),
            log_dir: None,
            enable_json: false,
        }
    }
}

/// Filter used when `RUST_LOG` is not set: `<level>,<service>=debug`
pub fn default_filter(config: &LogConfig) -> String {
    let service_target = config.service_name.replace('-', "_");
    if config.level == "debug" || config.level == "trace" {
        config.level.clone()
    } else {
        format!("{},{}=debug", config.level, service_target)
    }
}

/// Initialize logging system with configuration
pub fn init_with_config(config: LogConfig) -> Result<(), Box<dyn std::error::Error>> {
    let filter_str = std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter(&config));
    let env_filter = EnvFilter::try_new(&filter_str)?;

    // Wrap EnvFilter with reload::Layer for dynamic level changes
    let (reload_filter, reload_handle) = reload::Layer::new(env_filter);

    let console_layer = fmt::layer()
        .with_ansi(true)
        .event_format(BracketedLevelFormat)
        .boxed();

    let file_layer = match &config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender =
                tracing_appender::rolling::daily(dir, format!("{}.log", config.service_name));
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            *GUARD.get_or_init(|| Mutex::new(None)).lock() = Some(guard);

            let layer = if config.enable_json {
                fmt::layer()
                    .json()
                    .with_writer(non_blocking)
                    .with_level(true)
                    .with_target(true)
                    .boxed()
            } else {
                fmt::layer()
                    .with_writer(non_blocking)
                    .with_ansi(false)
                    .event_format(BracketedLevelFormat)
                    .boxed()
            };
            Some(layer)
        },
        None => None,
    };

    tracing_subscriber::registry()
        .with(reload_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    let _ = LOG_FILTER_HANDLE.set(reload_handle);
    *CURRENT_LOG_LEVEL
        .get_or_init(|| Mutex::new(String::new()))
        .lock() = filter_str;

    match &config.log_dir {
        Some(dir) => tracing::info!("Logging: {} @ {:?}", config.service_name, dir),
        None => tracing::info!("Logging: {} (console)", config.service_name),
    }
    Ok(())
}

/// Console-only init at the given level
pub fn init(level: &str) -> Result<(), Box<dyn std::error::Error>> {
    init_with_config(LogConfig {
        level: level.to_string(),
        ..Default::default()
    })
}

/// Dynamically set log filter level at runtime
///
/// Accepts a bare level (`debug`) or a full filter spec
/// (`info,m3_protocols=trace`).
pub fn set_log_level(level: &str) -> Result<(), String> {
    let handle = LOG_FILTER_HANDLE
        .get()
        .ok_or("Logging not initialized with reload support")?;

    let new_filter =
        EnvFilter::try_new(level).map_err(|e| format!("Invalid log level '{}': {}", level, e))?;

    handle
        .reload(new_filter)
        .map_err(|e| format!("Failed to reload log filter: {}", e))?;

    if let Some(current) = CURRENT_LOG_LEVEL.get() {
        *current.lock() = level.to_string();
    }

    tracing::info!("Log level changed to: {}", level);
    Ok(())
}

/// Current log filter string
pub fn get_log_level() -> String {
    CURRENT_LOG_LEVEL
        .get()
        .map(|m| m.lock().clone())
        .unwrap_or_else(|| "unknown".to_string())
}
