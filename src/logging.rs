//! Logging setup on tracing + tracing-subscriber
//!
//! Console output (compact or JSON), an optional rolling log file, and
//! `RUST_LOG` for per-module overrides. Transport crates are held at `warn`
//! so a reconnect storm does not bury the connection status lines.

use std::fs;
use std::path::Path;

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::Directive;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use crate::config::LoggingSettings;
use crate::error::{Error, Result};

/// Dependencies that only get to speak at `warn` and above
const QUIET_TARGETS: [&str; 3] = ["tokio_tungstenite", "tungstenite", "native_tls"];

/// Keeps the non-blocking file writer alive; drop flushes it
pub struct LogGuards {
    _file_guard: Option<WorkerGuard>,
}

/// Install the global subscriber
pub fn init_logging(settings: &LoggingSettings, verbose: u8, quiet: bool) -> Result<LogGuards> {
    let level = determine_level(settings, verbose, quiet);
    let env_filter = build_env_filter(level);
    let console_layer = build_console_layer(settings.json_format);

    let (file_layer, file_guard) = match settings.file.as_deref() {
        Some(log_file) => {
            let (layer, guard) = build_file_layer(
                log_file,
                settings.max_file_size_mb,
                settings.max_files,
                settings.json_format,
            )?;
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| Error::Config(format!("Failed to initialize logging: {}", e)))?;

    tracing::debug!(
        level = %level,
        file = ?settings.file,
        json = settings.json_format,
        "Logging initialized"
    );

    Ok(LogGuards {
        _file_guard: file_guard,
    })
}

/// CLI flags win over the configured level
fn determine_level(settings: &LoggingSettings, verbose: u8, quiet: bool) -> Level {
    if quiet {
        return Level::ERROR;
    }

    match verbose {
        0 => parse_level(&settings.level),
        1 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

fn parse_level(level_str: &str) -> Level {
    match level_str.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

fn build_env_filter(level: Level) -> EnvFilter {
    let base = level.to_string().to_lowercase();
    let mut filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&base));

    let directives = std::iter::once(format!("edge_node={}", base))
        .chain(QUIET_TARGETS.iter().map(|target| format!("{}=warn", target)));
    for directive in directives {
        match directive.parse::<Directive>() {
            Ok(d) => filter = filter.add_directive(d),
            Err(e) => eprintln!("Ignoring log directive '{}': {}", directive, e),
        }
    }

    filter
}

fn build_console_layer<S>(json_format: bool) -> Box<dyn Layer<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    if json_format {
        Box::new(
            fmt::layer()
                .json()
                .with_target(true)
                .with_file(true)
                .with_line_number(true),
        )
    } else {
        Box::new(
            fmt::layer()
                .with_target(false)
                .with_ansi(true)
                .compact(),
        )
    }
}

/// Rolling file layer. tracing-appender rotates by time only, so small size
/// limits map to hourly files and everything else to daily.
fn build_file_layer<S>(
    log_file: &str,
    max_size_mb: u64,
    max_files: u32,
    json_format: bool,
) -> Result<(Box<dyn Layer<S> + Send + Sync>, WorkerGuard)>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    let path = Path::new(log_file);
    let directory = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    fs::create_dir_all(directory).map_err(|e| {
        Error::Config(format!(
            "Failed to create log directory '{}': {}",
            directory.display(),
            e
        ))
    })?;

    let file_name = path
        .file_stem()
        .and_then(|n| n.to_str())
        .unwrap_or("edge-node");

    let rotation = if max_size_mb > 0 && max_size_mb < 10 {
        Rotation::HOURLY
    } else {
        Rotation::DAILY
    };

    let file_appender = RollingFileAppender::builder()
        .rotation(rotation)
        .filename_prefix(file_name)
        .filename_suffix("log")
        .max_log_files(max_files.max(1) as usize)
        .build(directory)
        .map_err(|e| Error::Config(format!("Failed to create log file appender: {}", e)))?;

    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let layer: Box<dyn Layer<S> + Send + Sync> = if json_format {
        Box::new(
            fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_target(true)
                .with_ansi(false),
        )
    } else {
        Box::new(
            fmt::layer()
                .with_writer(non_blocking)
                .with_target(true)
                .with_thread_ids(true)
                .with_ansi(false),
        )
    };

    Ok((layer, guard))
}

/// Minimal console logging for one-shot commands
pub fn init_simple(level: Level) -> Result<()> {
    let filter = EnvFilter::from_default_env().add_directive(level.into());

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).compact().with_writer(std::io::stderr))
        .try_init()
        .map_err(|e| Error::Config(format!("Failed to initialize logging: {}", e)))?;

    Ok(())
}
