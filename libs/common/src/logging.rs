//! Unified logging module for the gateway services
//!
//! Installs a `tracing` subscriber with a console layer and an optional
//! daily-rolling file layer. `RUST_LOG` always wins over the configured filter.

use std::path::PathBuf;
use std::sync::OnceLock;

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::Writer, FmtContext, FormatEvent, FormatFields, FormattedFields},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Keeps the non-blocking file writer flushing for the whole process lifetime
static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

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

/// Event formatter that outputs: `timestamp [LEVEL] span{fields}: message`
///
/// Example output: `2025-12-02T00:50:44.809Z [INFO] poll{device=pump-1}: Connected`
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

        // Device/poll spans carry the context that makes a line useful
        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                write!(writer, "{}", span.name())?;
                let ext = span.extensions();
                if let Some(fields) = ext.get::<FormattedFields<N>>() {
                    if !fields.is_empty() {
                        write!(writer, "{{{}}}", fields)?;
                    }
                }
                write!(writer, ": ")?;
            }
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

/// Logger configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Service name, used as the log file prefix
    pub service_name: String,
    /// Filter directive used when `RUST_LOG` is not set (e.g. "info,stationsrv=debug")
    pub filter: String,
    /// Emit JSON lines instead of the bracketed text format
    pub enable_json: bool,
    /// Directory for daily-rolling log files; console only when `None`
    pub log_dir: Option<PathBuf>,
    /// Colored console output
    pub ansi: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "unknown".to_string(),
            filter: "info".to_string(),
            enable_json: false,
            log_dir: None,
            ansi: true,
        }
    }
}

impl LogConfig {
    /// Filter actually applied: `RUST_LOG` if set and non-empty, else the configured one
    pub fn effective_filter(&self) -> String {
        match std::env::var("RUST_LOG") {
            Ok(env_str) if !env_str.trim().is_empty() => env_str,
            _ => self.filter.clone(),
        }
    }
}

/// Initialize logging system with configuration
pub fn init_with_config(config: LogConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter_str = config.effective_filter();
    let env_filter = EnvFilter::try_new(&filter_str)?;

    let registry = tracing_subscriber::registry().with(env_filter);

    let console_layer = if config.enable_json {
        fmt::layer()
            .json()
            .with_target(true)
            .with_current_span(true)
            .boxed()
    } else {
        fmt::layer()
            .with_ansi(config.ansi)
            .event_format(BracketedLevelFormat)
            .boxed()
    };

    let file_layer = match &config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender =
                tracing_appender::rolling::daily(dir, format!("{}.log", config.service_name));
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            if FILE_GUARD.set(guard).is_err() {
                eprintln!("Warning: file logging already initialized, keeping first writer");
            }
            Some(
                fmt::layer()
                    .with_writer(non_blocking)
                    .with_ansi(false)
                    .event_format(BracketedLevelFormat)
                    .boxed(),
            )
        },
        None => None,
    };

    registry.with(console_layer).with(file_layer).try_init()?;

    tracing::info!(
        "Logging: {} (filter: {}, file: {:?})",
        config.service_name,
        filter_str,
        config.log_dir
    );

    Ok(())
}

/// Console-only init with a plain level/filter string
pub fn init(level: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    init_with_config(LogConfig {
        filter: level.to_string(),
        ..Default::default()
    })
}
