//! Logging set-up for the library and the demo binary.
//!
//! Without `RUST_LOG`, only this crate logs at the configured level and
//! everything else (tokio, dependencies) is held to `warn`. Socket I/O runs
//! on the named `bt-socket-io` thread, so thread names are shown whenever
//! thread ids are.

use crate::domain::settings::LogSettings;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer, Registry};

const CRATE_TARGET: &str = env!("CARGO_CRATE_NAME");

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Keeps the file writer flushing; drop it last.
pub struct LoggingGuard {
    _file: Option<WorkerGuard>,
}

fn rotation_for(name: &str) -> Rotation {
    match name.to_ascii_lowercase().as_str() {
        "hourly" => Rotation::HOURLY,
        "minutely" => Rotation::MINUTELY,
        "never" => Rotation::NEVER,
        _ => Rotation::DAILY,
    }
}

/// Filter directives used when `RUST_LOG` is not set.
fn default_directives(settings: &LogSettings) -> String {
    let level = match settings.level.trim().to_ascii_lowercase().as_str() {
        level @ ("trace" | "debug" | "info" | "warn" | "error" | "off") => level.to_string(),
        _ => "info".to_string(),
    };
    format!("warn,{}={}", CRATE_TARGET, level)
}

fn build_filter(settings: &LogSettings) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(settings)))
}

fn console_layer(settings: &LogSettings) -> BoxedLayer {
    fmt::layer()
        .with_writer(std::io::stdout)
        .with_ansi(settings.ansi_colors)
        .with_target(settings.show_target)
        .with_thread_ids(settings.show_thread_ids)
        .with_thread_names(settings.show_thread_ids)
        .with_file(settings.show_file_line)
        .with_line_number(settings.show_file_line)
        .boxed()
}

fn file_layer(settings: &LogSettings) -> (BoxedLayer, WorkerGuard) {
    let appender = RollingFileAppender::new(
        rotation_for(&settings.rotation),
        &settings.log_dir,
        &settings.file_name_prefix,
    );
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .with_thread_names(true)
        .with_file(settings.show_file_line)
        .with_line_number(settings.show_file_line)
        .boxed();
    (layer, guard)
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logger(settings: &LogSettings) -> anyhow::Result<LoggingGuard> {
    let mut layers: Vec<BoxedLayer> = Vec::new();
    if settings.console_logging_enabled {
        layers.push(console_layer(settings));
    }

    let mut file_guard = None;
    if settings.file_logging_enabled {
        let (layer, guard) = file_layer(settings);
        layers.push(layer);
        file_guard = Some(guard);
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(build_filter(settings))
        .try_init()?;

    tracing::info!(
        filter = %default_directives(settings),
        file = settings.file_logging_enabled,
        "Logging initialized"
    );

    Ok(LoggingGuard { _file: file_guard })
}
