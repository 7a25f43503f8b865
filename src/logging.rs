use std::{io, sync::Once};

use tracing::{debug, info, metadata::LevelFilter, Level};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{prelude::*, EnvFilter};

use crate::config::LogConfig;

/// Name of the log file, before the date suffix added by rotation.
pub const LOG_FILE_NAME: &str = "serial-bridge.log";

/// The most detailed level logged at a verbosity.
pub fn verbosity_level(verbosity: u8) -> Level {
    match verbosity {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

// RUST_LOG wins over the verbosity if set.
fn filter(level: Level) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(LevelFilter::from(level).into())
        .from_env_lossy()
}

fn do_init(config: &LogConfig) {
    let level = verbosity_level(config.verbosity);
    let mut message = String::from("Logging with:");

    let (console_layer, stderr_layer) = if config.stderr {
        message += " stderr";
        (
            None,
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(io::stderr)
                    .with_filter(filter(level)),
            ),
        )
    } else {
        message += " stdout";
        (
            Some(tracing_subscriber::fmt::layer().with_filter(filter(level))),
            None,
        )
    };

    let maybe_file_layer = if let Some(output_dir) = &config.directory {
        message += &format!(", file (in dir {output_dir:?})");

        let file_appender = RollingFileAppender::new(Rotation::DAILY, output_dir, LOG_FILE_NAME);

        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(file_appender)
            .with_ansi(false)
            .with_filter(filter(level));
        Some(file_layer)
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(console_layer)
        .with(stderr_layer)
        .with(maybe_file_layer)
        .init();

    debug!(message);
}

/// Initialize tracing.
///
/// Will only initialize once, so tests may call this.
pub fn init(config: &LogConfig) {
    static TRACING_IS_INITIALIZED: Once = Once::new();

    TRACING_IS_INITIALIZED.call_once(|| do_init(config));

    info!("Logging initialized");
}
