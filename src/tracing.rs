use tracing::level_filters::LevelFilter;
use tracing_subscriber::{EnvFilter, prelude::*};

use crate::config::Config;

pub const LOG_FILE_NAME: &str = "mcidle.log";

/// Log to stdout (filtered by `RUST_LOG`, `info` if unset) and, if
/// `logging_dir` is set, to a daily rotated file at debug level.
pub fn init_tracing(config: &Config) {
    let mut layers = Vec::new();

    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    layers.push(tracing_subscriber::fmt::layer().with_filter(env_filter).boxed());

    if let Some(logging_dir) = &config.logging_dir {
        let file_appender = tracing_appender::rolling::daily(logging_dir, LOG_FILE_NAME);

        layers.push(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_appender)
                .with_filter(LevelFilter::DEBUG)
                .boxed(),
        );
    }

    tracing_subscriber::registry().with(layers).init();
}
