use serde::Deserialize;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    #[default]
    Daily,
    Hourly,
    Never,
}

impl LogRotation {
    fn rotation(self) -> Rotation {
        match self {
            LogRotation::Daily => Rotation::DAILY,
            LogRotation::Hourly => Rotation::HOURLY,
            LogRotation::Never => Rotation::NEVER,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct LoggingConfig {
    /// Log to rolling files in this directory instead of stdout.
    #[serde(default)]
    pub directory: Option<String>,
    #[serde(default)]
    pub file_prefix: Option<String>,
    #[serde(default)]
    pub rotation: LogRotation,
}

fn env_filter() -> (EnvFilter, String) {
    let level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    (EnvFilter::new(&level), level)
}

/// Install the global subscriber for a binary. File logging needs the
/// returned guard kept alive until exit so buffered lines get flushed.
pub fn init_tracing(config: &LoggingConfig, default_prefix: &str) -> Option<WorkerGuard> {
    let (filter, level) = env_filter();

    let Some(dir) = config.directory.as_deref() else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
        eprintln!("✅ Logging to stdout (level: {})", level);
        return None;
    };

    let prefix = config.file_prefix.as_deref().unwrap_or(default_prefix);
    let appender = RollingFileAppender::new(config.rotation.rotation(), dir, prefix);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false),
        )
        .with(filter)
        .init();
    eprintln!(
        "✅ Logging to {}/{} ({:?} rotation, level: {})",
        dir, prefix, config.rotation, level
    );
    Some(guard)
}
