//! logging.rs — tracing subscriber for the camera service.
//!
//! stdout (ANSI) plus a daily rotated `camera_service.log`. The capture loop
//! runs on a blocking worker, so thread names are included in every line.

use std::path::PathBuf;
use std::sync::OnceLock;

use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOG_FILE_NAME: &str = "camera_service.log";
const DEFAULT_LEVEL: &str = "info";

static LOG_STATE: OnceLock<Option<PathBuf>> = OnceLock::new();
static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Where and how verbosely to log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub dir: PathBuf,
    /// Directive used when `RUST_LOG` is absent.
    pub level: String,
}

impl LogSettings {
    pub fn from_env() -> Self {
        Self::resolve(
            std::env::var("ENTRYWATCH_LOG_DIR").ok(),
            std::env::var("ENTRYWATCH_LOG_LEVEL").ok(),
        )
    }

    fn resolve(dir: Option<String>, level: Option<String>) -> Self {
        let dir = dir
            .filter(|d| !d.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                dirs::data_dir()
                    .unwrap_or_else(std::env::temp_dir)
                    .join("entrywatch")
                    .join("logs")
            });
        let level = level
            .map(|l| l.trim().to_lowercase())
            .filter(|l| !l.is_empty())
            .unwrap_or_else(|| DEFAULT_LEVEL.to_string());
        Self { dir, level }
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&self.level))
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LEVEL))
    }
}

/// Install the global subscriber. Later calls are no-ops and return the
/// directory chosen by the first one (`None` when only stdout is active).
pub fn init_logging() -> Option<PathBuf> {
    LOG_STATE
        .get_or_init(|| install(LogSettings::from_env()))
        .clone()
}

/// Directory of the active file sink, if logging was initialized with one.
pub fn log_dir() -> Option<PathBuf> {
    LOG_STATE.get().cloned().flatten()
}

fn install(settings: LogSettings) -> Option<PathBuf> {
    let stdout_layer = fmt::layer()
        .with_ansi(true)
        .with_target(true)
        .with_thread_names(true)
        .with_timer(UtcTime::rfc_3339());
    let registry = tracing_subscriber::registry()
        .with(settings.filter())
        .with(stdout_layer);

    match std::fs::create_dir_all(&settings.dir) {
        Ok(()) => {
            let appender = RollingFileAppender::new(Rotation::DAILY, &settings.dir, LOG_FILE_NAME);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            LOG_GUARD.set(guard).ok();
            let file_layer = fmt::layer()
                .with_ansi(false)
                .with_target(true)
                .with_thread_names(true)
                .with_timer(UtcTime::rfc_3339())
                .with_writer(writer);
            registry.with(file_layer).init();
            info!(
                "Logging to {} (rotated daily)",
                settings.dir.join(LOG_FILE_NAME).display()
            );
            Some(settings.dir)
        }
        Err(err) => {
            registry.init();
            warn!(
                "Cannot create log directory {}: {}; logging to stdout only",
                settings.dir.display(),
                err
            );
            None
        }
    }
}
