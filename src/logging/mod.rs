//! Logging infrastructure - structured tracing for the bridge
//!
//! Design: Uses `tracing` for structured, contextual logging with:
//! - Configurable log level via environment
//! - Zero-cost when disabled
//! - Span per reference walk
//! - Console or daily-rotated file output, human-readable or JSON

use once_cell::sync::OnceCell;
use std::io;
use std::path::Path;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

// Re-export tracing macros for use throughout the bridge
pub use tracing::{debug, debug_span, error, info, trace, warn};

use crate::error::TrackerError;

/// Global logging state
static LOGGER_INITIALIZED: OnceCell<()> = OnceCell::new();

const DEFAULT_LOG_FILE: &str = "tracker_bridge.log";

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Default log level
    pub level: Level,
    /// Enable file logging
    pub file_output: bool,
    /// Log file path (if file_output enabled)
    pub log_path: Option<String>,
    /// Enable JSON format (vs human-readable)
    pub json_format: bool,
    /// Show span events (enter/exit)
    pub show_spans: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            file_output: false,
            log_path: None,
            json_format: false,
            show_spans: false,
        }
    }
}

impl LogConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        // TRACKER_BRIDGE_LOG_LEVEL: trace, debug, info, warn, error
        if let Some(level_str) = lookup("TRACKER_BRIDGE_LOG_LEVEL") {
            config.level = match level_str.to_lowercase().as_str() {
                "trace" => Level::TRACE,
                "debug" => Level::DEBUG,
                "info" => Level::INFO,
                "warn" => Level::WARN,
                "error" => Level::ERROR,
                _ => Level::INFO,
            };
        }

        // TRACKER_BRIDGE_LOG_FILE: path to log file
        if let Some(path) = lookup("TRACKER_BRIDGE_LOG_FILE") {
            config.file_output = true;
            config.log_path = Some(path);
        }

        config.json_format = lookup("TRACKER_BRIDGE_LOG_JSON").is_some();
        config.show_spans = lookup("TRACKER_BRIDGE_LOG_SPANS").is_some();

        config
    }

    /// Create high-performance config (minimal logging)
    pub fn performance() -> Self {
        Self {
            level: Level::ERROR,
            ..Self::default()
        }
    }

    /// Create debug config (verbose logging)
    pub fn debug() -> Self {
        Self {
            level: Level::TRACE,
            file_output: true,
            log_path: Some(DEFAULT_LOG_FILE.to_string()),
            json_format: false,
            show_spans: true,
        }
    }
}

/// Initialize logging with default configuration
pub fn init() -> Option<WorkerGuard> {
    init_with_config(LogConfig::from_env())
}

/// Initialize logging with custom configuration
///
/// Returns the writer guard on first initialization; keep it alive so buffered
/// lines are flushed. Later calls are no-ops and return `None`.
pub fn init_with_config(config: LogConfig) -> Option<WorkerGuard> {
    let mut guard = None;

    LOGGER_INITIALIZED.get_or_init(|| {
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("tracker_bridge={}", config.level.as_str().to_lowercase()))
        });

        let span_events = if config.show_spans {
            FmtSpan::ENTER | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };

        let (writer, worker_guard) = match config.log_path.as_deref() {
            Some(path) if config.file_output => {
                let path = Path::new(path);
                let directory = path
                    .parent()
                    .filter(|dir| !dir.as_os_str().is_empty())
                    .unwrap_or_else(|| Path::new("."));
                let prefix = path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .unwrap_or(DEFAULT_LOG_FILE);
                tracing_appender::non_blocking(tracing_appender::rolling::daily(directory, prefix))
            }
            _ => tracing_appender::non_blocking(io::stderr()),
        };
        guard = Some(worker_guard);

        let layer = fmt::layer()
            .with_writer(writer)
            .with_span_events(span_events)
            .with_target(true)
            .with_thread_ids(cfg!(debug_assertions))
            .with_line_number(cfg!(debug_assertions));

        let layer: Box<dyn Layer<Registry> + Send + Sync> = if config.json_format {
            layer.json().boxed()
        } else {
            layer.compact().boxed()
        };

        // Ignore error if a global subscriber is already installed
        let _ = tracing_subscriber::registry()
            .with(layer)
            .with(env_filter)
            .try_init();
    });

    guard
}

/// Check if logging is initialized
pub fn is_initialized() -> bool {
    LOGGER_INITIALIZED.get().is_some()
}

// ============================================================================
// Bridge-specific logging functions
// ============================================================================

/// Log coordinator publication
pub fn log_tracker_manager_published(manager: *const ()) {
    info!(
        target: "tracker",
        event = "tracker_manager_published",
        address = ?manager,
        "Reference tracker manager registered"
    );
}

/// Log a lost discovery race
pub fn log_discovery_race_lost(winner: *const ()) {
    debug!(
        target: "tracker",
        event = "tracker_manager_race_lost",
        winner = ?winner,
        "Reference tracker manager already published, discarding local instance"
    );
}

/// Log reference walk start
pub fn log_walk_start() {
    debug!(
        target: "tracker",
        event = "walk_start",
        "Starting external reference walk"
    );
}

/// Log reference walk completion
pub fn log_walk_complete(duration_us: u64, trackers_visited: usize, edges: usize, failed: bool) {
    info!(
        target: "tracker",
        event = "walk_complete",
        trackers_visited,
        edges_reported = edges,
        failed,
        duration_us,
        "External reference walk complete"
    );
}

/// Log a failed completion notification
pub fn log_completion_failure(err: &TrackerError) {
    error!(
        target: "tracker",
        event = "tracking_completed_failed",
        error = %err,
        "Reference tracker manager failed to complete tracking"
    );
}

/// Log coordinator release at shutdown
pub fn log_shutdown_release(manager: *const ()) {
    info!(
        target: "tracker",
        event = "tracker_manager_released",
        address = ?manager,
        "Reference tracker manager released"
    );
}
