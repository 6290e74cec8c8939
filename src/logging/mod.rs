//! Logging configuration and initialization
//!
//! Centralized logging setup using the `tracing` ecosystem. Supports both
//! human-readable (with colors) and JSON output formats, configurable via
//! environment variables or programmatically.
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: Standard tracing filter (e.g., "info", "debug,gpuforge=trace")
//! - `GPUFORGE_LOG_LEVEL`: Simple log level (error, warn, info, debug, trace)
//! - `GPUFORGE_LOG_FORMAT`: Output format ("human" or "json")
//! - `GPUFORGE_LOG_FILE`: Optional file path for log output

use once_cell::sync::OnceCell;
use std::path::PathBuf;
use thiserror::Error;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Global flag to track if tracing has been initialized
static TRACING_INITIALIZED: OnceCell<()> = OnceCell::new();

/// Environment variable for log level override
const LOG_LEVEL_ENV: &str = "GPUFORGE_LOG_LEVEL";

/// Environment variable for log format (json/human)
const LOG_FORMAT_ENV: &str = "GPUFORGE_LOG_FORMAT";

/// Environment variable for log file path
const LOG_FILE_ENV: &str = "GPUFORGE_LOG_FILE";

/// Errors that can occur during logging initialization
#[derive(Debug, Error)]
pub enum LoggingError {
    /// Invalid log level string provided
    #[error("invalid log level: {0}")]
    InvalidLogLevel(String),

    /// Failed to create log file directory
    #[error("failed to create log directory: {0}")]
    DirectoryCreationFailed(String),

    /// Failed to open log file
    #[error("failed to open log file: {0}")]
    FileOpenFailed(String),
}

/// Log level enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    /// Error level
    Error,
    /// Warning level
    Warn,
    /// Info level (default)
    #[default]
    Info,
    /// Debug level
    Debug,
    /// Trace level
    Trace,
}

impl LogLevel {
    /// Parse from string
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "error" => Some(LogLevel::Error),
            "warn" | "warning" => Some(LogLevel::Warn),
            "info" => Some(LogLevel::Info),
            "debug" => Some(LogLevel::Debug),
            "trace" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    /// Convert to EnvFilter string
    pub fn as_filter_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Log format enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable colored output (default)
    #[default]
    Human,
    /// JSON structured output
    Json,
}

impl LogFormat {
    /// Parse from string
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "human" | "pretty" | "console" => Some(LogFormat::Human),
            "json" | "structured" => Some(LogFormat::Json),
            _ => None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Default)]
pub struct LoggingConfig {
    /// Log level to use
    pub level: LogLevel,
    /// Output format
    pub format: LogFormat,
    /// Whether to include file/line in logs
    pub with_file_info: bool,
    /// Whether to include span events
    pub with_span_events: bool,
    /// Optional file path for log output
    pub log_file: Option<PathBuf>,
}

impl LoggingConfig {
    /// Create a new default logging configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the log level
    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    /// Set the log format
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Enable or disable file/line information
    pub fn with_file_info(mut self, with_file_info: bool) -> Self {
        self.with_file_info = with_file_info;
        self
    }

    /// Set the log file path for output
    pub fn with_log_file(mut self, path: PathBuf) -> Self {
        self.log_file = Some(path);
        self
    }
}

/// Initialize logging with default configuration.
///
/// Uses the `GPUFORGE_LOG_LEVEL` and `GPUFORGE_LOG_FORMAT` environment
/// variables if set, otherwise defaults to `info` level and human-readable
/// format. Idempotent.
pub fn init_logging_default() {
    init_logging_from_env().ok();
}

/// Initialize logging from environment variables.
///
/// Falls back to defaults when the variables are not set. Idempotent.
pub fn init_logging_from_env() -> Result<(), LoggingError> {
    TRACING_INITIALIZED.get_or_init(|| {
        let log_level = std::env::var(LOG_LEVEL_ENV)
            .ok()
            .and_then(|s| LogLevel::parse(&s))
            .unwrap_or(LogLevel::Info);

        let log_format = std::env::var(LOG_FORMAT_ENV)
            .ok()
            .and_then(|s| LogFormat::parse(&s))
            .unwrap_or(LogFormat::Human);

        let log_file = std::env::var(LOG_FILE_ENV).ok().map(PathBuf::from);

        let mut config = LoggingConfig::new()
            .with_level(log_level)
            .with_format(log_format);
        if let Some(file) = log_file {
            config = config.with_log_file(file);
        }

        // Ignore errors during initialization
        let _ = init_with_config_internal(&config);
    });
    Ok(())
}

/// Initialize logging with a custom configuration. Idempotent.
pub fn init_with_config(config: &LoggingConfig) {
    TRACING_INITIALIZED.get_or_init(|| {
        let _ = init_with_config_internal(config);
    });
}

fn init_with_config_internal(config: &LoggingConfig) -> Result<(), LoggingError> {
    // RUST_LOG wins over the simple level variable
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_filter_str()));

    let writer = match &config.log_file {
        Some(log_path) => {
            if let Some(parent) = log_path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| LoggingError::DirectoryCreationFailed(e.to_string()))?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_path)
                .map_err(|e| LoggingError::FileOpenFailed(e.to_string()))?;
            Some(file)
        }
        None => None,
    };

    let span_events = if config.with_span_events {
        FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    match (config.format, writer) {
        (LogFormat::Json, Some(file)) => {
            let layer = fmt::layer()
                .json()
                .with_writer(file)
                .with_target(false)
                .with_file(config.with_file_info)
                .with_line_number(config.with_file_info)
                .with_span_events(span_events);
            tracing_subscriber::registry().with(env_filter).with(layer).init();
        }
        (LogFormat::Json, None) => {
            let layer = fmt::layer()
                .json()
                .with_target(false)
                .with_file(config.with_file_info)
                .with_line_number(config.with_file_info)
                .with_span_events(span_events);
            tracing_subscriber::registry().with(env_filter).with(layer).init();
        }
        (LogFormat::Human, Some(file)) => {
            let layer = fmt::layer()
                .with_writer(file)
                .with_ansi(false)
                .with_target(true)
                .with_file(config.with_file_info)
                .with_line_number(config.with_file_info)
                .with_span_events(span_events);
            tracing_subscriber::registry().with(env_filter).with(layer).init();
        }
        (LogFormat::Human, None) => {
            let layer = fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_thread_names(false)
                .with_file(config.with_file_info)
                .with_line_number(config.with_file_info)
                .with_span_events(span_events);
            tracing_subscriber::registry().with(env_filter).with(layer).init();
        }
    }

    Ok(())
}
