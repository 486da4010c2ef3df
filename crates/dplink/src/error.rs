//! CLI error types with miette diagnostics.
//!
//! Maps `CoreError` and `ConfigError` variants into user-facing errors with
//! actionable help text.

use miette::Diagnostic;
use thiserror::Error;

use dplink_config::ConfigError;
use dplink_core::CoreError;

/// Process exit codes.
pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const NO_KEY: i32 = 3;
    pub const NOT_FOUND: i32 = 4;
    pub const CONNECTION: i32 = 7;
    pub const CONFIG: i32 = 9;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    // ── Catalog ──────────────────────────────────────────────────────

    #[error("Invalid profile {source_name}: {message}")]
    #[diagnostic(
        code(dplink::invalid_profile),
        help("Fix the file and re-run: dplink profiles validate")
    )]
    InvalidProfile {
        source_name: String,
        message: String,
    },

    #[error("Profile '{config_id}' not found")]
    #[diagnostic(
        code(dplink::profile_not_found),
        help("Run: dplink profiles list to see available profiles")
    )]
    ProfileNotFound { config_id: String },

    #[error("No profile matches the reported datapoints")]
    #[diagnostic(
        code(dplink::no_match),
        help("Observed: {observed}\nThe device may need a new profile in the catalog.")
    )]
    NoMatch { observed: String },

    // ── Devices ──────────────────────────────────────────────────────

    #[error("Device '{name}' not found in configuration")]
    #[diagnostic(
        code(dplink::device_not_found),
        help("List configured devices with: dplink config show")
    )]
    DeviceNotFound { name: String },

    #[error("No local key configured for device '{device}'")]
    #[diagnostic(
        code(dplink::no_local_key),
        help(
            "Store one with: dplink config set-key {device}\n\
             Or set local_key_env in the device entry."
        )
    )]
    NoLocalKey { device: String },

    #[error("Device {device} unreachable: {reason}")]
    #[diagnostic(code(dplink::connection_failed))]
    ConnectionFailed { device: String, reason: String },

    #[error("Device error: {message}")]
    #[diagnostic(code(dplink::device_error))]
    DeviceError { message: String },

    // ── Validation ───────────────────────────────────────────────────

    #[error("Invalid value for {field}: {reason}")]
    #[diagnostic(code(dplink::validation))]
    Validation { field: String, reason: String },

    // ── Configuration ────────────────────────────────────────────────

    #[error("Configuration error: {message}")]
    #[diagnostic(
        code(dplink::config),
        help("Check the config file at: {path}")
    )]
    Config { message: String, path: String },

    #[error("Keyring error: {0}")]
    #[diagnostic(
        code(dplink::keyring),
        help("Use --plaintext to store the key in the config file instead.")
    )]
    Keyring(String),

    // ── IO / Serialization ────────────────────────────────────────────

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Invalid JSON input: {0}")]
    #[diagnostic(
        code(dplink::json),
        help("Expected a JSON object of datapoint id to value.")
    )]
    Json(#[from] serde_json::Error),

    #[error("Failed to render output: {0}")]
    #[diagnostic(code(dplink::render))]
    Render(String),
}

impl CliError {
    /// Map this error to an exit code for process termination.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ProfileNotFound { .. } | Self::NoMatch { .. } | Self::DeviceNotFound { .. } => {
                exit_code::NOT_FOUND
            }
            Self::NoLocalKey { .. } => exit_code::NO_KEY,
            Self::ConnectionFailed { .. } => exit_code::CONNECTION,
            Self::InvalidProfile { .. } | Self::Config { .. } => exit_code::CONFIG,
            Self::Validation { .. } | Self::Json(_) => exit_code::USAGE,
            _ => exit_code::GENERAL,
        }
    }
}

// ── CoreError → CliError mapping ─────────────────────────────────────

impl From<CoreError> for CliError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Configuration {
                source_name,
                message,
            } => CliError::InvalidProfile {
                source_name,
                message,
            },

            CoreError::NoMatch { observed } => CliError::NoMatch { observed },

            CoreError::Connectivity { device, reason } => {
                CliError::ConnectionFailed { device, reason }
            }

            other @ (CoreError::ProtocolMismatch { .. }
            | CoreError::WriteRejected { .. }
            | CoreError::SessionStopped { .. }
            | CoreError::Internal(_)) => CliError::DeviceError {
                message: other.to_string(),
            },
        }
    }
}

// ── ConfigError → CliError mapping ───────────────────────────────────

impl From<ConfigError> for CliError {
    fn from(err: ConfigError) -> Self {
        let path = dplink_config::config_path().display().to_string();
        match err {
            ConfigError::UnknownDevice { name } => CliError::DeviceNotFound { name },
            ConfigError::NoLocalKey { device } => CliError::NoLocalKey { device },
            ConfigError::Validation { field, reason } => CliError::Validation { field, reason },
            ConfigError::Keyring(message) => CliError::Keyring(message),
            ConfigError::Io(e) => CliError::Io(e),
            other @ (ConfigError::Serialization(_) | ConfigError::Figment(_)) => CliError::Config {
                message: other.to_string(),
                path,
            },
        }
    }
}
