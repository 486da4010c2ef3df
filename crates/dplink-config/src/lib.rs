//! Shared configuration for dplink tools.
//!
//! A TOML file of named devices plus tuning overrides, local-key
//! resolution (env + keyring + plaintext), and translation to
//! `dplink_core::SessionConfig`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use dplink_core::{DpId, ProtocolVersion, SessionConfig, SessionTuning, VersionSelector};

const KEYRING_SERVICE: &str = "dplink";

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("no device named '{name}' in the config")]
    UnknownDevice { name: String },

    #[error("no local key configured for device '{device}'")]
    NoLocalKey { device: String },

    #[error("keyring error: {0}")]
    Keyring(String),

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level TOML configuration.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    /// Directory holding profile YAML files.
    pub profiles_dir: Option<PathBuf>,

    /// Global defaults.
    #[serde(default)]
    pub defaults: Defaults,

    /// Session timing overrides, applied to every device.
    #[serde(default)]
    pub tuning: TuningOverrides,

    /// Named devices.
    #[serde(default)]
    pub devices: BTreeMap<String, Device>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Defaults {
    #[serde(default = "default_output")]
    pub output: String,

    #[serde(default = "default_color")]
    pub color: String,

    /// Per-exchange transport timeout, seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            output: default_output(),
            color: default_color(),
            timeout: default_timeout(),
        }
    }
}

fn default_output() -> String {
    "table".into()
}
fn default_color() -> String {
    "auto".into()
}
fn default_timeout() -> u64 {
    5
}

/// Optional overrides of [`SessionTuning`]. Durations in milliseconds.
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct TuningOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fake_it_timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coalesce_window_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub busy_coalesce_window_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub busy_threshold_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirmed_attempts: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reset_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_with_state_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_without_state_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_backoff_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_delay_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat_interval_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receive_window_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub probe_dps: Option<Vec<DpId>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub candidates: Option<Vec<ProtocolVersion>>,
}

impl TuningOverrides {
    pub fn apply(&self, tuning: &mut SessionTuning) {
        fn set_ms(target: &mut Duration, value: Option<u64>) {
            if let Some(ms) = value {
                *target = Duration::from_millis(ms);
            }
        }

        set_ms(&mut tuning.fake_it_timeout, self.fake_it_timeout_ms);
        set_ms(&mut tuning.cache_timeout, self.cache_timeout_ms);
        set_ms(&mut tuning.coalesce_window, self.coalesce_window_ms);
        set_ms(&mut tuning.busy_coalesce_window, self.busy_coalesce_window_ms);
        set_ms(&mut tuning.busy_threshold, self.busy_threshold_ms);
        set_ms(&mut tuning.idle_with_state, self.idle_with_state_ms);
        set_ms(&mut tuning.idle_without_state, self.idle_without_state_ms);
        set_ms(&mut tuning.error_backoff, self.error_backoff_ms);
        set_ms(&mut tuning.retry_delay, self.retry_delay_ms);
        set_ms(&mut tuning.heartbeat_interval, self.heartbeat_interval_ms);
        set_ms(&mut tuning.receive_window, self.receive_window_ms);
        if let Some(n) = self.confirmed_attempts {
            tuning.confirmed_attempts = n;
        }
        if let Some(n) = self.failure_reset_count {
            tuning.failure_reset_count = n;
        }
        if let Some(ref dps) = self.probe_dps {
            tuning.probe_dps.clone_from(dps);
        }
        if let Some(ref candidates) = self.candidates {
            tuning.candidates.clone_from(candidates);
        }
    }
}

/// A named device.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Device {
    /// Cloud device id.
    pub device_id: String,

    /// Host name or IP address.
    pub address: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// `auto` or a version such as `3.3`.
    #[serde(default)]
    pub protocol: VersionSelector,

    /// Local key in plaintext; prefer the keyring or an env var.
    pub local_key: Option<String>,

    /// Environment variable name containing the local key.
    pub local_key_env: Option<String>,

    /// Node id when the device sits behind a gateway.
    pub sub_device_id: Option<String>,

    /// Name of the gateway device entry.
    pub gateway: Option<String>,

    /// Never hold a persistent connection.
    #[serde(default)]
    pub poll_only: bool,

    /// Profile config id, when already known.
    pub profile: Option<String>,
}

fn default_port() -> u16 {
    6668
}

// ── Paths ───────────────────────────────────────────────────────────

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("dev", "dplink", "dplink")
}

fn dirs_fallback() -> PathBuf {
    let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
    p.push(".config");
    p.push("dplink");
    p
}

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    project_dirs().map_or_else(
        || dirs_fallback().join("config.toml"),
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

/// Where profiles live when the config does not say.
pub fn default_profiles_dir() -> PathBuf {
    project_dirs().map_or_else(
        || dirs_fallback().join("profiles"),
        |dirs| dirs.data_dir().join("profiles"),
    )
}

impl Config {
    pub fn profiles_dir(&self) -> PathBuf {
        self.profiles_dir.clone().unwrap_or_else(default_profiles_dir)
    }

    pub fn device(&self, name: &str) -> Result<&Device, ConfigError> {
        self.devices.get(name).ok_or_else(|| ConfigError::UnknownDevice {
            name: name.into(),
        })
    }
}

// ── Config loading ──────────────────────────────────────────────────

/// Load the full Config from the canonical file + environment.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&config_path())
}

/// Load from `path` + `DPLINK_*` environment variables. A missing file
/// yields the defaults.
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    let figment = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("DPLINK_").split("__"));

    let config: Config = figment.extract()?;
    for (name, device) in &config.devices {
        if let Some(gateway) = &device.gateway {
            if !config.devices.contains_key(gateway) {
                return Err(ConfigError::Validation {
                    field: format!("devices.{name}.gateway"),
                    reason: format!("no device named '{gateway}'"),
                });
            }
        }
    }
    Ok(config)
}

/// Load config, returning a default if loading fails.
pub fn load_config_or_default() -> Config {
    load_config().unwrap_or_default()
}

// ── Config saving ───────────────────────────────────────────────────

/// Serialize config to TOML and write to the canonical config path.
pub fn save_config(cfg: &Config) -> Result<(), ConfigError> {
    save_config_to(cfg, &config_path())
}

pub fn save_config_to(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(cfg)?;
    std::fs::write(path, toml_str)?;
    Ok(())
}

// ── Local key resolution ────────────────────────────────────────────

fn keyring_entry(name: &str) -> Result<keyring::Entry, ConfigError> {
    keyring::Entry::new(KEYRING_SERVICE, &format!("{name}/local-key"))
        .map_err(|e| ConfigError::Keyring(e.to_string()))
}

/// Resolve a device's local key: env var, then keyring, then plaintext.
pub fn resolve_local_key(device: &Device, name: &str) -> Result<SecretString, ConfigError> {
    // 1. Device's local_key_env → env var lookup
    if let Some(ref env_name) = device.local_key_env {
        if let Ok(val) = std::env::var(env_name) {
            return Ok(SecretString::from(val));
        }
    }

    // 2. System keyring
    if let Ok(entry) = keyring_entry(name) {
        if let Ok(secret) = entry.get_password() {
            return Ok(SecretString::from(secret));
        }
    }

    // 3. Plaintext in config
    if let Some(ref key) = device.local_key {
        return Ok(SecretString::from(key.clone()));
    }

    Err(ConfigError::NoLocalKey {
        device: name.into(),
    })
}

/// Store a device's local key in the system keyring.
pub fn store_local_key(name: &str, key: &str) -> Result<(), ConfigError> {
    keyring_entry(name)?
        .set_password(key)
        .map_err(|e| ConfigError::Keyring(e.to_string()))
}

// ── Translation ─────────────────────────────────────────────────────

/// Build a `SessionConfig` for the named device.
///
/// A gateway reference is translated from the gateway's entry name to its
/// device id, which is what sessions are keyed by.
pub fn device_to_session_config(cfg: &Config, name: &str) -> Result<SessionConfig, ConfigError> {
    let device = cfg.device(name)?;
    if device.address.trim().is_empty() {
        return Err(ConfigError::Validation {
            field: format!("devices.{name}.address"),
            reason: "address is empty".into(),
        });
    }
    let local_key = resolve_local_key(device, name)?;

    let gateway = device
        .gateway
        .as_deref()
        .map(|gw| cfg.device(gw).map(|g| g.device_id.clone()))
        .transpose()?;

    let mut session = SessionConfig::new(&device.device_id, &device.address, local_key);
    session.name = Some(name.to_owned());
    session.port = device.port;
    session.protocol = device.protocol;
    session.sub_device_id.clone_from(&device.sub_device_id);
    session.gateway = gateway;
    session.poll_only = device.poll_only;
    session.tuning.transport_timeout = Duration::from_secs(cfg.defaults.timeout);
    cfg.tuning.apply(&mut session.tuning);
    Ok(session)
}
