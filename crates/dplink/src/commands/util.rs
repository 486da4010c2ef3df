//! Shared helpers for command handlers.

use std::io::Read;
use std::path::{Path, PathBuf};

use dplink_core::ProfileCatalog;

use crate::cli::GlobalOpts;
use crate::error::CliError;

/// Profile directory: `--profiles-dir`, then the config file, then the
/// platform data directory.
pub fn profiles_dir(global: &GlobalOpts) -> PathBuf {
    global
        .profiles_dir
        .clone()
        .unwrap_or_else(|| dplink_config::load_config_or_default().profiles_dir())
}

/// Load the catalog once for the process.
pub fn catalog(global: &GlobalOpts) -> Result<&'static ProfileCatalog, CliError> {
    let dir = profiles_dir(global);
    tracing::debug!(dir = %dir.display(), "loading profile catalog");
    Ok(dplink_core::load_catalog(&dir)?)
}

/// Read a file, or stdin when the path is `-`.
pub fn read_input(path: &Path) -> Result<String, CliError> {
    if path.as_os_str() == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        Ok(buf)
    } else {
        Ok(std::fs::read_to_string(path)?)
    }
}

/// Prompt for confirmation, auto-approving if `--yes` was passed.
pub fn confirm(message: &str, yes_flag: bool) -> Result<bool, CliError> {
    if yes_flag {
        return Ok(true);
    }
    dialoguer::Confirm::new()
        .with_prompt(message)
        .default(false)
        .interact()
        .map_err(prompt_err)
}

/// Map a dialoguer / interactive I/O failure into CliError.
pub fn prompt_err(e: impl std::fmt::Display) -> CliError {
    CliError::Validation {
        field: "interactive".into(),
        reason: format!("prompt failed: {e}"),
    }
}
