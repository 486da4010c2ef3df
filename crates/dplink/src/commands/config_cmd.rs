//! Config subcommand handlers.

use std::fmt::Write;
use std::io::BufRead;

use dplink_config::{Config, ConfigError};

use crate::cli::{ConfigArgs, ConfigCommand, GlobalOpts};
use crate::commands::util::{self, prompt_err};
use crate::error::CliError;
use crate::output;

const REDACTED: &str = "****";

// ── Helpers ─────────────────────────────────────────────────────────

/// Mask plaintext keys in place before the config is shown.
fn redact(cfg: &mut Config) {
    for device in cfg.devices.values_mut() {
        if device.local_key.is_some() {
            device.local_key = Some(REDACTED.into());
        }
    }
}

/// Format an (already redacted) config as TOML-like text.
fn format_config(cfg: &Config) -> String {
    let mut out = String::new();

    if let Some(ref dir) = cfg.profiles_dir {
        let _ = writeln!(out, "profiles_dir = \"{}\"", dir.display());
    }
    let _ = writeln!(out, "[defaults]");
    let _ = writeln!(out, "output = \"{}\"", cfg.defaults.output);
    let _ = writeln!(out, "color = \"{}\"", cfg.defaults.color);
    let _ = writeln!(out, "timeout = {}", cfg.defaults.timeout);

    // Only the overrides actually set.
    if let Ok(tuning) = toml::to_string(&cfg.tuning) {
        if !tuning.trim().is_empty() {
            let _ = writeln!(out, "\n[tuning]");
            out.push_str(&tuning);
        }
    }

    for (name, d) in &cfg.devices {
        let _ = writeln!(out, "\n[devices.{name}]");
        let _ = writeln!(out, "device_id = \"{}\"", d.device_id);
        let _ = writeln!(out, "address = \"{}\"", d.address);
        let _ = writeln!(out, "port = {}", d.port);
        let _ = writeln!(out, "protocol = \"{}\"", d.protocol);
        if let Some(ref key) = d.local_key {
            let _ = writeln!(out, "local_key = \"{key}\"");
        }
        if let Some(ref env) = d.local_key_env {
            let _ = writeln!(out, "local_key_env = \"{env}\"");
        }
        if let Some(ref gw) = d.gateway {
            let _ = writeln!(out, "gateway = \"{gw}\"");
        }
        if let Some(ref node) = d.sub_device_id {
            let _ = writeln!(out, "sub_device_id = \"{node}\"");
        }
        if d.poll_only {
            let _ = writeln!(out, "poll_only = true");
        }
        if let Some(ref profile) = d.profile {
            let _ = writeln!(out, "profile = \"{profile}\"");
        }
    }

    out
}

fn read_key(from_stdin: bool) -> Result<String, CliError> {
    let key = if from_stdin {
        let mut line = String::new();
        std::io::stdin().lock().read_line(&mut line)?;
        line
    } else {
        rpassword::prompt_password("Local key: ").map_err(prompt_err)?
    };
    let key = key.trim().to_owned();
    if key.is_empty() {
        return Err(CliError::Validation {
            field: "local_key".into(),
            reason: "local key cannot be empty".into(),
        });
    }
    Ok(key)
}

// ── Handler ─────────────────────────────────────────────────────────

pub fn handle(args: ConfigArgs, global: &GlobalOpts) -> Result<(), CliError> {
    match args.command {
        ConfigCommand::Path => {
            output::print_output(&dplink_config::config_path().display().to_string(), false);
            Ok(())
        }

        ConfigCommand::Show => {
            let mut cfg = dplink_config::load_config()?;
            redact(&mut cfg);
            let out = output::render_single(&global.output, &cfg, format_config, |c| {
                c.devices.keys().cloned().collect::<Vec<_>>().join("\n")
            })?;
            output::print_output(&out, global.quiet);
            Ok(())
        }

        ConfigCommand::SetKey {
            device,
            stdin,
            plaintext,
        } => {
            let mut cfg = dplink_config::load_config()?;
            // Fail before prompting when the name is wrong.
            let entry = cfg
                .devices
                .get_mut(&device)
                .ok_or_else(|| ConfigError::UnknownDevice {
                    name: device.clone(),
                })?;

            let key = read_key(stdin)?;

            if plaintext {
                if entry.local_key.is_some()
                    && !util::confirm(
                        &format!("Replace the stored key for '{device}'?"),
                        global.yes,
                    )?
                {
                    return Ok(());
                }
                entry.local_key = Some(key);
                dplink_config::save_config(&cfg)?;
                tracing::info!(device = %device, "local key written to config");
                if !global.quiet {
                    eprintln!("Key for '{device}' saved to {}", dplink_config::config_path().display());
                }
            } else {
                dplink_config::store_local_key(&device, &key)?;
                tracing::info!(device = %device, "local key stored in keyring");
                if !global.quiet {
                    eprintln!("Key for '{device}' stored in the system keyring");
                }
            }
            Ok(())
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use dplink_config::Device;

    fn device(key: Option<&str>) -> Device {
        Device {
            device_id: "bf01".into(),
            address: "192.168.1.20".into(),
            port: 6668,
            protocol: dplink_core::VersionSelector::Auto,
            local_key: key.map(str::to_owned),
            local_key_env: None,
            sub_device_id: None,
            gateway: None,
            poll_only: false,
            profile: None,
        }
    }

    #[test]
    fn plaintext_keys_never_reach_output() {
        let mut cfg = Config::default();
        cfg.devices.insert("lamp".into(), device(Some("0123456789abcdef")));
        cfg.devices.insert("plug".into(), device(None));
        redact(&mut cfg);

        let text = format_config(&cfg);
        assert!(!text.contains("0123456789abcdef"));
        assert!(text.contains("[devices.lamp]"));
        assert!(text.contains("local_key = \"****\""));
        assert_eq!(text.matches("local_key =").count(), 1);
    }
}
