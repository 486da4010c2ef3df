//! Profile catalog command handlers.

use std::fmt::Write;
use std::path::Path;

use serde::Serialize;
use tabled::Tabled;

use dplink_core::{DatapointDescriptor, DeviceProfile, ProfileCatalog, parse_profile};

use crate::cli::{GlobalOpts, ProfilesArgs, ProfilesCommand};
use crate::commands::util;
use crate::error::CliError;
use crate::output;

// ── Views ───────────────────────────────────────────────────────────

/// One-line summary of a profile.
#[derive(Debug, Serialize)]
pub struct ProfileSummary {
    pub config_id: String,
    pub name: String,
    pub primary: String,
    pub entities: usize,
    pub datapoints: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub legacy_type: Option<String>,
}

impl From<&DeviceProfile> for ProfileSummary {
    fn from(p: &DeviceProfile) -> Self {
        Self {
            config_id: p.config_id.clone(),
            name: p.name.clone(),
            primary: p.primary.kind.to_string(),
            entities: p.entities().count(),
            datapoints: p.all_datapoints().len(),
            legacy_type: p.legacy_type.clone(),
        }
    }
}

// ── Table rows ──────────────────────────────────────────────────────

#[derive(Tabled)]
struct ProfileRow {
    #[tabled(rename = "Config")]
    config_id: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Primary")]
    primary: String,
    #[tabled(rename = "Entities")]
    entities: usize,
    #[tabled(rename = "DPs")]
    datapoints: usize,
}

impl From<&ProfileSummary> for ProfileRow {
    fn from(s: &ProfileSummary) -> Self {
        Self {
            config_id: s.config_id.clone(),
            name: s.name.clone(),
            primary: s.primary.clone(),
            entities: s.entities,
            datapoints: s.datapoints,
        }
    }
}

#[derive(Tabled)]
struct DatapointRow {
    #[tabled(rename = "Entity")]
    entity: String,
    #[tabled(rename = "DP")]
    id: String,
    #[tabled(rename = "Role")]
    role: String,
    #[tabled(rename = "Type")]
    kind: String,
    #[tabled(rename = "Range")]
    range: String,
    #[tabled(rename = "Flags")]
    flags: String,
}

impl DatapointRow {
    fn new(entity: &str, dp: &DatapointDescriptor) -> Self {
        let range = dp.range.map_or_else(String::new, |r| {
            let unit = dp.unit.as_deref().unwrap_or_default();
            format!("{}..{} {unit}", r.min, r.max).trim_end().to_owned()
        });
        Self {
            entity: entity.to_owned(),
            id: dp.id.to_string(),
            role: dp.role.clone(),
            kind: dp.kind.to_string(),
            range,
            flags: flag_list(dp),
        }
    }
}

fn flag_list(dp: &DatapointDescriptor) -> String {
    let f = &dp.flags;
    [
        (f.optional, "optional"),
        (f.readonly, "readonly"),
        (f.force_poll, "force"),
        (!f.persistent, "volatile"),
        (f.hidden, "hidden"),
        (f.sensitive, "sensitive"),
    ]
    .iter()
    .filter(|(on, _)| *on)
    .map(|(_, name)| *name)
    .collect::<Vec<_>>()
    .join(",")
}

fn detail(profile: &DeviceProfile, color: bool) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{} ({})", profile.name, profile.config_id);
    if let Some(ref legacy) = profile.legacy_type {
        let _ = writeln!(out, "{}", output::dim(&format!("legacy type: {legacy}"), color));
    }
    if !profile.products.is_empty() {
        let ids: Vec<&str> = profile.products.iter().map(|p| p.id.as_str()).collect();
        let _ = writeln!(out, "{}", output::dim(&format!("products: {}", ids.join(", ")), color));
    }

    let rows: Vec<DatapointRow> = profile
        .entities()
        .flat_map(|e| {
            let key = e.config_key();
            e.datapoints.iter().map(move |dp| DatapointRow::new(&key, dp))
        })
        .collect();
    out.push_str(&output::render_table(&rows));
    out
}

// ── Handler ─────────────────────────────────────────────────────────

pub fn handle(args: ProfilesArgs, global: &GlobalOpts) -> Result<(), CliError> {
    match args.command {
        ProfilesCommand::List => {
            let catalog = util::catalog(global)?;
            let summaries: Vec<ProfileSummary> =
                catalog.iter().map(|p| ProfileSummary::from(&**p)).collect();
            let out = output::render_list(
                &global.output,
                &summaries,
                |s| ProfileRow::from(s),
                |s| s.config_id.clone(),
            )?;
            output::print_output(&out, global.quiet);
            Ok(())
        }

        ProfilesCommand::Show { config_id } => {
            let catalog = util::catalog(global)?;
            let profile = catalog
                .by_config(&config_id)
                .ok_or(CliError::ProfileNotFound { config_id })?;
            let color = output::should_color(&global.color);
            let out = output::render_single(
                &global.output,
                &**profile,
                |p| detail(p, color),
                |p| p.config_id.clone(),
            )?;
            output::print_output(&out, global.quiet);
            Ok(())
        }

        ProfilesCommand::Validate { files } => {
            let profiles: Vec<DeviceProfile> = if files.is_empty() {
                let dir = util::profiles_dir(global);
                ProfileCatalog::load_dir(&dir)?
                    .iter()
                    .map(|p| DeviceProfile::clone(p))
                    .collect()
            } else {
                files
                    .iter()
                    .map(|path| validate_file(path))
                    .collect::<Result<Vec<_>, _>>()?
            };
            tracing::info!(count = profiles.len(), "profiles validated");

            let summaries: Vec<ProfileSummary> = profiles.iter().map(ProfileSummary::from).collect();
            let out = output::render_list(
                &global.output,
                &summaries,
                |s| ProfileRow::from(s),
                |s| s.config_id.clone(),
            )?;
            output::print_output(&out, global.quiet);
            if !global.quiet {
                eprintln!("{} profile(s) OK", summaries.len());
            }
            Ok(())
        }
    }
}

fn validate_file(path: &Path) -> Result<DeviceProfile, CliError> {
    let config_id = path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| CliError::Validation {
            field: "file".into(),
            reason: format!("{} has no usable file name", path.display()),
        })?;
    let text = std::fs::read_to_string(path)?;
    Ok(parse_profile(config_id, &text)?)
}
