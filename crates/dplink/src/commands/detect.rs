//! Offline profile detection against a captured datapoint bag.

use serde::Serialize;
use serde_json::Value;
use tabled::Tabled;

use dplink_core::{CoreError, DpValues, RankedProfile, describe_values, values_from_json};

use crate::cli::{DetectArgs, GlobalOpts};
use crate::commands::util;
use crate::error::CliError;
use crate::output;

// ── View ────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct DetectMatch {
    pub config_id: String,
    pub name: String,
    pub score: u8,
    pub primary: String,
}

impl From<&RankedProfile> for DetectMatch {
    fn from(r: &RankedProfile) -> Self {
        Self {
            config_id: r.profile.config_id.clone(),
            name: r.profile.name.clone(),
            score: r.score,
            primary: r.profile.primary.kind.to_string(),
        }
    }
}

#[derive(Tabled)]
struct MatchRow {
    #[tabled(rename = "Score")]
    score: String,
    #[tabled(rename = "Config")]
    config_id: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Primary")]
    primary: String,
}

// ── Parsing ─────────────────────────────────────────────────────────

/// Accept either a bare `{"1": true}` object or a device reply carrying it
/// under `dps`.
pub fn parse_dps(text: &str) -> Result<DpValues, CliError> {
    let value: Value = serde_json::from_str(text)?;
    let object = match &value {
        Value::Object(map) => match map.get("dps") {
            Some(Value::Object(dps)) => dps,
            _ => map,
        },
        other => {
            return Err(CliError::Validation {
                field: "input".into(),
                reason: format!("expected a JSON object, found {}", json_kind(other)),
            });
        }
    };
    Ok(values_from_json(object))
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

// ── Handler ─────────────────────────────────────────────────────────

pub fn handle(args: &DetectArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let observed = parse_dps(&util::read_input(&args.input)?)?;
    tracing::debug!(dps = %describe_values(&observed), "ranking profiles");

    let catalog = util::catalog(global)?;
    let mut ranked = catalog.rank(&observed);
    if ranked.is_empty() {
        return Err(CoreError::NoMatch {
            observed: describe_values(&observed),
        }
        .into());
    }
    if args.best {
        ranked.truncate(1);
    }

    let matches: Vec<DetectMatch> = ranked.iter().map(DetectMatch::from).collect();
    let color = output::should_color(&global.color);
    let out = output::render_list(
        &global.output,
        &matches,
        |m| MatchRow {
            score: output::paint_score(m.score, color),
            config_id: m.config_id.clone(),
            name: m.name.clone(),
            primary: m.primary.clone(),
        },
        |m| m.config_id.clone(),
    )?;
    output::print_output(&out, global.quiet);
    Ok(())
}
