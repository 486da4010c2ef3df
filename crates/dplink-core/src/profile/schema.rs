// ── Profile file schema ──
//
// Profiles are YAML documents. Deserialization goes into loose `Raw*`
// structs first; `build` then validates and converts them into the typed
// model so that every structural error is reported with its file name at
// load time rather than surfacing at runtime.

use std::collections::HashSet;
use std::str::FromStr;

use dplink_api::{DpId, DpValue};
use serde::Deserialize;

use super::model::{
    DatapointDescriptor, DeviceProfile, DpFlags, EntityCategory, EntityDescriptor, EntityKind,
    LegacyAdapter, MappingCondition, MappingRule, Product, RawEncoding, ValueMapping, ValueRange,
};
use crate::error::CoreError;

#[derive(Debug, Deserialize)]
struct RawProfile {
    name: String,
    #[serde(default)]
    legacy_type: Option<String>,
    #[serde(default)]
    products: Vec<RawProduct>,
    primary_entity: RawEntity,
    #[serde(default)]
    secondary_entities: Vec<RawEntity>,
}

#[derive(Debug, Deserialize)]
struct RawProduct {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    manufacturer: Option<String>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawEntity {
    entity: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    class: Option<String>,
    #[serde(default)]
    icon: Option<String>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    hidden: bool,
    #[serde(default)]
    legacy_class: Option<String>,
    #[serde(default)]
    dps: Vec<RawDatapoint>,
}

#[derive(Debug, Deserialize)]
#[allow(clippy::struct_excessive_bools)]
struct RawDatapoint {
    id: DpId,
    name: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    mapping: Vec<RawRule>,
    #[serde(default)]
    range: Option<RawRange>,
    #[serde(default)]
    unit: Option<String>,
    #[serde(default = "default_persist")]
    persist: bool,
    #[serde(default)]
    force: bool,
    #[serde(default)]
    hidden: bool,
    #[serde(default)]
    readonly: bool,
    #[serde(default)]
    optional: bool,
    #[serde(default)]
    sensitive: bool,
}

fn default_persist() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct RawRange {
    min: f64,
    max: f64,
}

#[derive(Debug, Deserialize)]
struct RawRule {
    #[serde(default)]
    dps_val: Option<DpValue>,
    #[serde(default)]
    value: Option<DpValue>,
    #[serde(default)]
    scale: Option<f64>,
    #[serde(default)]
    step: Option<f64>,
    #[serde(default)]
    invalid: bool,
    #[serde(default)]
    hidden: bool,
    #[serde(default)]
    constraint: Option<String>,
    #[serde(default)]
    conditions: Vec<RawCondition>,
}

#[derive(Debug, Deserialize)]
struct RawCondition {
    dps_val: DpValue,
    #[serde(default)]
    value: Option<DpValue>,
    #[serde(default)]
    scale: Option<f64>,
    #[serde(default)]
    step: Option<f64>,
    #[serde(default)]
    invalid: Option<bool>,
}

/// Parse and validate one profile document.
///
/// `config_id` is the file stem; it names the profile in errors and in
/// the catalog.
pub fn parse_profile(config_id: &str, text: &str) -> Result<DeviceProfile, CoreError> {
    let raw: RawProfile =
        serde_yaml::from_str(text).map_err(|e| CoreError::config(config_id, e.to_string()))?;
    build(config_id, raw)
}

fn build(config_id: &str, raw: RawProfile) -> Result<DeviceProfile, CoreError> {
    if raw.name.trim().is_empty() {
        return Err(CoreError::config(config_id, "profile name is empty"));
    }

    let primary = build_entity(config_id, raw.primary_entity)?;
    let secondary = raw
        .secondary_entities
        .into_iter()
        .map(|e| build_entity(config_id, e))
        .collect::<Result<Vec<_>, _>>()?;

    let products = raw
        .products
        .into_iter()
        .map(|p| Product {
            id: p.id,
            name: p.name,
            manufacturer: p.manufacturer,
            model: p.model,
        })
        .collect();

    Ok(DeviceProfile {
        name: raw.name,
        config_id: config_id.to_owned(),
        primary,
        secondary,
        legacy_type: raw.legacy_type,
        products,
    })
}

fn build_entity(config_id: &str, raw: RawEntity) -> Result<EntityDescriptor, CoreError> {
    let kind = EntityKind::from_str(&raw.entity).map_err(|_| {
        CoreError::config(config_id, format!("unknown entity kind '{}'", raw.entity))
    })?;
    let label = raw.name.as_deref().unwrap_or(kind.as_ref()).to_owned();

    if raw.dps.is_empty() {
        return Err(CoreError::config(
            config_id,
            format!("entity '{label}' declares no datapoints"),
        ));
    }

    let category = raw
        .category
        .as_deref()
        .map(|c| {
            EntityCategory::from_str(c).map_err(|_| {
                CoreError::config(config_id, format!("entity '{label}': unknown category '{c}'"))
            })
        })
        .transpose()?;

    let legacy_adapter = raw
        .legacy_class
        .as_deref()
        .map(|class| parse_legacy_class(config_id, &label, kind, class))
        .transpose()?;

    let mut seen = HashSet::new();
    let mut datapoints = Vec::with_capacity(raw.dps.len());
    for dp in raw.dps {
        if !seen.insert(dp.id.clone()) {
            return Err(CoreError::config(
                config_id,
                format!("entity '{label}': datapoint {} declared twice", dp.id),
            ));
        }
        datapoints.push(build_datapoint(config_id, &label, dp)?);
    }

    let roles: HashSet<&str> = datapoints.iter().map(|dp| dp.role.as_str()).collect();
    for dp in &datapoints {
        for rule in &dp.mapping.rules {
            if let Some(constraint) = &rule.constraint {
                if !roles.contains(constraint.as_str()) {
                    return Err(CoreError::config(
                        config_id,
                        format!(
                            "entity '{label}': datapoint {} constrains on unknown role '{constraint}'",
                            dp.id
                        ),
                    ));
                }
            }
        }
    }

    Ok(EntityDescriptor {
        kind,
        name: raw.name,
        device_class: raw.class,
        icon: raw.icon,
        category,
        hidden: raw.hidden,
        legacy_adapter,
        datapoints,
    })
}

/// Accepts the bare adapter name (`goldair_heater`) or a dotted class path
/// whose last segment is that name.
fn parse_legacy_class(
    config_id: &str,
    label: &str,
    kind: EntityKind,
    class: &str,
) -> Result<LegacyAdapter, CoreError> {
    let name = class.rsplit('.').next().unwrap_or(class);
    let adapter = LegacyAdapter::from_str(name).map_err(|_| {
        CoreError::config(
            config_id,
            format!("entity '{label}': unknown legacy_class '{class}'"),
        )
    })?;
    if adapter.entity_kind() != kind {
        return Err(CoreError::config(
            config_id,
            format!(
                "entity '{label}': legacy_class '{class}' adapts {} entities, not {kind}",
                adapter.entity_kind()
            ),
        ));
    }
    Ok(adapter)
}

fn build_datapoint(
    config_id: &str,
    label: &str,
    raw: RawDatapoint,
) -> Result<DatapointDescriptor, CoreError> {
    let encoding = RawEncoding::from_str(&raw.kind).map_err(|_| {
        CoreError::config(
            config_id,
            format!(
                "entity '{label}': datapoint {} has unknown type '{}'",
                raw.id, raw.kind
            ),
        )
    })?;

    let range = match raw.range {
        Some(r) if r.min > r.max => {
            return Err(CoreError::config(
                config_id,
                format!(
                    "entity '{label}': datapoint {} range min {} exceeds max {}",
                    raw.id, r.min, r.max
                ),
            ));
        }
        Some(r) => Some(ValueRange {
            min: r.min,
            max: r.max,
        }),
        None => None,
    };

    let mut rules = Vec::with_capacity(raw.mapping.len());
    for rule in raw.mapping {
        let zero_scale = rule.scale == Some(0.0)
            || rule.conditions.iter().any(|c| c.scale == Some(0.0));
        if zero_scale {
            return Err(CoreError::config(
                config_id,
                format!("entity '{label}': datapoint {} has a zero scale", raw.id),
            ));
        }
        if !rule.conditions.is_empty() && rule.constraint.is_none() {
            return Err(CoreError::config(
                config_id,
                format!(
                    "entity '{label}': datapoint {} has conditions without a constraint",
                    raw.id
                ),
            ));
        }
        rules.push(MappingRule {
            dps_val: rule.dps_val,
            value: rule.value,
            scale: rule.scale,
            step: rule.step,
            invalid: rule.invalid,
            hidden: rule.hidden,
            constraint: rule.constraint,
            conditions: rule
                .conditions
                .into_iter()
                .map(|c| MappingCondition {
                    dps_val: c.dps_val,
                    value: c.value,
                    scale: c.scale,
                    step: c.step,
                    invalid: c.invalid,
                })
                .collect(),
        });
    }

    Ok(DatapointDescriptor {
        id: raw.id,
        role: raw.name,
        kind: encoding.kind(),
        encoding,
        mapping: ValueMapping { rules },
        range,
        unit: raw.unit,
        flags: DpFlags {
            persistent: raw.persist,
            force_poll: raw.force,
            hidden: raw.hidden,
            readonly: raw.readonly,
            optional: raw.optional,
            sensitive: raw.sensitive,
        },
    })
}
