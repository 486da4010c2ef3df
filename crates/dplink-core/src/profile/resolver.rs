// ── Profile resolution ──
//
// Devices never announce their type. The only signal is which datapoint
// ids they report and what shape the values have, so detection ranks every
// profile that could explain the observed bag by the share of observed
// ids it declares.

use std::collections::BTreeSet;
use std::sync::Arc;

use dplink_api::{DpId, DpValue, DpValues};

use super::catalog::ProfileCatalog;
use super::model::{DeviceProfile, ValueKind};

/// Key some observation sources add for their own timestamp; never a
/// datapoint.
pub const BOOKKEEPING_KEY: &str = "updated_at";

/// Whether `value` can be a raw value of a datapoint declared as `kind`.
///
/// Booleans only ever match `Bool`, even where a device might encode them
/// as 0/1. Numbers accept strings that parse losslessly; `Float` also
/// accepts integers.
pub fn type_compatible(kind: ValueKind, value: &DpValue) -> bool {
    match (kind, value) {
        (ValueKind::Bool, DpValue::Bool(_))
        | (ValueKind::Int, DpValue::Int(_))
        | (ValueKind::Float, DpValue::Float(_) | DpValue::Int(_))
        | (ValueKind::Str, DpValue::Str(_)) => true,
        (ValueKind::Int, DpValue::Str(s)) => s.trim().parse::<i64>().is_ok(),
        (ValueKind::Float, DpValue::Str(s)) => s.trim().parse::<f64>().is_ok(),
        _ => false,
    }
}

/// `1=true, 2=5` summary of an observation, for errors and logs.
pub fn describe_values(observed: &DpValues) -> String {
    if observed.is_empty() {
        return "nothing reported".into();
    }
    observed
        .iter()
        .map(|(id, value)| format!("{id}={value}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn is_bookkeeping(id: &DpId) -> bool {
    id.as_str() == BOOKKEEPING_KEY
}

impl DeviceProfile {
    /// Whether every required datapoint is present and type-compatible,
    /// and every optional one that is present is type-compatible too.
    pub fn matches(&self, observed: &DpValues) -> bool {
        let required = self.required_datapoints();
        self.entities()
            .flat_map(|e| e.datapoints.iter())
            .all(|dp| match observed.get(&dp.id) {
                Some(value) => type_compatible(dp.kind, value),
                None => !required.contains(&dp.id),
            })
    }
}

/// Match quality of `profile` against `observed`, 0–100.
///
/// The share of observed ids (bookkeeping key excluded) that the profile
/// declares. `None` when the profile cannot describe the device at all or
/// nothing was observed.
pub fn score_match(profile: &DeviceProfile, observed: &DpValues) -> Option<u8> {
    if !profile.matches(observed) {
        return None;
    }

    let total = observed.keys().filter(|id| !is_bookkeeping(id)).count();
    if total == 0 {
        return None;
    }

    let declared: BTreeSet<&DpId> = profile
        .entities()
        .flat_map(|e| e.datapoints.iter())
        .filter(|dp| {
            observed
                .get(&dp.id)
                .is_some_and(|value| type_compatible(dp.kind, value))
        })
        .map(|dp| &dp.id)
        .collect();

    Some(percentage(declared.len(), total))
}

#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::as_conversions
)]
fn percentage(part: usize, total: usize) -> u8 {
    let pct = (100.0 * part as f64 / total as f64).round();
    pct.clamp(0.0, 100.0) as u8
}

/// A compatible profile and its score.
#[derive(Debug, Clone)]
pub struct RankedProfile {
    pub profile: Arc<DeviceProfile>,
    pub score: u8,
}

impl ProfileCatalog {
    /// Every compatible profile, in catalog order.
    pub fn find_strict_matches(&self, observed: &DpValues) -> Vec<Arc<DeviceProfile>> {
        self.iter()
            .filter(|p| p.matches(observed))
            .cloned()
            .collect()
    }

    /// Every compatible profile with its score, best first; ties keep
    /// catalog order.
    pub fn rank(&self, observed: &DpValues) -> Vec<RankedProfile> {
        let mut ranked: Vec<RankedProfile> = self
            .iter()
            .filter_map(|p| {
                score_match(p, observed).map(|score| RankedProfile {
                    profile: Arc::clone(p),
                    score,
                })
            })
            .collect();
        ranked.sort_by(|a, b| b.score.cmp(&a.score));
        ranked
    }

    /// The highest-scoring compatible profile; first in catalog order on
    /// ties.
    pub fn best_match(&self, observed: &DpValues) -> Option<Arc<DeviceProfile>> {
        self.rank(observed).into_iter().next().map(|r| r.profile)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const A: &str = "
name: A
primary_entity:
  entity: light
  dps:
    - {id: 1, name: switch, type: boolean}
    - {id: 2, name: brightness, type: integer}
";

    const B: &str = "
name: B
primary_entity:
  entity: switch
  dps:
    - {id: 1, name: switch, type: boolean}
";

    fn observed(pairs: &[(&str, DpValue)]) -> DpValues {
        pairs
            .iter()
            .map(|(k, v)| (DpId::from(*k), v.clone()))
            .collect()
    }

    fn catalog() -> ProfileCatalog {
        ProfileCatalog::from_sources([("a", A), ("b", B)]).unwrap()
    }

    #[test]
    fn observations_are_described_in_id_order() {
        let bag = observed(&[("2", DpValue::Int(5)), ("1", DpValue::Bool(true))]);
        assert_eq!(describe_values(&bag), "1=true, 2=5");
        assert_eq!(describe_values(&DpValues::new()), "nothing reported");
    }

    #[test]
    fn superset_and_subset_profiles_rank_by_coverage() {
        let catalog = catalog();
        let bag = observed(&[
            ("1", DpValue::Bool(true)),
            ("2", DpValue::Int(5)),
            (BOOKKEEPING_KEY, DpValue::Int(1_700_000_000)),
        ]);

        let strict_matches = catalog.find_strict_matches(&bag);
        let strict: Vec<&str> = strict_matches
            .iter()
            .map(|p| p.name.as_str())
            .collect();
        assert_eq!(strict, ["A", "B"]);

        let a = catalog.by_config("a").unwrap();
        let b = catalog.by_config("b").unwrap();
        assert_eq!(score_match(a, &bag), Some(100));
        assert_eq!(score_match(b, &bag), Some(50));
        assert_eq!(catalog.best_match(&bag).unwrap().name, "A");
    }

    #[test]
    fn bool_never_matches_integers() {
        let catalog = catalog();
        let bag = observed(&[("1", DpValue::Int(1))]);
        assert!(catalog.find_strict_matches(&bag).is_empty());
        assert!(catalog.best_match(&bag).is_none());
    }

    #[test]
    fn numeric_strings_match_numeric_kinds() {
        assert!(type_compatible(ValueKind::Int, &DpValue::from("42")));
        assert!(!type_compatible(ValueKind::Int, &DpValue::from("4.2")));
        assert!(type_compatible(ValueKind::Float, &DpValue::from("4.2")));
        assert!(type_compatible(ValueKind::Float, &DpValue::Int(4)));
        assert!(!type_compatible(ValueKind::Bool, &DpValue::from("true")));
        assert!(!type_compatible(ValueKind::Str, &DpValue::Int(4)));
    }

    #[test]
    fn missing_required_datapoint_excludes_profile() {
        let catalog = catalog();
        let bag = observed(&[("1", DpValue::Bool(false))]);
        let a = catalog.by_config("a").unwrap();
        assert_eq!(score_match(a, &bag), None);
        assert_eq!(catalog.best_match(&bag).unwrap().name, "B");
    }

    #[test]
    fn ties_keep_catalog_order() {
        let catalog = ProfileCatalog::from_sources([("first", B), ("second", B)]).unwrap();
        let bag = observed(&[("1", DpValue::Bool(true))]);
        let ranked = catalog.rank(&bag);
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].profile.config_id, "first");
        assert_eq!(ranked[0].score, 100);
    }

    #[test]
    fn optional_datapoints_may_be_absent_but_not_mistyped() {
        let catalog = ProfileCatalog::from_sources([(
            "opt",
            "
name: Opt
primary_entity:
  entity: switch
  dps:
    - {id: 1, name: switch, type: boolean}
    - {id: 9, name: countdown, type: integer, optional: true}
",
        )])
        .unwrap();
        let profile = catalog.by_config("opt").unwrap();

        assert_eq!(
            score_match(profile, &observed(&[("1", DpValue::Bool(true))])),
            Some(100)
        );
        assert_eq!(
            score_match(
                profile,
                &observed(&[("1", DpValue::Bool(true)), ("9", DpValue::Bool(true))])
            ),
            None
        );
    }

    #[test]
    fn empty_observation_scores_nothing() {
        let catalog = catalog();
        let bag = observed(&[(BOOKKEEPING_KEY, DpValue::Int(0))]);
        assert_eq!(score_match(catalog.by_config("b").unwrap(), &bag), None);
    }
}
