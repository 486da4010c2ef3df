// ── Raw ↔ semantic value translation ──
//
// A datapoint's mapping table picks one rule by raw value (falling back to
// the default rule), lets a sibling datapoint's raw value override parts of
// that rule, then yields either the rule's explicit value or the scaled raw
// value.

use dplink_api::{DpValue, DpValues};

use super::model::{
    DatapointDescriptor, EntityDescriptor, MappingRule, ValueKind, ValueMapping,
};

/// A rule after sibling-conditional overrides have been applied.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectiveRule<'a> {
    pub dps_val: Option<&'a DpValue>,
    pub value: Option<&'a DpValue>,
    pub scale: f64,
    pub step: Option<f64>,
    pub invalid: bool,
    pub hidden: bool,
}

impl MappingRule {
    /// Apply the condition selected by the sibling's raw value, if any.
    pub fn effective<'a>(&'a self, sibling: Option<&DpValue>) -> EffectiveRule<'a> {
        let mut rule = EffectiveRule {
            dps_val: self.dps_val.as_ref(),
            value: self.value.as_ref(),
            scale: self.scale.unwrap_or(1.0),
            step: self.step,
            invalid: self.invalid,
            hidden: self.hidden,
        };

        let condition = sibling.and_then(|s| self.conditions.iter().find(|c| &c.dps_val == s));
        if let Some(cond) = condition {
            if let Some(value) = &cond.value {
                rule.value = Some(value);
            }
            if let Some(scale) = cond.scale {
                rule.scale = scale;
            }
            if cond.step.is_some() {
                rule.step = cond.step;
            }
            if let Some(invalid) = cond.invalid {
                rule.invalid = invalid;
            }
        }
        rule
    }
}

impl ValueMapping {
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Rule for `raw`: the first exact match, else the first default rule.
    pub fn rule_for(&self, raw: &DpValue) -> Option<&MappingRule> {
        self.rules
            .iter()
            .find(|r| r.dps_val.as_ref() == Some(raw))
            .or_else(|| self.default_rule())
    }

    pub fn default_rule(&self) -> Option<&MappingRule> {
        self.rules.iter().find(|r| r.dps_val.is_none())
    }
}

impl DatapointDescriptor {
    /// Translate a raw value into its semantic value.
    ///
    /// `sibling` resolves a constraint role to that sibling's current raw
    /// value. Returns `None` when the matched rule marks the value invalid.
    pub fn decode(
        &self,
        raw: &DpValue,
        sibling: &dyn Fn(&str) -> Option<DpValue>,
    ) -> Option<DpValue> {
        let Some(rule) = self.mapping.rule_for(raw) else {
            return Some(raw.clone());
        };
        let constraint = rule.constraint.as_deref().and_then(sibling);
        let effective = rule.effective(constraint.as_ref());

        if effective.invalid {
            return None;
        }
        if let Some(value) = effective.value {
            return Some(value.clone());
        }
        Some(scale_down(raw, effective.scale))
    }

    /// Translate a semantic value back to the raw value to send.
    ///
    /// Explicit value rules win; otherwise the value is scaled, snapped to
    /// the step and coerced to the declared kind. A result outside the
    /// declared range yields `None`.
    pub fn encode(
        &self,
        semantic: &DpValue,
        sibling: &dyn Fn(&str) -> Option<DpValue>,
    ) -> Option<DpValue> {
        for rule in &self.mapping.rules {
            let constraint = rule.constraint.as_deref().and_then(sibling);
            let effective = rule.effective(constraint.as_ref());
            if effective.invalid {
                continue;
            }
            if let (Some(value), Some(raw)) = (effective.value, effective.dps_val) {
                if value == semantic {
                    return Some(raw.clone());
                }
            }
        }

        let (scale, step) = match self.mapping.default_rule() {
            Some(rule) => {
                let constraint = rule.constraint.as_deref().and_then(sibling);
                let effective = rule.effective(constraint.as_ref());
                (effective.scale, effective.step)
            }
            None => (1.0, None),
        };

        let raw = match (self.kind, semantic) {
            (ValueKind::Bool, DpValue::Bool(_)) | (ValueKind::Str, DpValue::Str(_)) => {
                semantic.clone()
            }
            (ValueKind::Int | ValueKind::Float, _) => {
                let mut n = semantic.as_f64()? * scale;
                if let Some(step) = step.filter(|s| *s > 0.0) {
                    n = (n / step).round() * step;
                }
                if let Some(range) = &self.range {
                    if !range.contains(n) {
                        return None;
                    }
                }
                if self.kind == ValueKind::Int {
                    DpValue::Int(round_to_i64(n)?)
                } else {
                    DpValue::Float(n)
                }
            }
            _ => return None,
        };
        Some(raw)
    }

    /// Decode using the raw state of the entity's other datapoints.
    pub fn decode_in(
        &self,
        entity: &EntityDescriptor,
        state: &DpValues,
    ) -> Option<DpValue> {
        let raw = state.get(&self.id)?;
        let lookup = |role: &str| entity.sibling_value(role, state).cloned();
        self.decode(raw, &lookup)
    }

    /// Semantic values a user may choose, in declaration order.
    pub fn options(&self, sibling: &dyn Fn(&str) -> Option<DpValue>) -> Vec<DpValue> {
        self.mapping
            .rules
            .iter()
            .filter_map(|rule| {
                let constraint = rule.constraint.as_deref().and_then(sibling);
                let effective = rule.effective(constraint.as_ref());
                if effective.invalid || effective.hidden {
                    return None;
                }
                effective.value.cloned()
            })
            .collect()
    }
}

#[allow(clippy::float_cmp)]
fn scale_down(raw: &DpValue, scale: f64) -> DpValue {
    match raw.as_f64() {
        Some(n) if scale != 1.0 && scale != 0.0 => DpValue::Float(n / scale),
        _ => raw.clone(),
    }
}

#[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
fn round_to_i64(n: f64) -> Option<i64> {
    let rounded = n.round();
    if rounded.is_finite() && rounded >= i64::MIN as f64 && rounded <= i64::MAX as f64 {
        Some(rounded as i64)
    } else {
        None
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use crate::profile::schema::parse_profile;
    use dplink_api::{DpId, DpValue, DpValues};
    use pretty_assertions::assert_eq;

    const HEATER: &str = r#"
name: Panel heater
primary_entity:
  entity: climate
  dps:
    - id: 1
      name: hvac_mode
      type: boolean
      mapping:
        - dps_val: false
          value: "off"
        - dps_val: true
          value: heat
    - id: 2
      name: temperature
      type: integer
      range:
        min: 50
        max: 350
      mapping:
        - scale: 10
          step: 5
          constraint: temperature_unit
          conditions:
            - dps_val: F
              scale: 1
              step: 1
    - id: 3
      name: temperature_unit
      type: string
    - id: 4
      name: preset_mode
      type: string
      mapping:
        - dps_val: eco
          value: Eco
        - dps_val: boost
          value: Boost
        - dps_val: fault
          invalid: true
        - dps_val: factory
          value: Factory
          hidden: true
"#;

    fn state(pairs: &[(&str, DpValue)]) -> DpValues {
        pairs
            .iter()
            .map(|(k, v)| (DpId::from(*k), v.clone()))
            .collect()
    }

    #[test]
    fn decode_explicit_values_and_scale() {
        let profile = parse_profile("panel_heater", HEATER).unwrap();
        let climate = &profile.primary;
        let dps = state(&[
            ("1", DpValue::Bool(true)),
            ("2", DpValue::Int(215)),
            ("3", DpValue::from("C")),
        ]);

        let mode = climate.datapoint("hvac_mode").unwrap();
        assert_eq!(mode.decode_in(climate, &dps), Some(DpValue::from("heat")));

        let temp = climate.datapoint("temperature").unwrap();
        assert_eq!(temp.decode_in(climate, &dps), Some(DpValue::Float(21.5)));
    }

    #[test]
    fn sibling_condition_overrides_scale() {
        let profile = parse_profile("panel_heater", HEATER).unwrap();
        let climate = &profile.primary;
        let dps = state(&[("2", DpValue::Int(70)), ("3", DpValue::from("F"))]);

        let temp = climate.datapoint("temperature").unwrap();
        assert_eq!(temp.decode_in(climate, &dps), Some(DpValue::Int(70)));
    }

    #[test]
    fn invalid_rule_decodes_to_unknown() {
        let profile = parse_profile("panel_heater", HEATER).unwrap();
        let climate = &profile.primary;
        let dps = state(&[("4", DpValue::from("fault"))]);
        let preset = climate.datapoint("preset_mode").unwrap();
        assert_eq!(preset.decode_in(climate, &dps), None);
    }

    #[test]
    fn encode_prefers_explicit_values_then_scales_within_range() {
        let profile = parse_profile("panel_heater", HEATER).unwrap();
        let climate = &profile.primary;
        let none = |_: &str| -> Option<DpValue> { None };

        let mode = climate.datapoint("hvac_mode").unwrap();
        assert_eq!(mode.encode(&DpValue::from("off"), &none), Some(DpValue::Bool(false)));

        let temp = climate.datapoint("temperature").unwrap();
        assert_eq!(temp.encode(&DpValue::Float(21.3), &none), Some(DpValue::Int(215)));
        assert_eq!(temp.encode(&DpValue::Int(40), &none), None);
    }

    #[test]
    fn options_skip_hidden_and_invalid() {
        let profile = parse_profile("panel_heater", HEATER).unwrap();
        let preset = profile.primary.datapoint("preset_mode").unwrap();
        let options = preset.options(&|_| None);
        assert_eq!(options, vec![DpValue::from("Eco"), DpValue::from("Boost")]);
    }
}
