// ── Device profile model ──
//
// The strongly-typed form of a profile definition. Built once by
// `schema::parse_profile`, immutable afterwards.

use std::collections::{BTreeMap, BTreeSet};

use dplink_api::{DpId, DpValue, DpValues};
use serde::Serialize;
use strum::{AsRefStr, Display, EnumIter, EnumString};

// ── Enumerations ────────────────────────────────────────────────────

/// Kind of entity a profile exposes to the host application.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display, AsRefStr, EnumString, EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EntityKind {
    Switch,
    Climate,
    Light,
    Fan,
    Lock,
    Sensor,
    BinarySensor,
    Number,
    Select,
    Button,
    Cover,
    Vacuum,
    WaterHeater,
    Humidifier,
    Valve,
    Siren,
    AlarmControlPanel,
    Event,
    Text,
    Time,
    Camera,
    Remote,
    LawnMower,
    Infrared,
    Update,
}

/// Declared value kind of a datapoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display, AsRefStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ValueKind {
    Bool,
    Int,
    Float,
    Str,
}

/// How a datapoint's raw value is encoded on the wire. Every encoding
/// reduces to one [`ValueKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum RawEncoding {
    Boolean,
    Integer,
    Float,
    String,
    Bitfield,
    Json,
    Base64,
    Hex,
    Utf16b64,
}

impl RawEncoding {
    pub fn kind(self) -> ValueKind {
        match self {
            Self::Boolean => ValueKind::Bool,
            Self::Integer | Self::Bitfield => ValueKind::Int,
            Self::Float => ValueKind::Float,
            Self::String | Self::Json | Self::Base64 | Self::Hex | Self::Utf16b64 => {
                ValueKind::Str
            }
        }
    }
}

/// Entity grouping hint for the host UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum EntityCategory {
    Config,
    Diagnostic,
}

/// Compatibility adapters for entities that predate the declarative
/// profile format. Resolved from the `legacy_class` key at load time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display, EnumString, EnumIter)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LegacyAdapter {
    GoldairHeater,
    GoldairHeaterLight,
    GoldairHeaterLock,
    GoldairDehumidifier,
    GoldairDehumidifierLight,
    GoldairDehumidifierLock,
    GoldairFan,
    GoldairFanLight,
    GecoHeater,
    GpcvHeater,
    KoganHeater,
    KoganSocket,
}

impl LegacyAdapter {
    /// The entity kind the adapter was written for.
    pub fn entity_kind(self) -> EntityKind {
        match self {
            Self::GoldairHeater
            | Self::GoldairDehumidifier
            | Self::GoldairFan
            | Self::GecoHeater
            | Self::GpcvHeater
            | Self::KoganHeater => EntityKind::Climate,
            Self::GoldairHeaterLight | Self::GoldairDehumidifierLight | Self::GoldairFanLight => {
                EntityKind::Light
            }
            Self::GoldairHeaterLock | Self::GoldairDehumidifierLock => EntityKind::Lock,
            Self::KoganSocket => EntityKind::Switch,
        }
    }
}

// ── Value mapping ───────────────────────────────────────────────────

/// Sibling-conditional override inside a [`MappingRule`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MappingCondition {
    /// Raw value of the constraint sibling this override applies to.
    pub dps_val: DpValue,
    pub value: Option<DpValue>,
    pub scale: Option<f64>,
    pub step: Option<f64>,
    pub invalid: Option<bool>,
}

/// One raw ↔ semantic translation rule.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MappingRule {
    /// Raw value this rule matches; `None` marks the default rule.
    pub dps_val: Option<DpValue>,
    pub value: Option<DpValue>,
    pub scale: Option<f64>,
    pub step: Option<f64>,
    pub invalid: bool,
    pub hidden: bool,
    /// Role name of the sibling datapoint whose raw value selects a
    /// condition.
    pub constraint: Option<String>,
    pub conditions: Vec<MappingCondition>,
}

/// Ordered list of mapping rules; empty means identity.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ValueMapping {
    pub rules: Vec<MappingRule>,
}

/// Inclusive numeric bounds on the raw value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ValueRange {
    pub min: f64,
    pub max: f64,
}

impl ValueRange {
    pub fn contains(&self, value: f64) -> bool {
        (self.min..=self.max).contains(&value)
    }
}

// ── Descriptors ─────────────────────────────────────────────────────

/// Behaviour flags of a datapoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[allow(clippy::struct_excessive_bools)]
pub struct DpFlags {
    /// Keep the cached value when a full poll omits it.
    pub persistent: bool,
    /// Poll explicitly when the cache goes stale.
    pub force_poll: bool,
    pub hidden: bool,
    pub readonly: bool,
    /// May be absent from a device implementing the profile.
    pub optional: bool,
    /// Value must be redacted from diagnostics.
    pub sensitive: bool,
}

/// One datapoint as an entity uses it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatapointDescriptor {
    pub id: DpId,
    /// Semantic role within the entity (`switch`, `temperature`, ...).
    pub role: String,
    pub kind: ValueKind,
    pub encoding: RawEncoding,
    pub mapping: ValueMapping,
    pub range: Option<ValueRange>,
    pub unit: Option<String>,
    pub flags: DpFlags,
}

/// One entity a profile exposes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityDescriptor {
    pub kind: EntityKind,
    pub name: Option<String>,
    pub device_class: Option<String>,
    pub icon: Option<String>,
    pub category: Option<EntityCategory>,
    pub hidden: bool,
    pub legacy_adapter: Option<LegacyAdapter>,
    pub datapoints: Vec<DatapointDescriptor>,
}

impl EntityDescriptor {
    /// The datapoint playing `role`, if the entity declares one.
    pub fn datapoint(&self, role: &str) -> Option<&DatapointDescriptor> {
        self.datapoints.iter().find(|dp| dp.role == role)
    }

    pub fn datapoint_by_id(&self, id: &DpId) -> Option<&DatapointDescriptor> {
        self.datapoints.iter().find(|dp| &dp.id == id)
    }

    /// Stable key of the entity within its profile: the kind, suffixed
    /// with the snake-cased name when named.
    pub fn config_key(&self) -> String {
        match &self.name {
            Some(name) => format!("{}_{}", self.kind, snake_case(name)),
            None => self.kind.to_string(),
        }
    }

    /// Raw value of the sibling playing `role` in `state`.
    pub fn sibling_value<'a>(&self, role: &str, state: &'a DpValues) -> Option<&'a DpValue> {
        self.datapoint(role).and_then(|dp| state.get(&dp.id))
    }
}

/// A product the profile is known to describe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Product {
    pub id: String,
    pub name: Option<String>,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
}

/// Static description of one supported device shape.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceProfile {
    pub name: String,
    /// File stem the profile was loaded from; unique within a catalog.
    pub config_id: String,
    pub primary: EntityDescriptor,
    pub secondary: Vec<EntityDescriptor>,
    /// Device type used by configurations that predate profile detection.
    pub legacy_type: Option<String>,
    pub products: Vec<Product>,
}

impl DeviceProfile {
    /// Primary entity first, then secondaries in declaration order.
    pub fn entities(&self) -> impl Iterator<Item = &EntityDescriptor> {
        std::iter::once(&self.primary).chain(self.secondary.iter())
    }

    /// Every datapoint id the profile declares, each with its first
    /// declaration.
    pub fn all_datapoints(&self) -> BTreeMap<&DpId, &DatapointDescriptor> {
        let mut all = BTreeMap::new();
        for dp in self.entities().flat_map(|e| e.datapoints.iter()) {
            all.entry(&dp.id).or_insert(dp);
        }
        all
    }

    /// Ids that a device must report. An id shared by several entities is
    /// required unless every declaration marks it optional.
    pub fn required_datapoints(&self) -> BTreeSet<&DpId> {
        self.entities()
            .flat_map(|e| e.datapoints.iter())
            .filter(|dp| !dp.flags.optional)
            .map(|dp| &dp.id)
            .collect()
    }

    /// Every declaration of `id`, across entities.
    pub fn declarations<'a>(
        &'a self,
        id: &'a DpId,
    ) -> impl Iterator<Item = &'a DatapointDescriptor> + 'a {
        self.entities()
            .flat_map(|e| e.datapoints.iter())
            .filter(move |dp| &dp.id == id)
    }

    pub fn entity(&self, config_key: &str) -> Option<&EntityDescriptor> {
        self.entities().find(|e| e.config_key() == config_key)
    }

    pub fn matches_product(&self, product_id: &str) -> bool {
        self.products.iter().any(|p| p.id == product_id)
    }
}

pub(crate) fn snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.ends_with('_') && !out.is_empty() {
            out.push('_');
        }
    }
    while out.ends_with('_') {
        out.pop();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn entity_kinds_parse_snake_case() {
        assert_eq!(
            EntityKind::from_str("binary_sensor").ok(),
            Some(EntityKind::BinarySensor)
        );
        assert_eq!(EntityKind::AlarmControlPanel.to_string(), "alarm_control_panel");
        assert!(EntityKind::from_str("toaster").is_err());
    }

    #[test]
    fn encodings_reduce_to_kinds() {
        assert_eq!(RawEncoding::Bitfield.kind(), ValueKind::Int);
        assert_eq!(RawEncoding::Utf16b64.kind(), ValueKind::Str);
        assert_eq!(RawEncoding::from_str("base64").ok(), Some(RawEncoding::Base64));
    }

    #[test]
    fn legacy_adapters_know_their_entity() {
        assert_eq!(
            LegacyAdapter::from_str("kogan_socket").ok(),
            Some(LegacyAdapter::KoganSocket)
        );
        assert_eq!(
            LegacyAdapter::GoldairDehumidifierLock.entity_kind(),
            EntityKind::Lock
        );
    }

    #[test]
    fn snake_case_collapses_separators() {
        assert_eq!(snake_case("Child Lock"), "child_lock");
        assert_eq!(snake_case("  LED -- display "), "led_display");
    }
}
