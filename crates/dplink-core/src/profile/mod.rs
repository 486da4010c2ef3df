// ── Device profiles ──
//
// Declarative descriptions of supported devices: the schema they are
// written in, the catalog that holds them, and the resolver that matches
// an observed datapoint bag against them.

pub mod catalog;
pub mod mapping;
pub mod model;
pub mod resolver;
pub mod schema;

pub use catalog::{ProfileCatalog, global, init, load_catalog};
pub use mapping::EffectiveRule;
pub use model::{
    DatapointDescriptor, DeviceProfile, DpFlags, EntityCategory, EntityDescriptor, EntityKind,
    LegacyAdapter, MappingCondition, MappingRule, Product, RawEncoding, ValueKind, ValueMapping,
    ValueRange,
};
pub use resolver::{
    BOOKKEEPING_KEY, RankedProfile, describe_values, score_match, type_compatible,
};
pub use schema::parse_profile;
