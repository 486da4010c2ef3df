// dplink-core: Device sessions and profile resolution on top of dplink-api.

pub mod config;
pub mod error;
pub mod host;
pub mod profile;
pub mod registry;
pub mod session;

// ── Primary re-exports ──────────────────────────────────────────────
pub use config::{SessionConfig, SessionTuning, default_probe_dps};
pub use error::CoreError;
pub use host::{HostLifecycle, HostPhase};
pub use profile::{
    DatapointDescriptor, DeviceProfile, EntityDescriptor, EntityKind, ProfileCatalog,
    RankedProfile, describe_values, load_catalog, parse_profile, score_match,
};
pub use registry::SessionRegistry;
pub use session::{
    ConsumerHandle, ConsumerId, ConsumerInterest, ObservedState, PendingUpdate, PendingWrite,
    ProtocolStatus, Session, SessionEvent, SessionState,
};

// Transport-level vocabulary consumers need alongside sessions.
pub use dplink_api::{
    DpId, DpValue, DpValues, ProtocolVersion, VersionSelector, values_from_json,
};
