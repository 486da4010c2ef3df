//! Transport boundary for local datapoint-protocol devices.
//!
//! Devices speak a proprietary, encrypted, versioned binary protocol. The
//! codec itself lives behind the [`DeviceTransport`] trait; this crate fixes
//! everything the session layer needs to reason about a device without
//! knowing that codec:
//!
//! - **[`DpId`] / [`DpValue`]**: datapoint keys and raw values, tagged at
//!   ingestion so booleans never masquerade as integers.
//! - **[`Frame`]**: a decoded device reply (datapoints, error payload, or
//!   nothing), including the conventional JSON envelope decoder.
//! - **[`ProtocolVersion`] / [`VersionSelector`]**: the ordered candidate
//!   list a session negotiates over.
//! - **[`TransportHandle`]**: blocking transports off-loaded onto the tokio
//!   blocking pool, optionally chained behind a parent gateway handle.

pub mod error;
pub mod frame;
pub mod transport;
pub mod value;
pub mod version;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use error::Error;
pub use frame::Frame;
pub use transport::{
    DeviceTransport, SharedTransport, TransportConfig, TransportFactory, TransportHandle,
};
pub use value::{DpId, DpValue, DpValues, values_from_json};
pub use version::{ProtocolVersion, VersionSelector};
