// ── Runtime session configuration ──
//
// These types describe *how* to talk to one device. They carry the local
// key and timing knobs, but never touch disk: `dplink-config` (or an
// embedding application) builds a `SessionConfig` and hands it in.

use std::time::Duration;

use dplink_api::{DpId, ProtocolVersion, TransportConfig, VersionSelector};
use secrecy::SecretString;

/// Timing and retry knobs for a session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionTuning {
    /// How long an optimistic write is shown without device confirmation.
    pub fake_it_timeout: Duration,
    /// Age after which the cache needs a fresh poll.
    pub cache_timeout: Duration,
    /// Coalescing window for writes.
    pub coalesce_window: Duration,
    /// Coalescing window used when the previous flush was recent.
    pub busy_coalesce_window: Duration,
    /// A flush closer than this to the previous one counts as busy.
    pub busy_threshold: Duration,
    /// Attempts per operation once the protocol is pinned or confirmed.
    pub confirmed_attempts: u32,
    /// Exhausted cycles in a row before a confirmed protocol is dropped.
    pub failure_reset_count: u32,
    /// Loop sleep once the device has reported state.
    pub idle_with_state: Duration,
    /// Loop sleep while the device has reported nothing.
    pub idle_without_state: Duration,
    /// Loop sleep after an unexpected error.
    pub error_backoff: Duration,
    /// Pause between attempts inside one retry cycle.
    pub retry_delay: Duration,
    /// Minimum spacing of keep-alives on a persistent connection.
    pub heartbeat_interval: Duration,
    /// Longest single listen for pushes on a persistent connection. The
    /// device lock is held meanwhile, so writes can wait up to this long.
    pub receive_window: Duration,
    /// Per-exchange timeout handed to the transport.
    pub transport_timeout: Duration,
    /// Datapoints queried when detecting an unknown device.
    pub probe_dps: Vec<DpId>,
    /// Negotiation order for `auto` sessions.
    pub candidates: Vec<ProtocolVersion>,
}

impl Default for SessionTuning {
    fn default() -> Self {
        Self {
            fake_it_timeout: Duration::from_secs(5),
            cache_timeout: Duration::from_secs(30),
            coalesce_window: Duration::from_millis(1),
            busy_coalesce_window: Duration::from_secs(1),
            busy_threshold: Duration::from_secs(1),
            confirmed_attempts: 3,
            failure_reset_count: 10,
            idle_with_state: Duration::from_millis(100),
            idle_without_state: Duration::from_secs(5),
            error_backoff: Duration::from_secs(5),
            retry_delay: Duration::ZERO,
            heartbeat_interval: Duration::from_secs(10),
            receive_window: Duration::from_millis(100),
            transport_timeout: Duration::from_secs(5),
            probe_dps: default_probe_dps(),
            candidates: ProtocolVersion::DEFAULT_CANDIDATES.to_vec(),
        }
    }
}

/// Datapoints that most device families answer on.
pub fn default_probe_dps() -> Vec<DpId> {
    [1u32, 2, 9, 20, 60, 101, 148, 201]
        .into_iter()
        .map(DpId::from)
        .collect()
}

impl SessionTuning {
    /// Attempt budget while negotiating: enough to cycle the candidate
    /// list twice, plus one. An empty list means the default candidates.
    pub fn auto_attempts(&self) -> u32 {
        let candidates = if self.candidates.is_empty() {
            ProtocolVersion::DEFAULT_CANDIDATES.len()
        } else {
            self.candidates.len()
        };
        u32::try_from(candidates)
            .unwrap_or(u32::MAX / 2)
            .saturating_mul(2)
            .saturating_add(1)
    }
}

/// Everything needed to run a session for one device.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub device_id: String,
    /// Human-readable name, used in logs only.
    pub name: Option<String>,
    pub address: String,
    pub port: u16,
    pub local_key: SecretString,
    pub protocol: VersionSelector,
    /// Node id when the device sits behind a gateway.
    pub sub_device_id: Option<String>,
    /// Device id of the gateway session this device routes through.
    pub gateway: Option<String>,
    /// Never keep a persistent connection open.
    pub poll_only: bool,
    pub tuning: SessionTuning,
}

impl SessionConfig {
    pub fn new(
        device_id: impl Into<String>,
        address: impl Into<String>,
        local_key: SecretString,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            name: None,
            address: address.into(),
            port: TransportConfig::DEFAULT_PORT,
            local_key,
            protocol: VersionSelector::Auto,
            sub_device_id: None,
            gateway: None,
            poll_only: false,
            tuning: SessionTuning::default(),
        }
    }

    /// Name for logs: the configured name, else the device id.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.device_id)
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            device_id: self.device_id.clone(),
            address: self.address.clone(),
            port: self.port,
            local_key: self.local_key.clone(),
            timeout: self.tuning.transport_timeout,
            sub_device_id: self.sub_device_id.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_budget_cycles_candidates_twice() {
        let mut tuning = SessionTuning::default();
        assert_eq!(tuning.auto_attempts(), 13);
        tuning.candidates = vec![ProtocolVersion::V3_3, ProtocolVersion::V3_1];
        assert_eq!(tuning.auto_attempts(), 5);
    }

    #[test]
    fn transport_config_carries_sub_device() {
        let mut config = SessionConfig::new("bf01", "192.0.2.4", SecretString::from(String::from("k")));
        config.sub_device_id = Some("node-3".into());
        let transport = config.transport_config();
        assert_eq!(transport.sub_device_id.as_deref(), Some("node-3"));
        assert_eq!(transport.port, 6668);
        assert_eq!(config.display_name(), "bf01");
    }
}
