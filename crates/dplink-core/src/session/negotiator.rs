// ── Protocol version negotiation ──

use dplink_api::{ProtocolVersion, VersionSelector};
use tracing::{debug, info, warn};

use crate::config::SessionTuning;

/// Tracks which protocol version to try next and whether the current one
/// is known to work.
#[derive(Debug, Clone)]
pub(crate) struct ProtocolNegotiator {
    candidates: Vec<ProtocolVersion>,
    index: usize,
    pinned: bool,
    confirmed: bool,
    /// Consecutive exhausted retry cycles.
    failures: u32,
    /// Version last pushed to the transport.
    applied: Option<ProtocolVersion>,
    confirmed_attempts: u32,
    auto_attempts: u32,
    failure_reset_count: u32,
}

impl ProtocolNegotiator {
    pub(crate) fn new(selector: VersionSelector, tuning: &SessionTuning) -> Self {
        let (candidates, pinned) = match selector {
            VersionSelector::Pinned(version) => (vec![version], true),
            VersionSelector::Auto if tuning.candidates.is_empty() => {
                (ProtocolVersion::DEFAULT_CANDIDATES.to_vec(), false)
            }
            VersionSelector::Auto => (tuning.candidates.clone(), false),
        };
        Self {
            candidates,
            index: 0,
            pinned,
            confirmed: false,
            failures: 0,
            applied: None,
            confirmed_attempts: tuning.confirmed_attempts.max(1),
            auto_attempts: tuning.auto_attempts(),
            failure_reset_count: tuning.failure_reset_count.max(1),
        }
    }

    pub(crate) fn current(&self) -> ProtocolVersion {
        self.candidates
            .get(self.index)
            .copied()
            .unwrap_or(ProtocolVersion::V3_3)
    }

    pub(crate) fn is_confirmed(&self) -> bool {
        self.confirmed
    }

    pub(crate) fn is_pinned(&self) -> bool {
        self.pinned
    }

    pub(crate) fn failures(&self) -> u32 {
        self.failures
    }

    /// Attempts allowed in one retry cycle.
    pub(crate) fn attempt_budget(&self) -> u32 {
        if self.pinned || self.confirmed {
            self.confirmed_attempts
        } else {
            self.auto_attempts
        }
    }

    /// The version to push to the transport before the next attempt, if it
    /// differs from the one already applied.
    pub(crate) fn pending_version(&self) -> Option<ProtocolVersion> {
        let current = self.current();
        (self.applied != Some(current)).then_some(current)
    }

    pub(crate) fn mark_applied(&mut self, version: ProtocolVersion) {
        self.applied = Some(version);
    }

    /// A successful exchange. Returns `true` when this confirms the
    /// version for the first time.
    pub(crate) fn record_success(&mut self) -> bool {
        self.failures = 0;
        if self.confirmed {
            return false;
        }
        self.confirmed = true;
        info!(version = %self.current(), "protocol version confirmed");
        true
    }

    /// One failed attempt. Rotates to the next candidate while nothing is
    /// confirmed.
    pub(crate) fn record_failed_attempt(&mut self) {
        if self.pinned || self.confirmed || self.candidates.len() < 2 {
            return;
        }
        self.index = (self.index + 1) % self.candidates.len();
        debug!(next = %self.current(), "rotating protocol version");
    }

    /// A whole retry cycle failed. After enough consecutive cycles a
    /// confirmed version is distrusted again.
    pub(crate) fn record_exhausted(&mut self) {
        self.failures = self.failures.saturating_add(1);
        if self.confirmed && !self.pinned && self.failures >= self.failure_reset_count {
            warn!(
                version = %self.current(),
                failures = self.failures,
                "confirmed protocol keeps failing, renegotiating"
            );
            self.confirmed = false;
            self.failures = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auto(candidates: &[ProtocolVersion]) -> ProtocolNegotiator {
        let tuning = SessionTuning {
            candidates: candidates.to_vec(),
            failure_reset_count: 2,
            ..SessionTuning::default()
        };
        ProtocolNegotiator::new(VersionSelector::Auto, &tuning)
    }

    #[test]
    fn rotation_wraps_after_last_candidate() {
        let mut n = auto(&[ProtocolVersion::V3_3, ProtocolVersion::V3_1]);
        assert_eq!(n.attempt_budget(), 5);

        let mut seen = vec![n.current()];
        for _ in 0..4 {
            n.record_failed_attempt();
            seen.push(n.current());
        }
        assert_eq!(
            seen,
            [
                ProtocolVersion::V3_3,
                ProtocolVersion::V3_1,
                ProtocolVersion::V3_3,
                ProtocolVersion::V3_1,
                ProtocolVersion::V3_3,
            ]
        );
    }

    #[test]
    fn pinned_never_rotates() {
        let tuning = SessionTuning::default();
        let mut n =
            ProtocolNegotiator::new(VersionSelector::Pinned(ProtocolVersion::V3_4), &tuning);
        n.record_failed_attempt();
        n.record_exhausted();
        assert_eq!(n.current(), ProtocolVersion::V3_4);
        assert_eq!(n.attempt_budget(), 3);
    }

    #[test]
    fn confirmed_version_is_kept_until_the_failure_streak() {
        let mut n = auto(&[ProtocolVersion::V3_3, ProtocolVersion::V3_1]);
        n.record_failed_attempt();
        assert!(n.record_success());
        assert!(!n.record_success());
        assert_eq!(n.attempt_budget(), 3);

        n.record_failed_attempt();
        assert_eq!(n.current(), ProtocolVersion::V3_1);

        n.record_exhausted();
        assert!(n.is_confirmed());
        n.record_exhausted();
        assert!(!n.is_confirmed());
        assert_eq!(n.attempt_budget(), 5);
    }

    #[test]
    fn empty_candidate_list_negotiates_over_the_defaults() {
        let n = auto(&[]);
        let defaults = ProtocolVersion::DEFAULT_CANDIDATES.len();
        assert_eq!(n.candidates.len(), defaults);
        assert_eq!(n.attempt_budget(), SessionTuning::default().auto_attempts());
        assert_eq!(n.attempt_budget(), 13);
    }

    #[test]
    fn pending_version_tracks_what_was_applied() {
        let mut n = auto(&[ProtocolVersion::V3_3, ProtocolVersion::V3_1]);
        assert_eq!(n.pending_version(), Some(ProtocolVersion::V3_3));
        n.mark_applied(ProtocolVersion::V3_3);
        assert_eq!(n.pending_version(), None);
        n.record_failed_attempt();
        assert_eq!(n.pending_version(), Some(ProtocolVersion::V3_1));
    }
}
