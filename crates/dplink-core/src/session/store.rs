// ── Per-device state store ──
//
// Two layers: the confirmed cache (what the device last reported) and the
// pending overlay (what consumers asked for but the device has not echoed
// yet). The confirmed cache has a single writer, the session loop; readers
// get cheap `Arc` snapshots through a `watch` channel. Pending updates
// live in a `DashMap` because writes arrive from any task.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dplink_api::{DpId, DpValue, DpValues};
use tokio::sync::watch;
use tokio::time::Instant;

/// Confirmed device state at one point in time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObservedState {
    pub dps: DpValues,
    /// Wall-clock time of the last accepted frame.
    pub updated_at: Option<DateTime<Utc>>,
    /// Monotonic time of the last accepted frame, for staleness checks.
    pub(crate) refreshed: Option<Instant>,
}

impl ObservedState {
    pub fn get(&self, id: &DpId) -> Option<&DpValue> {
        self.dps.get(id)
    }

    pub fn is_empty(&self) -> bool {
        self.dps.is_empty()
    }
}

/// An optimistic value awaiting device confirmation.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingUpdate {
    pub value: DpValue,
    pub issued: Instant,
    pub sent: bool,
}

impl PendingUpdate {
    fn expired(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.issued) > timeout
    }
}

/// What an ingested frame changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct IngestOutcome {
    pub changed: BTreeSet<DpId>,
    pub dropped: BTreeSet<DpId>,
}

pub(crate) struct DeviceStore {
    confirmed: watch::Sender<Arc<ObservedState>>,
    pending: DashMap<DpId, PendingUpdate>,
    fake_it_timeout: Duration,
}

impl DeviceStore {
    pub(crate) fn new(fake_it_timeout: Duration) -> Self {
        let (confirmed, _) = watch::channel(Arc::new(ObservedState::default()));
        Self {
            confirmed,
            pending: DashMap::new(),
            fake_it_timeout,
        }
    }

    // ── Reads ────────────────────────────────────────────────────────

    /// Pending value if one is live, else the confirmed value.
    pub(crate) fn read(&self, id: &DpId) -> Option<DpValue> {
        let now = Instant::now();
        if let Some(pending) = self.pending.get(id) {
            if !pending.expired(now, self.fake_it_timeout) {
                return Some(pending.value.clone());
            }
        }
        self.confirmed.borrow().dps.get(id).cloned()
    }

    pub(crate) fn snapshot(&self) -> Arc<ObservedState> {
        Arc::clone(&self.confirmed.borrow())
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<Arc<ObservedState>> {
        self.confirmed.subscribe()
    }

    pub(crate) fn has_state(&self) -> bool {
        !self.confirmed.borrow().dps.is_empty()
    }

    /// Whether the cache is older than `max_age` (or was never filled).
    pub(crate) fn is_stale(&self, max_age: Duration) -> bool {
        match self.confirmed.borrow().refreshed {
            Some(at) => at.elapsed() > max_age,
            None => true,
        }
    }

    pub(crate) fn pending(&self) -> Vec<(DpId, PendingUpdate)> {
        self.pending
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    // ── Pending overlay ──────────────────────────────────────────────

    /// Record optimistic values. A newer write to the same id replaces the
    /// older one and is unsent again.
    pub(crate) fn record_pending(&self, values: &DpValues) {
        let now = Instant::now();
        for (id, value) in values {
            self.pending.insert(
                id.clone(),
                PendingUpdate {
                    value: value.clone(),
                    issued: now,
                    sent: false,
                },
            );
        }
    }

    /// Unsent pending values, ordered by id.
    pub(crate) fn unsent(&self) -> DpValues {
        let now = Instant::now();
        self.pending
            .iter()
            .filter(|e| !e.sent && !e.expired(now, self.fake_it_timeout))
            .map(|e| (e.key().clone(), e.value.clone()))
            .collect()
    }

    /// Mark a sent batch. Entries overwritten since the batch was taken
    /// stay unsent.
    pub(crate) fn mark_sent(&self, batch: &DpValues) {
        for (id, value) in batch {
            if let Some(mut entry) = self.pending.get_mut(id) {
                if &entry.value == value {
                    entry.sent = true;
                }
            }
        }
    }

    /// Forget a batch the device never accepted, so reads fall back to the
    /// confirmed value and later batches do not carry it again. Entries
    /// overwritten since the batch was taken are kept.
    pub(crate) fn discard(&self, batch: &DpValues) {
        for (id, value) in batch {
            self.pending
                .remove_if(id, |_, p| !p.sent && &p.value == value);
        }
    }

    /// Drop entries that are confirmed by `observed` or have expired.
    pub(crate) fn reconcile(&self, observed: &DpValues) {
        let now = Instant::now();
        self.pending.retain(|id, p| {
            let confirmed = p.sent && observed.get(id) == Some(&p.value);
            !confirmed && !p.expired(now, self.fake_it_timeout)
        });
    }

    pub(crate) fn expire_pending(&self) {
        let now = Instant::now();
        self.pending
            .retain(|_, p| !p.expired(now, self.fake_it_timeout));
    }

    pub(crate) fn clear_pending(&self) {
        self.pending.clear();
    }

    // ── Confirmed cache (session loop only) ──────────────────────────

    /// Merge a frame into the cache.
    ///
    /// After a full poll, non-persistent ids the device did not report are
    /// dropped unless a pending write overlays them.
    pub(crate) fn ingest(
        &self,
        dps: &DpValues,
        full_poll: bool,
        persistent: &BTreeSet<DpId>,
    ) -> IngestOutcome {
        let mut outcome = IngestOutcome::default();
        let mut next = ObservedState::clone(&self.confirmed.borrow());

        if full_poll {
            let now = Instant::now();
            next.dps.retain(|id, _| {
                let keep = dps.contains_key(id)
                    || persistent.contains(id)
                    || self
                        .pending
                        .get(id)
                        .is_some_and(|p| !p.expired(now, self.fake_it_timeout));
                if !keep {
                    outcome.dropped.insert(id.clone());
                }
                keep
            });
        }

        for (id, value) in dps {
            if next.dps.get(id) != Some(value) {
                outcome.changed.insert(id.clone());
            }
            next.dps.insert(id.clone(), value.clone());
        }
        next.updated_at = Some(Utc::now());
        next.refreshed = Some(Instant::now());

        self.confirmed.send_replace(Arc::new(next));
        self.reconcile(dps);
        outcome
    }

    /// Write `value` into the confirmed cache only; the next frame from the
    /// device overwrites it.
    pub(crate) fn anticipate(&self, id: DpId, value: DpValue) {
        self.confirmed.send_modify(|state| {
            Arc::make_mut(state).dps.insert(id, value);
        });
    }

    /// Keep the values but treat the cache as stale, so the next loop
    /// iteration does a full poll.
    pub(crate) fn invalidate(&self) {
        self.confirmed.send_if_modified(|state| {
            if state.refreshed.is_none() {
                return false;
            }
            Arc::make_mut(state).refreshed = None;
            true
        });
    }

    /// Back to the empty baseline.
    pub(crate) fn reset(&self) {
        self.confirmed
            .send_replace(Arc::new(ObservedState::default()));
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn dps(pairs: &[(&str, DpValue)]) -> DpValues {
        pairs
            .iter()
            .map(|(k, v)| (DpId::from(*k), v.clone()))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn pending_overlays_confirmed_until_it_expires() {
        let store = DeviceStore::new(Duration::from_secs(5));
        store.ingest(&dps(&[("9", DpValue::Int(1))]), true, &BTreeSet::new());

        store.record_pending(&dps(&[("9", DpValue::Int(3))]));
        store.mark_sent(&dps(&[("9", DpValue::Int(3))]));
        assert_eq!(store.read(&DpId::from(9)), Some(DpValue::Int(3)));

        tokio::time::advance(Duration::from_millis(5100)).await;
        assert_eq!(store.read(&DpId::from(9)), Some(DpValue::Int(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn reconcile_needs_sent_and_matching_value() {
        let store = DeviceStore::new(Duration::from_secs(5));
        store.record_pending(&dps(&[("1", DpValue::Bool(true)), ("2", DpValue::Int(4))]));

        // Echo before the flush marked anything sent: keep both.
        store.reconcile(&dps(&[("1", DpValue::Bool(true))]));
        assert_eq!(store.pending().len(), 2);

        store.mark_sent(&dps(&[("1", DpValue::Bool(true)), ("2", DpValue::Int(4))]));
        store.reconcile(&dps(&[("1", DpValue::Bool(true)), ("2", DpValue::Int(3))]));
        let left: Vec<DpId> = store.pending().into_iter().map(|(id, _)| id).collect();
        assert_eq!(left, vec![DpId::from(2)]);
    }

    #[tokio::test(start_paused = true)]
    async fn overwritten_entries_stay_unsent() {
        let store = DeviceStore::new(Duration::from_secs(5));
        store.record_pending(&dps(&[("5", DpValue::Bool(true))]));
        let batch = store.unsent();
        store.record_pending(&dps(&[("5", DpValue::Bool(false))]));
        store.mark_sent(&batch);
        assert_eq!(store.unsent(), dps(&[("5", DpValue::Bool(false))]));
    }

    #[tokio::test(start_paused = true)]
    async fn full_poll_drops_unreported_non_persistent_ids() {
        let store = DeviceStore::new(Duration::from_secs(5));
        let persistent: BTreeSet<DpId> = [DpId::from(3)].into_iter().collect();
        store.ingest(
            &dps(&[
                ("1", DpValue::Bool(false)),
                ("2", DpValue::Int(7)),
                ("3", DpValue::from("eco")),
                ("4", DpValue::Int(1)),
            ]),
            true,
            &persistent,
        );
        store.record_pending(&dps(&[("4", DpValue::Int(2))]));

        // Partial frames never drop anything.
        store.ingest(&dps(&[("1", DpValue::Bool(true))]), false, &persistent);
        assert!(store.read(&DpId::from(2)).is_some());

        let outcome = store.ingest(&dps(&[("1", DpValue::Bool(true))]), true, &persistent);
        assert_eq!(store.read(&DpId::from(1)), Some(DpValue::Bool(true)));
        assert_eq!(store.read(&DpId::from(2)), None);
        assert_eq!(store.read(&DpId::from(3)), Some(DpValue::from("eco")));
        assert_eq!(store.snapshot().get(&DpId::from(4)), Some(&DpValue::Int(1)));
        assert_eq!(outcome.dropped, [DpId::from(2)].into_iter().collect());
        assert!(outcome.changed.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn full_poll_ignores_expired_pending_entries() {
        let store = DeviceStore::new(Duration::from_secs(5));
        store.ingest(
            &dps(&[("1", DpValue::Bool(false)), ("6", DpValue::Int(20))]),
            true,
            &BTreeSet::new(),
        );
        store.record_pending(&dps(&[("6", DpValue::Int(25))]));
        tokio::time::advance(Duration::from_millis(5100)).await;

        let outcome = store.ingest(&dps(&[("1", DpValue::Bool(false))]), true, &BTreeSet::new());
        assert_eq!(outcome.dropped, [DpId::from(6)].into_iter().collect());
        assert_eq!(store.snapshot().get(&DpId::from(6)), None);
    }

    #[tokio::test(start_paused = true)]
    async fn discarded_batch_leaves_newer_values() {
        let store = DeviceStore::new(Duration::from_secs(5));
        store.ingest(&dps(&[("1", DpValue::Bool(false))]), true, &BTreeSet::new());
        store.record_pending(&dps(&[("1", DpValue::Bool(true)), ("3", DpValue::Int(40))]));
        let batch = store.unsent();
        store.record_pending(&dps(&[("3", DpValue::Int(45))]));

        store.discard(&batch);
        assert_eq!(store.read(&DpId::from(1)), Some(DpValue::Bool(false)));
        assert_eq!(store.unsent(), dps(&[("3", DpValue::Int(45))]));
    }

    #[tokio::test(start_paused = true)]
    async fn staleness_follows_the_cache_window() {
        let store = DeviceStore::new(Duration::from_secs(5));
        assert!(store.is_stale(Duration::from_secs(30)));
        store.ingest(&dps(&[("1", DpValue::Bool(true))]), true, &BTreeSet::new());
        assert!(!store.is_stale(Duration::from_secs(30)));
        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(store.is_stale(Duration::from_secs(30)));

        store.reset();
        assert!(!store.has_state());
    }
}
