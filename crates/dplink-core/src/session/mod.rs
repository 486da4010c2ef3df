// ── Device session ──
//
// One `Session` per physical device. It owns the transport, negotiates the
// protocol version, keeps the confirmed cache plus the optimistic overlay,
// and runs two background tasks while anyone is interested in the device:
// the loop (polling, persistent receive, all cache mutation) and the write
// flusher (debounced, batched commands).

mod negotiator;
mod store;
mod worker;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use arc_swap::ArcSwap;
use dashmap::DashMap;
use dplink_api::{DpId, DpValue, DpValues, ProtocolVersion, TransportHandle};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::Stream;
use tokio_stream::StreamExt as _;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::error::CoreError;
use crate::host::HostLifecycle;
use crate::profile::{DeviceProfile, EntityDescriptor, ProfileCatalog, describe_values};

use negotiator::ProtocolNegotiator;
use store::DeviceStore;
use worker::{FlushRequest, LoopMessage};

pub use store::{ObservedState, PendingUpdate};

const EVENT_CHANNEL_SIZE: usize = 64;

// ── SessionState ─────────────────────────────────────────────────────

/// Lifecycle state observable by consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Stopped,
    /// Tasks spawned; waiting for the host or the first poll.
    Starting,
    /// Reconnecting for every exchange.
    Polling,
    /// Holding the connection open and receiving pushes.
    Persistent,
    Stopping,
}

impl SessionState {
    pub fn is_running(self) -> bool {
        matches!(self, Self::Starting | Self::Polling | Self::Persistent)
    }
}

// ── Events ───────────────────────────────────────────────────────────

/// Notifications broadcast to every consumer of a session.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The confirmed cache changed.
    Updated {
        state: Arc<ObservedState>,
        /// Ids whose value changed or that were dropped.
        changed: BTreeSet<DpId>,
        full_poll: bool,
    },
    /// A retry cycle was exhausted; the cache was reset.
    Unavailable { reason: String },
    /// Negotiation settled on a protocol version.
    ProtocolConfirmed { version: ProtocolVersion },
}

// ── Consumers ────────────────────────────────────────────────────────

pub type ConsumerId = Uuid;

/// What a consumer needs from a session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerInterest {
    /// Ids to poll explicitly when the cache goes stale.
    pub required: BTreeSet<DpId>,
    /// Ids whose cached value survives a full poll that omits them.
    pub persistent: BTreeSet<DpId>,
}

impl ConsumerInterest {
    pub fn new<I, T>(required: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<DpId>,
    {
        Self {
            required: required.into_iter().map(Into::into).collect(),
            persistent: BTreeSet::new(),
        }
    }

    pub fn with_persistent<I, T>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<DpId>,
    {
        self.persistent.extend(ids.into_iter().map(Into::into));
        self
    }

    /// Interest of one entity: its force-poll and persistent datapoints.
    pub fn from_entity(entity: &EntityDescriptor) -> Self {
        let mut interest = Self::default();
        for dp in &entity.datapoints {
            if dp.flags.force_poll {
                interest.required.insert(dp.id.clone());
            }
            if dp.flags.persistent {
                interest.persistent.insert(dp.id.clone());
            }
        }
        interest
    }

    /// Union of the interest of every entity in `profile`.
    pub fn from_profile(profile: &DeviceProfile) -> Self {
        profile
            .entities()
            .map(Self::from_entity)
            .fold(Self::default(), |mut acc, e| {
                acc.required.extend(e.required);
                acc.persistent.extend(e.persistent);
                acc
            })
    }
}

/// Returned by [`Session::register_consumer`]; pass its id back to
/// unregister.
#[derive(Debug)]
pub struct ConsumerHandle {
    id: ConsumerId,
    events: broadcast::Receiver<SessionEvent>,
}

impl ConsumerHandle {
    pub fn id(&self) -> ConsumerId {
        self.id
    }

    /// Next event, skipping over any the consumer was too slow to see.
    /// `None` once the session is gone.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        loop {
            match self.events.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "consumer lagged behind session events");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Convert into a `Stream` of events.
    pub fn into_stream(self) -> impl Stream<Item = SessionEvent> {
        BroadcastStream::new(self.events).filter_map(Result::ok)
    }
}

// ── PendingWrite ─────────────────────────────────────────────────────

/// Outcome of a write, resolved when its batch has been flushed.
///
/// Dropping it is fine: the write still goes out.
#[derive(Debug)]
pub struct PendingWrite {
    ids: Vec<DpId>,
    rx: oneshot::Receiver<Result<(), CoreError>>,
    device: String,
}

impl PendingWrite {
    pub fn ids(&self) -> &[DpId] {
        &self.ids
    }

    /// Wait for the flush. `WriteRejected` (or a connectivity error) after
    /// the retry budget; `SessionStopped` if the session stopped first.
    pub async fn outcome(self) -> Result<(), CoreError> {
        self.rx.await.unwrap_or(Err(CoreError::SessionStopped {
            device: self.device,
        }))
    }
}

/// Negotiation status, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolStatus {
    pub version: ProtocolVersion,
    pub confirmed: bool,
    pub pinned: bool,
    /// Consecutive exhausted retry cycles.
    pub failures: u32,
}

// ── Session ──────────────────────────────────────────────────────────

/// Handle to one device session.
///
/// Cheaply cloneable via `Arc<SessionInner>`. Background tasks run from the
/// first [`register_consumer`](Self::register_consumer) until the last
/// [`unregister_consumer`](Self::unregister_consumer) or [`stop`](Self::stop).
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

pub(crate) struct SessionInner {
    config: SessionConfig,
    transport: TransportHandle,
    store: DeviceStore,
    negotiator: Mutex<ProtocolNegotiator>,
    state: watch::Sender<SessionState>,
    event_tx: broadcast::Sender<SessionEvent>,
    consumers: DashMap<ConsumerId, ConsumerInterest>,
    force_ids: ArcSwap<BTreeSet<DpId>>,
    persistent_ids: ArcSwap<BTreeSet<DpId>>,
    /// Outstanding `pause()` calls.
    paused: AtomicU32,
    host: HostLifecycle,
    cancel: CancellationToken,
    run: tokio::sync::Mutex<Option<RunHandles>>,
    loop_tx: Mutex<Option<mpsc::UnboundedSender<LoopMessage>>>,
    flush_tx: Mutex<Option<mpsc::UnboundedSender<FlushRequest>>>,
    /// Held while a batch is taken, sent, and marked sent.
    send_lock: tokio::sync::Mutex<()>,
    last_flush: Mutex<Option<Instant>>,
}

struct RunHandles {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("device", &self.inner.config.device_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Create a session. Does not touch the device until the first
    /// consumer registers.
    pub fn new(config: SessionConfig, transport: TransportHandle, host: HostLifecycle) -> Self {
        let negotiator = ProtocolNegotiator::new(config.protocol, &config.tuning);
        let (state, _) = watch::channel(SessionState::Stopped);
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_SIZE);

        Self {
            inner: Arc::new(SessionInner {
                store: DeviceStore::new(config.tuning.fake_it_timeout),
                config,
                transport,
                negotiator: Mutex::new(negotiator),
                state,
                event_tx,
                consumers: DashMap::new(),
                force_ids: ArcSwap::from_pointee(BTreeSet::new()),
                persistent_ids: ArcSwap::from_pointee(BTreeSet::new()),
                paused: AtomicU32::new(0),
                host,
                cancel: CancellationToken::new(),
                run: tokio::sync::Mutex::new(None),
                loop_tx: Mutex::new(None),
                flush_tx: Mutex::new(None),
                send_lock: tokio::sync::Mutex::new(()),
                last_flush: Mutex::new(None),
            }),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.inner.config.device_id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// The device transport; sub-devices chain behind it.
    pub fn transport(&self) -> &TransportHandle {
        &self.inner.transport
    }

    // ── Observation ──────────────────────────────────────────────────

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    pub fn state_stream(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.event_tx.subscribe()
    }

    /// The confirmed cache, without the optimistic overlay.
    pub fn snapshot(&self) -> Arc<ObservedState> {
        self.inner.store.snapshot()
    }

    /// Follow the confirmed cache.
    pub fn observe(&self) -> watch::Receiver<Arc<ObservedState>> {
        self.inner.store.subscribe()
    }

    /// Optimistic writes not yet confirmed or expired.
    pub fn pending(&self) -> Vec<(DpId, PendingUpdate)> {
        self.inner.store.pending()
    }

    /// The pending value if a write is live, else the last confirmed
    /// value. Never blocks.
    pub fn read(&self, id: &DpId) -> Option<DpValue> {
        self.inner.store.read(id)
    }

    pub fn has_reported_state(&self) -> bool {
        self.inner.store.has_state()
    }

    pub fn protocol(&self) -> ProtocolStatus {
        let n = self.inner.negotiator();
        ProtocolStatus {
            version: n.current(),
            confirmed: n.is_confirmed(),
            pinned: n.is_pinned(),
            failures: n.failures(),
        }
    }

    pub fn consumer_count(&self) -> usize {
        self.inner.consumers.len()
    }

    // ── Consumers ────────────────────────────────────────────────────

    /// Register interest in the device, starting the session if this is
    /// the first consumer.
    pub async fn register_consumer(&self, interest: ConsumerInterest) -> ConsumerHandle {
        let id = Uuid::new_v4();
        debug!(
            device = %self.device_id(),
            consumer = %id,
            required = interest.required.len(),
            "registering consumer"
        );
        self.inner.consumers.insert(id, interest);
        self.inner.recompute_interest();
        let events = self.inner.event_tx.subscribe();
        self.start().await;
        ConsumerHandle { id, events }
    }

    /// Drop a consumer. The session stops when none remain. Returns `false`
    /// for an unknown id.
    pub async fn unregister_consumer(&self, id: ConsumerId) -> bool {
        if self.inner.consumers.remove(&id).is_none() {
            return false;
        }
        self.inner.recompute_interest();
        debug!(device = %self.device_id(), consumer = %id, "unregistered consumer");
        if self.inner.consumers.is_empty() {
            self.stop().await;
        }
        true
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Spawn the loop and flusher tasks. Idempotent.
    pub async fn start(&self) {
        let mut run = self.inner.run.lock().await;
        if run.is_some() {
            return;
        }

        let cancel = self.inner.cancel.child_token();
        let (loop_tx, loop_rx) = mpsc::unbounded_channel();
        let (flush_tx, flush_rx) = mpsc::unbounded_channel();
        *lock(&self.inner.loop_tx) = Some(loop_tx.clone());
        *lock(&self.inner.flush_tx) = Some(flush_tx);
        self.inner.state.send_replace(SessionState::Starting);
        info!(device = %self.inner.config.display_name(), "starting session");

        let tasks = vec![
            tokio::spawn(Arc::clone(&self.inner).run_loop(cancel.clone(), loop_rx)),
            tokio::spawn(Arc::clone(&self.inner).run_flusher(cancel.clone(), flush_rx, loop_tx)),
        ];
        *run = Some(RunHandles { cancel, tasks });
    }

    /// Cancel the background tasks, wait for them, and close the
    /// transport. Pending writes are discarded.
    pub async fn stop(&self) {
        let Some(run) = self.inner.run.lock().await.take() else {
            return;
        };
        self.inner.state.send_replace(SessionState::Stopping);
        info!(device = %self.inner.config.display_name(), "stopping session");

        *lock(&self.inner.flush_tx) = None;
        *lock(&self.inner.loop_tx) = None;
        run.cancel.cancel();
        for task in run.tasks {
            if let Err(e) = task.await {
                warn!(device = %self.device_id(), error = %e, "session task ended abnormally");
            }
        }

        if let Err(e) = self.inner.transport.close().await {
            debug!(device = %self.device_id(), error = %e, "closing transport failed");
        }
        self.inner.store.clear_pending();
        self.inner.state.send_replace(SessionState::Stopped);
    }

    // ── Writes ───────────────────────────────────────────────────────

    /// Set one datapoint. See [`write_many`](Self::write_many).
    pub fn write(
        &self,
        id: impl Into<DpId>,
        value: impl Into<DpValue>,
    ) -> Result<PendingWrite, CoreError> {
        let mut values = DpValues::new();
        values.insert(id.into(), value.into());
        self.write_many(values)
    }

    /// Record optimistic values and schedule a debounced flush.
    ///
    /// Returns immediately. `read` reflects the new values at once.
    pub fn write_many(&self, values: DpValues) -> Result<PendingWrite, CoreError> {
        let stopped = || CoreError::SessionStopped {
            device: self.device_id().to_owned(),
        };
        let tx = lock(&self.inner.flush_tx).clone().ok_or_else(stopped)?;

        self.inner.store.record_pending(&values);
        let (reply, rx) = oneshot::channel();
        tx.send(FlushRequest { reply }).map_err(|_| stopped())?;
        debug!(device = %self.device_id(), dps = ?values, "queued write");

        Ok(PendingWrite {
            ids: values.into_keys().collect(),
            rx,
            device: self.device_id().to_owned(),
        })
    }

    /// Put `value` into the confirmed cache without sending anything; the
    /// next frame from the device overwrites it.
    pub fn anticipate(&self, id: impl Into<DpId>, value: impl Into<DpValue>) {
        self.inner.store.anticipate(id.into(), value.into());
    }

    // ── Polling control ──────────────────────────────────────────────

    /// One full, retried poll.
    pub async fn force_refresh(&self) -> Result<(), CoreError> {
        let tx = lock(&self.inner.loop_tx).clone();
        if let Some(tx) = tx {
            let (reply, rx) = oneshot::channel();
            if tx.send(LoopMessage::Refresh(reply)).is_ok() {
                return rx.await.unwrap_or(Err(CoreError::SessionStopped {
                    device: self.device_id().to_owned(),
                }));
            }
        }
        self.inner.full_poll(&self.inner.cancel).await
    }

    /// Force polling mode until the matching [`resume`](Self::resume).
    pub fn pause(&self) {
        self.inner.paused.fetch_add(1, Ordering::SeqCst);
        self.inner.wake();
    }

    pub fn resume(&self) {
        let _ = self
            .inner
            .paused
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        self.inner.wake();
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst) > 0
    }

    // ── Detection ────────────────────────────────────────────────────

    /// Every profile compatible with what the device reports.
    pub async fn possible_profiles(
        &self,
        catalog: &ProfileCatalog,
    ) -> Result<Vec<Arc<DeviceProfile>>, CoreError> {
        self.ensure_probed().await?;
        Ok(catalog.find_strict_matches(&self.snapshot().dps))
    }

    /// The best profile for what the device reports.
    pub async fn infer_profile(
        &self,
        catalog: &ProfileCatalog,
    ) -> Result<Arc<DeviceProfile>, CoreError> {
        self.ensure_probed().await?;
        let snapshot = self.snapshot();
        catalog
            .best_match(&snapshot.dps)
            .ok_or_else(|| CoreError::NoMatch {
                observed: describe_values(&snapshot.dps),
            })
    }

    /// Devices that answer nothing to a plain status request need the
    /// probe set first.
    async fn ensure_probed(&self) -> Result<(), CoreError> {
        if self.has_reported_state() {
            return Ok(());
        }
        let probe = self.inner.config.tuning.probe_dps.clone();
        debug!(device = %self.device_id(), ?probe, "probing device");
        self.inner.transport.set_probe_dps(probe).await?;
        self.force_refresh().await
    }
}

impl SessionInner {
    fn negotiator(&self) -> MutexGuard<'_, ProtocolNegotiator> {
        lock(&self.negotiator)
    }

    fn recompute_interest(&self) {
        let mut required = BTreeSet::new();
        let mut persistent = BTreeSet::new();
        for entry in &self.consumers {
            required.extend(entry.required.iter().cloned());
            persistent.extend(entry.persistent.iter().cloned());
        }
        self.force_ids.store(Arc::new(required));
        self.persistent_ids.store(Arc::new(persistent));
    }

    fn wake(&self) {
        if let Some(tx) = lock(&self.loop_tx).as_ref() {
            let _ = tx.send(LoopMessage::Wake);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::parse_profile;

    #[test]
    fn interest_from_profile_unions_entities() {
        let profile = parse_profile(
            "fan_heater",
            "
name: Fan heater
primary_entity:
  entity: climate
  dps:
    - {id: 1, name: hvac_mode, type: boolean, force: true}
    - {id: 5, name: current_temperature, type: integer, persist: false}
secondary_entities:
  - entity: lock
    dps:
      - {id: 7, name: lock, type: boolean, force: true, persist: false}
",
        )
        .unwrap_or_else(|e| panic!("{e}"));

        let interest = ConsumerInterest::from_profile(&profile);
        assert_eq!(
            interest.required,
            [DpId::from(1), DpId::from(7)].into_iter().collect()
        );
        assert_eq!(interest.persistent, [DpId::from(1)].into_iter().collect());
    }

    #[test]
    fn running_states() {
        assert!(SessionState::Persistent.is_running());
        assert!(!SessionState::Stopping.is_running());
    }
}
