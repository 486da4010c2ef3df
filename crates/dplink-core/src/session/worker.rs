// ── Session background tasks ──
//
// The loop task is the only writer of the confirmed cache. It chooses the
// connection mode, polls or receives, and applies frames the flusher
// forwards to it. The flusher debounces writes, sends one batch per window,
// and reports the outcome back through `LoopMessage`.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use dplink_api::{DpId, DpValues, Frame};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::{SessionEvent, SessionInner, SessionState, lock};
use crate::error::CoreError;
use crate::host::HostPhase;

/// Work routed to the loop task.
#[derive(Debug)]
pub(crate) enum LoopMessage {
    /// Full poll requested by `force_refresh`.
    Refresh(oneshot::Sender<Result<(), CoreError>>),
    /// A frame the flusher received in reply to a write.
    Frame(DpValues),
    /// The flusher ran out of attempts.
    Exhausted(CoreError),
    /// Re-evaluate the connection mode now.
    Wake,
}

/// One caller waiting on the next flush.
#[derive(Debug)]
pub(crate) struct FlushRequest {
    pub(crate) reply: oneshot::Sender<Result<(), CoreError>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Polling,
    Persistent,
}

impl SessionInner {
    // ── Loop task ────────────────────────────────────────────────────

    pub(super) async fn run_loop(
        self: Arc<Self>,
        cancel: CancellationToken,
        mut rx: mpsc::UnboundedReceiver<LoopMessage>,
    ) {
        let device = self.config.device_id.clone();

        tokio::select! {
            () = cancel.cancelled() => return,
            running = self.host.wait_until_running() => {
                if !running {
                    info!(device = %device, "host is stopping, session loop not started");
                    return;
                }
            }
        }
        debug!(device = %device, "session loop running");

        let mut host_rx = self.host.subscribe();
        let mut mode: Option<Mode> = None;
        let mut incremental_next = true;
        let mut last_heartbeat = Instant::now();

        'run: loop {
            if cancel.is_cancelled() {
                break;
            }

            let wanted = if self.should_persist() {
                Mode::Persistent
            } else {
                Mode::Polling
            };
            if mode != Some(wanted) {
                self.switch_mode(wanted).await;
                mode = Some(wanted);
                last_heartbeat = Instant::now();
            }

            let idle = match wanted {
                Mode::Polling => self.polling_step(&cancel, &mut incremental_next).await,
                Mode::Persistent => self.persistent_step(&mut last_heartbeat).await,
            };
            self.store.expire_pending();

            let sleep = tokio::time::sleep(idle);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break 'run,
                    () = &mut sleep => break,
                    changed = host_rx.changed() => {
                        if changed.is_err() || *host_rx.borrow() == HostPhase::Stopping {
                            info!(device = %device, "host stopping, leaving session loop");
                            break 'run;
                        }
                    }
                    msg = rx.recv() => match msg {
                        None => break 'run,
                        Some(LoopMessage::Wake) => break,
                        Some(msg) => self.handle_message(msg, &cancel).await,
                    },
                }
            }
        }

        debug!(device = %device, "session loop finished");
    }

    fn should_persist(&self) -> bool {
        !self.config.poll_only
            && self.paused.load(Ordering::SeqCst) == 0
            && self.store.has_state()
            && self.negotiator().is_confirmed()
            && !self.store.is_stale(self.config.tuning.cache_timeout)
    }

    async fn switch_mode(&self, mode: Mode) {
        let persistent = mode == Mode::Persistent;
        debug!(device = %self.config.device_id, ?mode, "switching connection mode");
        if let Err(e) = self.transport.set_persistent(persistent).await {
            warn!(device = %self.config.device_id, error = %e, "changing connection persistence failed");
        }
        self.state.send_replace(if persistent {
            SessionState::Persistent
        } else {
            SessionState::Polling
        });
    }

    /// Poll if the cache is stale. Returns how long to idle afterwards.
    async fn polling_step(
        &self,
        cancel: &CancellationToken,
        incremental_next: &mut bool,
    ) -> Duration {
        let tuning = &self.config.tuning;
        if self.store.is_stale(tuning.cache_timeout) {
            let force = self.force_ids.load_full();
            let incremental = *incremental_next
                && !force.is_empty()
                && self.store.has_state()
                && self.negotiator().is_confirmed();
            *incremental_next = !incremental;

            let result = if incremental {
                self.incremental_poll(cancel, force.iter().cloned().collect()).await
            } else {
                self.full_poll(cancel).await
            };
            if result.is_err() {
                return tuning.error_backoff;
            }
        }
        self.idle_duration()
    }

    /// Receive one pushed frame, heartbeating when the line is quiet. Each
    /// listen is capped at `receive_window` so queued writes get the device.
    async fn persistent_step(&self, last_heartbeat: &mut Instant) -> Duration {
        let tuning = &self.config.tuning;
        let received = self.transport.receive(tuning.receive_window).await;
        match received.and_then(Frame::into_result) {
            Ok(frame @ Frame::Dps(_)) => {
                trace!(device = %self.config.device_id, ?frame, "received push");
                self.accept(frame, false);
            }
            Ok(_) => {
                if last_heartbeat.elapsed() >= tuning.heartbeat_interval {
                    *last_heartbeat = Instant::now();
                    if let Err(e) = self.transport.heartbeat().await {
                        debug!(device = %self.config.device_id, error = %e, "heartbeat failed");
                        self.store.invalidate();
                    }
                }
            }
            Err(e) => {
                debug!(device = %self.config.device_id, error = %e, "receive failed, forcing a full poll");
                self.store.invalidate();
            }
        }
        self.idle_duration()
    }

    fn idle_duration(&self) -> Duration {
        if self.store.has_state() {
            self.config.tuning.idle_with_state
        } else {
            self.config.tuning.idle_without_state
        }
    }

    async fn handle_message(&self, msg: LoopMessage, cancel: &CancellationToken) {
        match msg {
            LoopMessage::Refresh(reply) => {
                let result = self.full_poll(cancel).await;
                let _ = reply.send(result);
            }
            LoopMessage::Frame(dps) => self.accept(Frame::Dps(dps), false),
            LoopMessage::Exhausted(err) => self.mark_unavailable(&err),
            LoopMessage::Wake => {}
        }
    }

    /// One full status poll, retried. Exhaustion resets the cache.
    pub(super) async fn full_poll(&self, cancel: &CancellationToken) -> Result<(), CoreError> {
        match self
            .with_retry("status", cancel, move || self.transport.status())
            .await
        {
            Ok(frame) => {
                self.accept(frame, true);
                Ok(())
            }
            Err(err) => {
                self.mark_unavailable(&err);
                Err(err)
            }
        }
    }

    /// Ask only for the force-poll ids.
    async fn incremental_poll(
        &self,
        cancel: &CancellationToken,
        ids: Vec<DpId>,
    ) -> Result<(), CoreError> {
        trace!(device = %self.config.device_id, dps = ?ids, "incremental refresh");
        match self
            .with_retry("update_dps", cancel, move || {
                self.transport.update_dps(ids.clone())
            })
            .await
        {
            Ok(frame) => {
                self.accept(frame, false);
                Ok(())
            }
            Err(err) => {
                self.mark_unavailable(&err);
                Err(err)
            }
        }
    }

    /// Merge a frame into the confirmed cache and tell consumers.
    fn accept(&self, frame: Frame, full_poll: bool) {
        let Frame::Dps(dps) = frame else {
            return;
        };
        let persistent = self.persistent_ids.load();
        let outcome = self.store.ingest(&dps, full_poll, &persistent);
        if outcome.changed.is_empty() && outcome.dropped.is_empty() {
            return;
        }

        let mut changed = outcome.changed;
        changed.extend(outcome.dropped);
        let _ = self.event_tx.send(SessionEvent::Updated {
            state: self.store.snapshot(),
            changed,
            full_poll,
        });
    }

    /// A retry cycle failed for connectivity or protocol reasons: drop back
    /// to the empty baseline and tell consumers.
    fn mark_unavailable(&self, err: &CoreError) {
        if matches!(
            err,
            CoreError::WriteRejected { .. } | CoreError::SessionStopped { .. }
        ) {
            return;
        }
        warn!(device = %self.config.device_id, error = %err, "device unavailable");
        self.store.reset();
        let _ = self.event_tx.send(SessionEvent::Unavailable {
            reason: err.to_string(),
        });
    }

    // ── Retry ────────────────────────────────────────────────────────

    /// Run `op` until it succeeds or the attempt budget is spent, applying
    /// the negotiated protocol version before each attempt.
    ///
    /// An attempt already in flight runs to completion; once `cancel` fires
    /// no further attempt starts and the cycle ends with `SessionStopped`
    /// without counting against the negotiator.
    pub(super) async fn with_retry<F, Fut>(
        &self,
        what: &str,
        cancel: &CancellationToken,
        op: F,
    ) -> Result<Frame, CoreError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<Frame, dplink_api::Error>>,
    {
        let device = self.config.device_id.as_str();
        let budget = self.negotiator().attempt_budget();
        let mut last_err = None;

        for attempt in 1..=budget {
            if cancel.is_cancelled() {
                debug!(device, attempt, "{what} abandoned, session stopping");
                return Err(self.stopped());
            }

            let pending = self.negotiator().pending_version();
            if let Some(version) = pending {
                match self.transport.set_version(version).await {
                    Ok(()) => self.negotiator().mark_applied(version),
                    Err(e) => warn!(device, %version, error = %e, "applying protocol version failed"),
                }
            }

            let version = self.negotiator().current();
            match op().await.and_then(Frame::into_result) {
                Ok(frame) => {
                    if self.negotiator().record_success() {
                        let _ = self
                            .event_tx
                            .send(SessionEvent::ProtocolConfirmed { version });
                    }
                    return Ok(frame);
                }
                Err(e) => {
                    let err = CoreError::from(e).for_device(device, Some(version.as_str()));
                    debug!(device, %version, attempt, budget, error = %err, "{what} failed");
                    if !matches!(err, CoreError::WriteRejected { .. }) {
                        self.negotiator().record_failed_attempt();
                    }
                    last_err = Some(err);
                }
            }

            let delay = self.config.tuning.retry_delay;
            if attempt < budget && !delay.is_zero() {
                tokio::select! {
                    () = cancel.cancelled() => {
                        debug!(device, attempt, "{what} abandoned, session stopping");
                        return Err(self.stopped());
                    }
                    () = tokio::time::sleep(delay) => {}
                }
            }
        }

        let err = last_err.unwrap_or_else(|| CoreError::Internal(format!("{what}: no attempts")));
        if !matches!(err, CoreError::WriteRejected { .. }) {
            self.negotiator().record_exhausted();
        }
        warn!(device, budget, error = %err, "{what} gave up");
        Err(err)
    }

    fn stopped(&self) -> CoreError {
        CoreError::SessionStopped {
            device: self.config.device_id.clone(),
        }
    }

    // ── Write flusher ────────────────────────────────────────────────

    pub(super) async fn run_flusher(
        self: Arc<Self>,
        cancel: CancellationToken,
        mut rx: mpsc::UnboundedReceiver<FlushRequest>,
        loop_tx: mpsc::UnboundedSender<LoopMessage>,
    ) {
        loop {
            let first = tokio::select! {
                () = cancel.cancelled() => break,
                req = rx.recv() => match req {
                    Some(req) => req,
                    None => break,
                },
            };

            let window = self.coalesce_window();
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(window) => {}
            }

            let mut waiters = vec![first];
            while let Ok(req) = rx.try_recv() {
                waiters.push(req);
            }

            let result = self.flush(&loop_tx, &cancel).await;
            for waiter in waiters {
                let _ = waiter.reply.send(result.clone());
            }
        }
        debug!(device = %self.config.device_id, "write flusher finished");
    }

    fn coalesce_window(&self) -> Duration {
        let tuning = &self.config.tuning;
        let busy = lock(&self.last_flush).is_some_and(|at| at.elapsed() < tuning.busy_threshold);
        if busy {
            tuning.busy_coalesce_window
        } else {
            tuning.coalesce_window
        }
    }

    /// Send everything unsent as one batch. A batch that fails is dropped
    /// from the overlay; only its own callers see the error.
    async fn flush(
        &self,
        loop_tx: &mpsc::UnboundedSender<LoopMessage>,
        cancel: &CancellationToken,
    ) -> Result<(), CoreError> {
        let _guard = self.send_lock.lock().await;
        let batch = self.store.unsent();
        if batch.is_empty() {
            return Ok(());
        }

        debug!(device = %self.config.device_id, dps = ?batch, "sending write batch");
        let values = batch.clone();
        let result = self
            .with_retry("write", cancel, move || {
                self.transport.set_values(values.clone())
            })
            .await;
        *lock(&self.last_flush) = Some(Instant::now());

        match result {
            Ok(frame) => {
                self.store.mark_sent(&batch);
                if let Frame::Dps(dps) = frame {
                    if !dps.is_empty() {
                        let _ = loop_tx.send(LoopMessage::Frame(dps));
                    }
                }
                Ok(())
            }
            Err(err) => {
                self.store.discard(&batch);
                if !matches!(err, CoreError::SessionStopped { .. }) {
                    let _ = loop_tx.send(LoopMessage::Exhausted(err.clone()));
                }
                Err(err)
            }
        }
    }
}
