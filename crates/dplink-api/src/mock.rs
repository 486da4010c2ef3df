// ── Scripted in-memory transport ──
//
// A fake device for tests. The `MockDevice` handle stays with the test and
// scripts behaviour; `ScriptedTransport` is what the session drives. Every
// call is recorded so tests can assert on the exact exchange sequence.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::error::Error;
use crate::frame::Frame;
use crate::transport::{DeviceTransport, SharedTransport, TransportConfig, TransportFactory};
use crate::value::{DpId, DpValue, DpValues};
use crate::version::ProtocolVersion;

/// One recorded transport call.
#[derive(Debug, Clone, PartialEq)]
pub enum MockCall {
    SetVersion(ProtocolVersion),
    SetPersistent(bool),
    Status,
    UpdateDps(Vec<DpId>),
    Heartbeat,
    Receive(Duration),
    SetValues(DpValues),
    SetProbeDps(Vec<DpId>),
    Close,
}

#[derive(Debug, Default)]
struct DeviceState {
    dps: DpValues,
    version: Option<ProtocolVersion>,
    accept_only: Option<ProtocolVersion>,
    offline: bool,
    fail_next: usize,
    reject_writes: bool,
    ignore_writes: bool,
    pushes: VecDeque<Frame>,
    receive_delay: Duration,
    calls: Vec<MockCall>,
    closed: bool,
}

impl DeviceState {
    /// Shared failure checks run before every exchange.
    fn exchange(&mut self) -> Result<Option<Frame>, Error> {
        if self.offline {
            return Err(Error::Connectivity {
                address: "mock".into(),
                reason: "device offline".into(),
            });
        }
        if self.fail_next > 0 {
            self.fail_next -= 1;
            return Err(Error::Connectivity {
                address: "mock".into(),
                reason: "scripted failure".into(),
            });
        }
        if let Some(expected) = self.accept_only {
            if self.version != Some(expected) {
                return Ok(Some(Frame::Error {
                    code: Some("904".into()),
                    message: "Unexpected Payload from Device".into(),
                    payload: None,
                }));
            }
        }
        Ok(None)
    }
}

/// Test-side handle to a fake device.
#[derive(Debug, Clone, Default)]
pub struct MockDevice {
    state: Arc<Mutex<DeviceState>>,
}

impl MockDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// A device that currently reports `dps`.
    pub fn with_dps<I, K, V>(dps: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<DpId>,
        V: Into<DpValue>,
    {
        let device = Self::new();
        device.state().dps = dps
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        device
    }

    fn state(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_dp(&self, id: impl Into<DpId>, value: impl Into<DpValue>) {
        self.state().dps.insert(id.into(), value.into());
    }

    pub fn remove_dp(&self, id: impl Into<DpId>) {
        self.state().dps.remove(&id.into());
    }

    pub fn dps(&self) -> DpValues {
        self.state().dps.clone()
    }

    /// Every exchange fails with a connectivity error while set.
    pub fn set_offline(&self, offline: bool) {
        self.state().offline = offline;
    }

    /// The next `n` exchanges fail with a connectivity error.
    pub fn fail_next(&self, n: usize) {
        self.state().fail_next = n;
    }

    /// Only `version` decodes; every other version gets a 904 error frame.
    pub fn accept_only(&self, version: ProtocolVersion) {
        self.state().accept_only = Some(version);
    }

    /// Writes answer with a 903 error frame.
    pub fn reject_writes(&self, reject: bool) {
        self.state().reject_writes = reject;
    }

    /// Writes are acknowledged but not applied, so no echo arrives.
    pub fn ignore_writes(&self, ignore: bool) {
        self.state().ignore_writes = ignore;
    }

    /// A quiet line: `receive` blocks for this long (capped by the caller's
    /// wait) before reporting nothing.
    pub fn set_receive_delay(&self, delay: Duration) {
        self.state().receive_delay = delay;
    }

    /// Queue an unsolicited frame for the next `receive`.
    pub fn push(&self, frame: Frame) {
        self.state().pushes.push_back(frame);
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.state().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    /// Batches sent through `set_values`, in order.
    pub fn writes(&self) -> Vec<DpValues> {
        self.state()
            .calls
            .iter()
            .filter_map(|c| match c {
                MockCall::SetValues(v) => Some(v.clone()),
                _ => None,
            })
            .collect()
    }

    /// Versions applied through `set_version`, in order.
    pub fn versions_tried(&self) -> Vec<ProtocolVersion> {
        self.state()
            .calls
            .iter()
            .filter_map(|c| match c {
                MockCall::SetVersion(v) => Some(*v),
                _ => None,
            })
            .collect()
    }

    pub fn current_version(&self) -> Option<ProtocolVersion> {
        self.state().version
    }

    /// Whether `close` was ever called. Later calls reconnect.
    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    pub fn transport(&self) -> ScriptedTransport {
        ScriptedTransport {
            device: self.clone(),
        }
    }
}

/// The transport side of a [`MockDevice`].
#[derive(Debug)]
pub struct ScriptedTransport {
    device: MockDevice,
}

impl ScriptedTransport {
    fn record(&self, call: MockCall) -> MutexGuard<'_, DeviceState> {
        let mut state = self.device.state();
        if call == MockCall::Close {
            state.closed = true;
        }
        state.calls.push(call);
        state
    }
}

impl DeviceTransport for ScriptedTransport {
    fn set_version(&mut self, version: ProtocolVersion) -> Result<(), Error> {
        self.record(MockCall::SetVersion(version)).version = Some(version);
        Ok(())
    }

    fn set_persistent(&mut self, persistent: bool) -> Result<(), Error> {
        self.record(MockCall::SetPersistent(persistent));
        Ok(())
    }

    fn status(&mut self) -> Result<Frame, Error> {
        let mut state = self.record(MockCall::Status);
        if let Some(frame) = state.exchange()? {
            return Ok(frame);
        }
        Ok(Frame::Dps(state.dps.clone()))
    }

    fn update_dps(&mut self, dps: &[DpId]) -> Result<Frame, Error> {
        let mut state = self.record(MockCall::UpdateDps(dps.to_vec()));
        if let Some(frame) = state.exchange()? {
            return Ok(frame);
        }
        let subset = dps
            .iter()
            .filter_map(|id| state.dps.get(id).map(|v| (id.clone(), v.clone())))
            .collect();
        Ok(Frame::Dps(subset))
    }

    fn heartbeat(&mut self) -> Result<Frame, Error> {
        let mut state = self.record(MockCall::Heartbeat);
        Ok(state.exchange()?.unwrap_or(Frame::Empty))
    }

    fn receive(&mut self, wait: Duration) -> Result<Frame, Error> {
        let mut state = self.record(MockCall::Receive(wait));
        if state.offline {
            return state.exchange().map(|_| Frame::Empty);
        }
        if let Some(frame) = state.pushes.pop_front() {
            return Ok(frame);
        }
        let delay = state.receive_delay.min(wait);
        drop(state);
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        Ok(self.device.state().pushes.pop_front().unwrap_or(Frame::Empty))
    }

    fn set_values(&mut self, values: &DpValues) -> Result<Frame, Error> {
        let mut state = self.record(MockCall::SetValues(values.clone()));
        if let Some(frame) = state.exchange()? {
            return Ok(frame);
        }
        if state.reject_writes {
            return Ok(Frame::Error {
                code: Some("903".into()),
                message: "Device rejected command".into(),
                payload: None,
            });
        }
        if state.ignore_writes {
            return Ok(Frame::Empty);
        }
        for (id, value) in values {
            state.dps.insert(id.clone(), value.clone());
        }
        Ok(Frame::Dps(values.clone()))
    }

    fn set_probe_dps(&mut self, dps: &[DpId]) {
        self.record(MockCall::SetProbeDps(dps.to_vec()));
    }

    fn close(&mut self) {
        self.record(MockCall::Close);
    }
}

// ── Factory ─────────────────────────────────────────────────────────

/// Hands out [`ScriptedTransport`]s for registered mock devices.
///
/// Sub-devices are looked up by `sub_device_id`, everything else by
/// `device_id`.
#[derive(Debug, Default)]
pub struct MockFactory {
    devices: Mutex<HashMap<String, MockDevice>>,
    opened: Mutex<Vec<String>>,
}

impl MockFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: impl Into<String>, device: MockDevice) {
        self.devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), device);
    }

    /// Keys opened so far, in order; children are prefixed with `child:`.
    pub fn opened(&self) -> Vec<String> {
        self.opened
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn lookup(&self, key: &str) -> Result<MockDevice, Error> {
        self.devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
            .ok_or_else(|| Error::Connectivity {
                address: key.to_owned(),
                reason: "no such mock device".into(),
            })
    }
}

impl TransportFactory for MockFactory {
    fn open(&self, config: &TransportConfig) -> Result<Box<dyn DeviceTransport>, Error> {
        let device = self.lookup(&config.device_id)?;
        self.opened
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(config.device_id.clone());
        Ok(Box::new(device.transport()))
    }

    fn open_child(
        &self,
        config: &TransportConfig,
        _parent: &SharedTransport,
    ) -> Result<Box<dyn DeviceTransport>, Error> {
        let key = config
            .sub_device_id
            .as_deref()
            .unwrap_or(&config.device_id);
        let device = self.lookup(key)?;
        self.opened
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(format!("child:{key}"));
        Ok(Box::new(device.transport()))
    }
}
