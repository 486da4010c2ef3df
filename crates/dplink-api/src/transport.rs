// ── Transport boundary ──
//
// The wire codec is synchronous and owns a socket; sessions are async.
// `TransportHandle` bridges the two by running every call on the tokio
// blocking pool behind a shared mutex, so one device never has two
// exchanges in flight.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use secrecy::SecretString;
use tracing::trace;

use crate::error::Error;
use crate::frame::Frame;
use crate::value::{DpId, DpValues};
use crate::version::ProtocolVersion;

/// A blocking connection to one device (or one sub-device behind a gateway).
///
/// Implementations own framing, encryption, and per-call timeouts. Replies
/// that carry an error payload are returned as [`Frame::Error`] rather than
/// `Err`; `Err` is reserved for failures of the exchange itself.
pub trait DeviceTransport: Send {
    /// Switch the protocol revision used for subsequent exchanges.
    fn set_version(&mut self, version: ProtocolVersion) -> Result<(), Error>;

    /// Keep the socket open between calls (`true`) or reconnect per call.
    fn set_persistent(&mut self, persistent: bool) -> Result<(), Error>;

    /// Request a full status report.
    fn status(&mut self) -> Result<Frame, Error>;

    /// Ask the device to refresh (and report) the given datapoints.
    fn update_dps(&mut self, dps: &[DpId]) -> Result<Frame, Error>;

    /// Keep-alive on a persistent connection.
    fn heartbeat(&mut self) -> Result<Frame, Error>;

    /// Wait up to `wait` (never longer than the transport timeout) for an
    /// unsolicited push. [`Frame::Empty`] when nothing arrived in time.
    fn receive(&mut self, wait: Duration) -> Result<Frame, Error>;

    /// Send a batch of datapoint values in one command.
    fn set_values(&mut self, values: &DpValues) -> Result<Frame, Error>;

    /// Datapoints to include when querying a device that reports nothing
    /// to a plain status request.
    fn set_probe_dps(&mut self, dps: &[DpId]);

    /// Drop the connection. Idempotent.
    fn close(&mut self);
}

/// A transport shared between a gateway session and its sub-devices.
pub type SharedTransport = Arc<Mutex<Box<dyn DeviceTransport>>>;

// ── TransportConfig ─────────────────────────────────────────────────

/// Connection parameters handed to a [`TransportFactory`].
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub device_id: String,
    pub address: String,
    pub port: u16,
    pub local_key: SecretString,
    /// Per-exchange timeout enforced by the transport.
    pub timeout: Duration,
    /// Node id when the device is reached through a gateway.
    pub sub_device_id: Option<String>,
}

impl TransportConfig {
    pub const DEFAULT_PORT: u16 = 6668;

    pub fn new(
        device_id: impl Into<String>,
        address: impl Into<String>,
        local_key: SecretString,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            address: address.into(),
            port: Self::DEFAULT_PORT,
            local_key,
            timeout: Duration::from_secs(5),
            sub_device_id: None,
        }
    }
}

/// Opens transports. The concrete codec crate implements this.
pub trait TransportFactory: Send + Sync {
    fn open(&self, config: &TransportConfig) -> Result<Box<dyn DeviceTransport>, Error>;

    /// Open a sub-device whose traffic is routed through `parent`.
    fn open_child(
        &self,
        config: &TransportConfig,
        parent: &SharedTransport,
    ) -> Result<Box<dyn DeviceTransport>, Error>;
}

// ── TransportHandle ─────────────────────────────────────────────────

/// Async handle over a blocking transport.
///
/// Cheaply cloneable. For sub-devices the gateway's handle is kept as
/// `parent` so that persistence and version changes reach both sockets.
#[derive(Clone)]
pub struct TransportHandle {
    device: SharedTransport,
    parent: Option<SharedTransport>,
}

impl fmt::Debug for TransportHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportHandle")
            .field("has_parent", &self.parent.is_some())
            .finish_non_exhaustive()
    }
}

impl TransportHandle {
    pub fn new(device: Box<dyn DeviceTransport>) -> Self {
        Self {
            device: Arc::new(Mutex::new(device)),
            parent: None,
        }
    }

    /// Open a handle through `factory`, chaining behind `parent` when given.
    pub fn open(
        factory: &dyn TransportFactory,
        config: &TransportConfig,
        parent: Option<&Self>,
    ) -> Result<Self, Error> {
        match parent {
            Some(parent) => {
                let device = factory.open_child(config, &parent.device)?;
                Ok(Self {
                    device: Arc::new(Mutex::new(device)),
                    parent: Some(Arc::clone(&parent.device)),
                })
            }
            None => factory.open(config).map(Self::new),
        }
    }

    /// The underlying shared transport, for opening children.
    pub fn shared(&self) -> &SharedTransport {
        &self.device
    }

    pub fn has_parent(&self) -> bool {
        self.parent.is_some()
    }

    /// Run `f` against the device transport on the blocking pool.
    pub async fn call<T, F>(&self, f: F) -> Result<T, Error>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn DeviceTransport) -> Result<T, Error> + Send + 'static,
    {
        run_blocking(Arc::clone(&self.device), f).await
    }

    pub async fn status(&self) -> Result<Frame, Error> {
        self.call(|t| t.status()).await
    }

    pub async fn update_dps(&self, dps: Vec<DpId>) -> Result<Frame, Error> {
        self.call(move |t| t.update_dps(&dps)).await
    }

    pub async fn heartbeat(&self) -> Result<Frame, Error> {
        self.call(|t| t.heartbeat()).await
    }

    /// Listen for a push. The device lock is held for at most `wait`, so
    /// keep it short when writes may be queued behind it.
    pub async fn receive(&self, wait: Duration) -> Result<Frame, Error> {
        self.call(move |t| t.receive(wait)).await
    }

    pub async fn set_values(&self, values: DpValues) -> Result<Frame, Error> {
        self.call(move |t| t.set_values(&values)).await
    }

    pub async fn set_probe_dps(&self, dps: Vec<DpId>) -> Result<(), Error> {
        self.call(move |t| {
            t.set_probe_dps(&dps);
            Ok(())
        })
        .await
    }

    /// Apply a protocol version to the parent (if any) and the device.
    pub async fn set_version(&self, version: ProtocolVersion) -> Result<(), Error> {
        trace!(%version, "setting transport version");
        if let Some(parent) = &self.parent {
            run_blocking(Arc::clone(parent), move |t| t.set_version(version)).await?;
        }
        self.call(move |t| t.set_version(version)).await
    }

    /// Apply persistence to the parent (if any) and the device.
    pub async fn set_persistent(&self, persistent: bool) -> Result<(), Error> {
        trace!(persistent, "setting transport persistence");
        if let Some(parent) = &self.parent {
            run_blocking(Arc::clone(parent), move |t| t.set_persistent(persistent)).await?;
        }
        self.call(move |t| t.set_persistent(persistent)).await
    }

    /// Close the device transport. A parent belongs to its own session
    /// and stays open.
    pub async fn close(&self) -> Result<(), Error> {
        self.call(|t| {
            t.close();
            Ok(())
        })
        .await
    }
}

async fn run_blocking<T, F>(transport: SharedTransport, f: F) -> Result<T, Error>
where
    T: Send + 'static,
    F: FnOnce(&mut dyn DeviceTransport) -> Result<T, Error> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let mut guard = transport
            .lock()
            .map_err(|_| Error::Worker("transport lock poisoned".into()))?;
        f(&mut **guard)
    })
    .await
    .map_err(|e| Error::Worker(e.to_string()))?
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::mock::{MockCall, MockDevice, MockFactory};
    use crate::value::DpValue;
    use secrecy::SecretString;

    fn config(id: &str) -> TransportConfig {
        TransportConfig::new(id, "192.0.2.10", SecretString::from("0123456789abcdef".to_owned()))
    }

    #[tokio::test]
    async fn calls_run_on_the_blocking_pool() {
        let device = MockDevice::with_dps([("1", DpValue::Bool(true))]);
        let handle = TransportHandle::new(Box::new(device.transport()));

        let frame = handle.status().await.unwrap();
        assert_eq!(frame.dps().unwrap().len(), 1);
        assert_eq!(device.calls(), vec![MockCall::Status]);
    }

    #[tokio::test]
    async fn receive_waits_no_longer_than_asked() {
        let device = MockDevice::new();
        device.set_receive_delay(Duration::from_secs(30));
        let handle = TransportHandle::new(Box::new(device.transport()));

        let started = std::time::Instant::now();
        let frame = handle.receive(Duration::from_millis(20)).await.unwrap();
        assert!(matches!(frame, Frame::Empty));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(device.calls(), vec![MockCall::Receive(Duration::from_millis(20))]);
    }

    #[tokio::test]
    async fn persistence_and_version_reach_the_parent() {
        let factory = MockFactory::new();
        let gateway = MockDevice::new();
        let child = MockDevice::new();
        factory.insert("gw", gateway.clone());
        factory.insert("node-7", child.clone());

        let parent = TransportHandle::open(&factory, &config("gw"), None).unwrap();
        let mut sub = config("gw");
        sub.sub_device_id = Some("node-7".into());
        let handle = TransportHandle::open(&factory, &sub, Some(&parent)).unwrap();
        assert!(handle.has_parent());

        handle.set_persistent(true).await.unwrap();
        handle.set_version(ProtocolVersion::V3_4).await.unwrap();
        handle.close().await.unwrap();

        assert_eq!(
            gateway.calls(),
            vec![
                MockCall::SetPersistent(true),
                MockCall::SetVersion(ProtocolVersion::V3_4)
            ]
        );
        assert!(child.is_closed());
        assert!(!gateway.is_closed());
        assert_eq!(factory.opened(), vec!["gw".to_owned(), "child:node-7".to_owned()]);
    }

    #[tokio::test]
    async fn unknown_device_fails_to_open() {
        let factory = MockFactory::new();
        let err = TransportHandle::open(&factory, &config("nope"), None).unwrap_err();
        assert!(err.is_connectivity());
    }
}
