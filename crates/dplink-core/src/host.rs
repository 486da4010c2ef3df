// ── Host application lifecycle ──
//
// Sessions must not start talking to devices while the embedding
// application is still initializing, and must stop when it shuts down.
// The host publishes its phase here; sessions wait on it.

use std::sync::Arc;

use tokio::sync::watch;

/// Phase of the embedding application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HostPhase {
    #[default]
    Starting,
    Running,
    Stopping,
}

/// Shared, observable host phase. Cheaply cloneable.
#[derive(Debug, Clone)]
pub struct HostLifecycle {
    tx: Arc<watch::Sender<HostPhase>>,
}

impl Default for HostLifecycle {
    fn default() -> Self {
        Self::new(HostPhase::Starting)
    }
}

impl HostLifecycle {
    pub fn new(phase: HostPhase) -> Self {
        let (tx, _) = watch::channel(phase);
        Self { tx: Arc::new(tx) }
    }

    /// A host that has already finished starting (CLIs, tests).
    pub fn running() -> Self {
        Self::new(HostPhase::Running)
    }

    pub fn phase(&self) -> HostPhase {
        *self.tx.borrow()
    }

    pub fn set(&self, phase: HostPhase) {
        self.tx.send_replace(phase);
    }

    pub fn subscribe(&self) -> watch::Receiver<HostPhase> {
        self.tx.subscribe()
    }

    /// Wait until the host is running. Returns `false` if it is stopping
    /// instead.
    pub async fn wait_until_running(&self) -> bool {
        let mut rx = self.subscribe();
        match rx
            .wait_for(|phase| *phase != HostPhase::Starting)
            .await
        {
            Ok(phase) => *phase == HostPhase::Running,
            Err(_) => false,
        }
    }
}
