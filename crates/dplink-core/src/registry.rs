// ── Session registry ──
//
// Exactly one session per device id, shared by every consumer of that
// device. Sub-devices open their transport through the gateway's session,
// so the gateway must be acquired first.

use std::collections::HashMap;
use std::sync::Arc;

use dplink_api::{TransportFactory, TransportHandle};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::SessionConfig;
use crate::error::CoreError;
use crate::host::{HostLifecycle, HostPhase};
use crate::session::{ConsumerHandle, ConsumerId, ConsumerInterest, Session};

/// Owns every live [`Session`].
pub struct SessionRegistry {
    factory: Arc<dyn TransportFactory>,
    host: HostLifecycle,
    sessions: Mutex<HashMap<String, Session>>,
}

impl SessionRegistry {
    pub fn new(factory: Arc<dyn TransportFactory>, host: HostLifecycle) -> Self {
        Self {
            factory,
            host,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn host(&self) -> &HostLifecycle {
        &self.host
    }

    /// The session for `config.device_id`, created if needed, without
    /// registering a consumer.
    pub async fn open(&self, config: SessionConfig) -> Result<Session, CoreError> {
        let mut sessions = self.sessions.lock().await;
        self.open_locked(&mut sessions, config)
    }

    /// Get or create the device's session and register `interest` on it.
    /// The session starts with its first consumer.
    ///
    /// Registration happens under the registry lock, so a concurrent
    /// `release` of the last consumer cannot stop and forget the session
    /// in between.
    pub async fn acquire(
        &self,
        config: SessionConfig,
        interest: ConsumerInterest,
    ) -> Result<(Session, ConsumerHandle), CoreError> {
        let mut sessions = self.sessions.lock().await;
        let session = self.open_locked(&mut sessions, config)?;
        let handle = session.register_consumer(interest).await;
        drop(sessions);
        Ok((session, handle))
    }

    fn open_locked(
        &self,
        sessions: &mut HashMap<String, Session>,
        config: SessionConfig,
    ) -> Result<Session, CoreError> {
        if let Some(existing) = sessions.get(&config.device_id) {
            debug!(device = %config.device_id, "reusing session");
            return Ok(existing.clone());
        }

        let parent = match &config.gateway {
            Some(gateway) => Some(
                sessions
                    .get(gateway)
                    .map(|s| s.transport().clone())
                    .ok_or_else(|| CoreError::Connectivity {
                        device: config.device_id.clone(),
                        reason: format!("gateway '{gateway}' has no session"),
                    })?,
            ),
            None => None,
        };

        let transport = TransportHandle::open(
            self.factory.as_ref(),
            &config.transport_config(),
            parent.as_ref(),
        )
        .map_err(|e| CoreError::from(e).for_device(&config.device_id, None))?;

        info!(
            device = %config.display_name(),
            address = %config.address,
            via_gateway = parent.is_some(),
            "created session"
        );
        let id = config.device_id.clone();
        let session = Session::new(config, transport, self.host.clone());
        sessions.insert(id, session.clone());
        Ok(session)
    }

    /// Unregister a consumer. The session is stopped and forgotten once it
    /// has none left. Returns `false` for unknown devices or consumers.
    pub async fn release(&self, device_id: &str, consumer: ConsumerId) -> bool {
        let mut sessions = self.sessions.lock().await;
        let Some(session) = sessions.get(device_id).cloned() else {
            return false;
        };
        let removed = session.unregister_consumer(consumer).await;
        if session.consumer_count() == 0 {
            sessions.remove(device_id);
            debug!(device = %device_id, "dropped idle session");
        }
        removed
    }

    pub async fn get(&self, device_id: &str) -> Option<Session> {
        self.sessions.lock().await.get(device_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }

    pub async fn device_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Tell every session the host is stopping and wait for them all.
    pub async fn shutdown(&self) {
        self.host.set(HostPhase::Stopping);
        let drained: Vec<Session> = self.sessions.lock().await.drain().map(|(_, s)| s).collect();
        info!(sessions = drained.len(), "shutting down sessions");
        for session in drained {
            session.stop().await;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use dplink_api::mock::{MockDevice, MockFactory};
    use secrecy::SecretString;

    use super::*;

    fn config(id: &str) -> SessionConfig {
        SessionConfig::new(id, "192.0.2.10", SecretString::from("0123456789abcdef".to_owned()))
    }

    fn registry(factory: MockFactory) -> SessionRegistry {
        SessionRegistry::new(Arc::new(factory), HostLifecycle::new(HostPhase::Starting))
    }

    #[tokio::test]
    async fn one_session_per_device() {
        let factory = MockFactory::new();
        factory.insert("heater", MockDevice::new());
        let registry = registry(factory);

        let (a, first) = registry
            .acquire(config("heater"), ConsumerInterest::default())
            .await
            .unwrap();
        let (b, second) = registry
            .acquire(config("heater"), ConsumerInterest::default())
            .await
            .unwrap();
        assert_eq!(registry.len().await, 1);
        assert_eq!(a.consumer_count(), 2);
        assert_eq!(b.consumer_count(), 2);

        assert!(registry.release("heater", first.id()).await);
        assert_eq!(registry.len().await, 1);
        assert!(registry.release("heater", second.id()).await);
        assert!(registry.is_empty().await);
        assert!(!registry.release("heater", second.id()).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn acquire_racing_last_release_keeps_the_session_tracked() {
        let factory = MockFactory::new();
        factory.insert("heater", MockDevice::new());
        let registry = Arc::new(registry(factory));

        for _ in 0..50 {
            let (_, first) = registry
                .acquire(config("heater"), ConsumerInterest::default())
                .await
                .unwrap();
            let releasing = {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move { registry.release("heater", first.id()).await })
            };
            let (session, second) = registry
                .acquire(config("heater"), ConsumerInterest::default())
                .await
                .unwrap();
            assert!(releasing.await.unwrap());

            let tracked = registry
                .get("heater")
                .await
                .expect("session in use was forgotten");
            assert_eq!(tracked.consumer_count(), 1);
            assert_eq!(session.consumer_count(), 1);
            assert!(registry.release("heater", second.id()).await);
            assert!(registry.is_empty().await);
        }
    }

    #[tokio::test]
    async fn sub_device_needs_its_gateway() {
        let factory = MockFactory::new();
        factory.insert("hub", MockDevice::new());
        factory.insert("node-1", MockDevice::new());
        let registry = registry(factory);

        let mut child = config("bulb");
        child.gateway = Some("hub".into());
        child.sub_device_id = Some("node-1".into());

        let err = registry.open(child.clone()).await.unwrap_err();
        assert!(matches!(err, CoreError::Connectivity { .. }), "{err}");

        registry.open(config("hub")).await.unwrap();
        let session = registry.open(child).await.unwrap();
        assert!(session.transport().has_parent());
        assert_eq!(registry.device_ids().await, vec!["bulb", "hub"]);
    }

    #[tokio::test]
    async fn unknown_device_fails_to_open() {
        let registry = registry(MockFactory::new());
        let err = registry.open(config("ghost")).await.unwrap_err();
        assert!(matches!(err, CoreError::Connectivity { ref device, .. } if device == "ghost"));
    }
}
