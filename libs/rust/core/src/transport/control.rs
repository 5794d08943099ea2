use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::{control_subject, nats_endpoint};
use crate::error::TransportError;
use crate::params::ParticipantId;

/// Inbound command bodies for one identity.
#[async_trait]
pub trait ControlChannel: Send {
    /// Waits at most `timeout`; `Ok(None)` means nothing arrived.
    async fn recv(&mut self, timeout: Duration) -> Result<Option<String>, TransportError>;
}

#[async_trait]
pub trait ControlFabric: Send + Sync {
    async fn subscribe(&self, identity: &ParticipantId) -> Result<Box<dyn ControlChannel>, TransportError>;
    async fn publish(&self, target: &ParticipantId, body: &str) -> Result<(), TransportError>;
}

#[derive(Clone)]
pub struct NatsFabric {
    client: async_nats::Client,
}

impl NatsFabric {
    pub async fn connect(host: &str, port: u16) -> Result<Self, TransportError> {
        let endpoint = nats_endpoint(host, port);
        let client = async_nats::connect(&endpoint).await.map_err(|e| TransportError::Connect { endpoint: endpoint.clone(), reason: e.to_string() })?;
        info!(%endpoint, "control_fabric_connected");
        Ok(Self { client })
    }
}

struct NatsControlChannel { subject: String, sub: async_nats::Subscriber }

#[async_trait]
impl ControlChannel for NatsControlChannel {
    async fn recv(&mut self, timeout: Duration) -> Result<Option<String>, TransportError> {
        match tokio::time::timeout(timeout, self.sub.next()).await {
            Err(_) => Ok(None),
            Ok(None) => Err(TransportError::Closed),
            Ok(Some(msg)) => {
                let body = String::from_utf8(msg.payload.to_vec()).map_err(|e| TransportError::Malformed(format!("{}: {e}", self.subject)))?;
                Ok(Some(body))
            }
        }
    }
}

#[async_trait]
impl ControlFabric for NatsFabric {
    async fn subscribe(&self, identity: &ParticipantId) -> Result<Box<dyn ControlChannel>, TransportError> {
        let subject = control_subject(identity);
        let sub = self.client.subscribe(subject.clone()).await.map_err(|e| TransportError::Subscribe { subject: subject.clone(), reason: e.to_string() })?;
        debug!(%subject, "control_subscribed");
        Ok(Box::new(NatsControlChannel { subject, sub }))
    }

    async fn publish(&self, target: &ParticipantId, body: &str) -> Result<(), TransportError> {
        let subject = control_subject(target);
        self.client.publish(subject.clone(), body.to_string().into()).await.map_err(|e| TransportError::Publish { subject: subject.clone(), reason: e.to_string() })?;
        self.client.flush().await.map_err(|e| TransportError::Publish { subject, reason: e.to_string() })
    }
}

/// In-process fabric for single-host runs and tests. A later subscription for
/// the same identity replaces the earlier one.
#[derive(Clone, Default)]
pub struct LocalFabric {
    routes: Arc<Mutex<HashMap<ParticipantId, mpsc::UnboundedSender<String>>>>,
}

impl LocalFabric {
    pub fn new() -> Self { Self::default() }
    pub fn is_routed(&self, identity: &ParticipantId) -> bool {
        self.routes.lock().get(identity).is_some_and(|tx| !tx.is_closed())
    }
}

struct LocalControlChannel { rx: mpsc::UnboundedReceiver<String> }

#[async_trait]
impl ControlChannel for LocalControlChannel {
    async fn recv(&mut self, timeout: Duration) -> Result<Option<String>, TransportError> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Err(_) => Ok(None),
            Ok(None) => Err(TransportError::Closed),
            Ok(Some(body)) => Ok(Some(body)),
        }
    }
}

#[async_trait]
impl ControlFabric for LocalFabric {
    async fn subscribe(&self, identity: &ParticipantId) -> Result<Box<dyn ControlChannel>, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes.lock().insert(identity.clone(), tx);
        Ok(Box::new(LocalControlChannel { rx }))
    }

    async fn publish(&self, target: &ParticipantId, body: &str) -> Result<(), TransportError> {
        let tx = self.routes.lock().get(target).cloned().ok_or_else(|| TransportError::UnknownTarget(target.clone()))?;
        tx.send(body.to_string()).map_err(|_| TransportError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_fabric_routes_by_identity() {
        let fabric = LocalFabric::new();
        let mut one = fabric.subscribe(&ParticipantId::worker(1)).await.unwrap();
        let mut two = fabric.subscribe(&ParticipantId::worker(2)).await.unwrap();
        fabric.publish(&ParticipantId::worker(2), "START_FL").await.unwrap();
        assert_eq!(two.recv(Duration::from_millis(50)).await.unwrap().as_deref(), Some("START_FL"));
        assert_eq!(one.recv(Duration::from_millis(10)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn publish_to_unknown_or_dropped_target_fails() {
        let fabric = LocalFabric::new();
        assert!(matches!(fabric.publish(&ParticipantId::worker(9), "STOP_FL").await, Err(TransportError::UnknownTarget(_))));
        let ch = fabric.subscribe(&ParticipantId::worker(3)).await.unwrap();
        assert!(fabric.is_routed(&ParticipantId::worker(3)));
        drop(ch);
        assert!(matches!(fabric.publish(&ParticipantId::worker(3), "STOP_FL").await, Err(TransportError::Closed)));
    }

    #[cfg(feature = "integration")]
    #[tokio::test]
    async fn nats_fabric_round_trip() {
        let fabric = NatsFabric::connect("127.0.0.1", 4222).await.unwrap();
        let id = ParticipantId::new("it-control");
        let mut ch = fabric.subscribe(&id).await.unwrap();
        fabric.publish(&id, "STOP_FL").await.unwrap();
        assert_eq!(ch.recv(Duration::from_secs(2)).await.unwrap().as_deref(), Some("STOP_FL"));
    }
}
