use async_trait::async_trait;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use super::{downlink_subject, uplink_subject};
use crate::error::TransportError;

/// Bidirectional typed message link. `Out` is what this side sends, `In` what it receives.
#[async_trait]
pub trait Link<Out, In>: Send
where
    Out: Send + Sync + 'static,
    In: Send + 'static,
{
    async fn send(&mut self, msg: &Out) -> Result<(), TransportError>;
    /// Waits at most `timeout`; `Ok(None)` means nothing arrived in time.
    async fn recv(&mut self, timeout: Duration) -> Result<Option<In>, TransportError>;
}

/// JSON messages over a pair of NATS subjects.
pub struct NatsLink<Out, In> {
    client: async_nats::Client,
    publish_subject: String,
    sub: async_nats::Subscriber,
    _marker: PhantomData<fn(Out) -> In>,
}

impl<Out, In> NatsLink<Out, In> {
    pub async fn open(client: async_nats::Client, publish_subject: String, subscribe_subject: String) -> Result<Self, TransportError> {
        let sub = client.subscribe(subscribe_subject.clone()).await.map_err(|e| TransportError::Subscribe { subject: subscribe_subject.clone(), reason: e.to_string() })?;
        debug!(publish=%publish_subject, subscribe=%subscribe_subject, "data_link_opened");
        Ok(Self { client, publish_subject, sub, _marker: PhantomData })
    }

    /// Aggregator side: publish downlink, consume uplink.
    pub async fn aggregator(client: async_nats::Client, experiment: &str) -> Result<Self, TransportError> {
        Self::open(client, downlink_subject(experiment), uplink_subject(experiment)).await
    }

    /// Worker side: publish uplink, consume downlink.
    pub async fn worker(client: async_nats::Client, experiment: &str) -> Result<Self, TransportError> {
        Self::open(client, uplink_subject(experiment), downlink_subject(experiment)).await
    }
}

#[async_trait]
impl<Out, In> Link<Out, In> for NatsLink<Out, In>
where
    Out: Serialize + Send + Sync + 'static,
    In: DeserializeOwned + Send + 'static,
{
    async fn send(&mut self, msg: &Out) -> Result<(), TransportError> {
        let bytes = serde_json::to_vec(msg).map_err(|e| TransportError::Malformed(e.to_string()))?;
        let subject = self.publish_subject.clone();
        self.client.publish(subject.clone(), bytes.into()).await.map_err(|e| TransportError::Publish { subject: subject.clone(), reason: e.to_string() })?;
        self.client.flush().await.map_err(|e| TransportError::Publish { subject, reason: e.to_string() })
    }

    async fn recv(&mut self, timeout: Duration) -> Result<Option<In>, TransportError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let msg = match tokio::time::timeout_at(deadline, self.sub.next()).await {
                Err(_) => return Ok(None),
                Ok(None) => return Err(TransportError::Closed),
                Ok(Some(m)) => m,
            };
            match serde_json::from_slice::<In>(&msg.payload) {
                Ok(decoded) => return Ok(Some(decoded)),
                // one bad publisher must not stall the round
                Err(e) => warn!(subject=%msg.subject, error=%e, "data_message_dropped"),
            }
        }
    }
}

/// In-process hub: one aggregator side fanning out to any number of peers.
pub fn memory_bus<D, U>(capacity: usize) -> (MemoryHubLink<D, U>, MemoryPeers<D, U>)
where
    D: Clone + Send + 'static,
    U: Send + 'static,
{
    let (down, _) = broadcast::channel(capacity.max(1));
    let (up_tx, up_rx) = mpsc::unbounded_channel();
    (MemoryHubLink { down: down.clone(), up: up_rx }, MemoryPeers { down, up: up_tx })
}

pub struct MemoryHubLink<D, U> {
    down: broadcast::Sender<D>,
    up: mpsc::UnboundedReceiver<U>,
}

/// Factory for peer links attached to a [`memory_bus`].
#[derive(Clone)]
pub struct MemoryPeers<D, U> {
    down: broadcast::Sender<D>,
    up: mpsc::UnboundedSender<U>,
}

impl<D: Clone, U> MemoryPeers<D, U> {
    pub fn connect(&self) -> MemoryPeerLink<D, U> {
        MemoryPeerLink { down: self.down.subscribe(), up: self.up.clone() }
    }
}

pub struct MemoryPeerLink<D, U> {
    down: broadcast::Receiver<D>,
    up: mpsc::UnboundedSender<U>,
}

#[async_trait]
impl<D, U> Link<D, U> for MemoryHubLink<D, U>
where
    D: Clone + Send + Sync + 'static,
    U: Send + 'static,
{
    async fn send(&mut self, msg: &D) -> Result<(), TransportError> {
        // no subscribers is not an error, like a publish nobody listens to
        let _ = self.down.send(msg.clone());
        Ok(())
    }

    async fn recv(&mut self, timeout: Duration) -> Result<Option<U>, TransportError> {
        match tokio::time::timeout(timeout, self.up.recv()).await {
            Err(_) => Ok(None),
            Ok(None) => Err(TransportError::Closed),
            Ok(Some(m)) => Ok(Some(m)),
        }
    }
}

#[async_trait]
impl<D, U> Link<U, D> for MemoryPeerLink<D, U>
where
    D: Clone + Send + 'static,
    U: Clone + Send + Sync + 'static,
{
    async fn send(&mut self, msg: &U) -> Result<(), TransportError> {
        self.up.send(msg.clone()).map_err(|_| TransportError::Closed)
    }

    async fn recv(&mut self, timeout: Duration) -> Result<Option<D>, TransportError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, self.down.recv()).await {
                Err(_) => return Ok(None),
                Ok(Ok(m)) => return Ok(Some(m)),
                Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => warn!(skipped, "memory_link_lagged"),
                Ok(Err(broadcast::error::RecvError::Closed)) => return Err(TransportError::Closed),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hub_fans_out_and_collects() {
        let (mut hub, peers) = memory_bus::<String, u32>(16);
        let mut a = peers.connect();
        let mut b = peers.connect();
        hub.send(&"fit".to_string()).await.unwrap();
        assert_eq!(a.recv(Duration::from_millis(50)).await.unwrap().as_deref(), Some("fit"));
        assert_eq!(b.recv(Duration::from_millis(50)).await.unwrap().as_deref(), Some("fit"));
        a.send(&1).await.unwrap();
        b.send(&2).await.unwrap();
        let mut got = vec![hub.recv(Duration::from_millis(50)).await.unwrap().unwrap(), hub.recv(Duration::from_millis(50)).await.unwrap().unwrap()];
        got.sort();
        assert_eq!(got, vec![1, 2]);
        assert_eq!(hub.recv(Duration::from_millis(10)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn peer_connected_late_misses_earlier_messages() {
        let (mut hub, peers) = memory_bus::<u8, u8>(4);
        hub.send(&7).await.unwrap();
        let mut late = peers.connect();
        assert_eq!(late.recv(Duration::from_millis(10)).await.unwrap(), None);
    }
}
