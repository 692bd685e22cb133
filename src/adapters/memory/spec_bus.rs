//! In-process notification channel.
//!
//! Spec updates fan out over a broadcast channel (SSE subscribers, tests);
//! acknowledgements are funnelled through an mpsc queue into the ack stream.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{FeatureSetSpecAck, SpecUpdate};
use crate::domain::ports::{AckStream, SpecPublisher};

#[derive(Debug, Clone)]
pub struct SpecBusConfig {
    /// Capacity of the spec broadcast channel.
    pub channel_capacity: usize,
    /// Capacity of the ack queue.
    pub ack_capacity: usize,
}

impl Default for SpecBusConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            ack_capacity: 1024,
        }
    }
}

pub struct InMemorySpecBus {
    specs: broadcast::Sender<SpecUpdate>,
    history: RwLock<Vec<SpecUpdate>>,
    ack_tx: mpsc::Sender<FeatureSetSpecAck>,
    ack_rx: Mutex<mpsc::Receiver<FeatureSetSpecAck>>,
    fail_publish: AtomicBool,
}

impl Default for InMemorySpecBus {
    fn default() -> Self {
        Self::new(SpecBusConfig::default())
    }
}

impl InMemorySpecBus {
    pub fn new(config: SpecBusConfig) -> Self {
        let (specs, _) = broadcast::channel(config.channel_capacity);
        let (ack_tx, ack_rx) = mpsc::channel(config.ack_capacity);
        Self {
            specs,
            history: RwLock::new(Vec::new()),
            ack_tx,
            ack_rx: Mutex::new(ack_rx),
            fail_publish: AtomicBool::new(false),
        }
    }

    /// Subscribe to published spec updates.
    pub fn subscribe(&self) -> broadcast::Receiver<SpecUpdate> {
        self.specs.subscribe()
    }

    /// Every update published so far, in publication order.
    pub async fn published(&self) -> Vec<SpecUpdate> {
        self.history.read().await.clone()
    }

    /// Versions published for one `project/name` key.
    pub async fn published_versions(&self, key: &str) -> Vec<u64> {
        self.history
            .read()
            .await
            .iter()
            .filter(|u| u.key() == key)
            .map(SpecUpdate::version)
            .collect()
    }

    /// Handle for jobs (or the HTTP bridge) to send acknowledgements.
    pub fn ack_sender(&self) -> mpsc::Sender<FeatureSetSpecAck> {
        self.ack_tx.clone()
    }

    pub async fn send_ack(&self, ack: FeatureSetSpecAck) -> DomainResult<()> {
        self.ack_tx
            .send(ack)
            .await
            .map_err(|e| DomainError::Channel(e.to_string()))
    }

    /// Make `publish` fail until reset, to exercise transport retries.
    pub fn set_fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl SpecPublisher for InMemorySpecBus {
    async fn publish(&self, key: &str, update: &SpecUpdate) -> DomainResult<()> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(DomainError::Channel(format!("publish to {key} failed")));
        }
        self.history.write().await.push(update.clone());
        // No subscribers is not an error.
        let _ = self.specs.send(update.clone());
        Ok(())
    }
}

#[async_trait]
impl AckStream for InMemorySpecBus {
    async fn next_ack(&self) -> DomainResult<Option<FeatureSetSpecAck>> {
        Ok(self.ack_rx.lock().await.recv().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{FeatureSet, Source};

    fn update(version: u64) -> SpecUpdate {
        let mut fs = FeatureSet::new("default", "test", Source::kafka("localhost:9092", "t"));
        fs.spec.version = version;
        SpecUpdate::new(fs.spec, "job-1")
    }

    #[tokio::test]
    async fn test_publish_records_and_broadcasts() {
        let bus = InMemorySpecBus::default();
        let mut rx = bus.subscribe();

        bus.publish("default/test", &update(1)).await.unwrap();
        bus.publish("default/test", &update(2)).await.unwrap();

        assert_eq!(rx.recv().await.unwrap().version(), 1);
        assert_eq!(bus.published_versions("default/test").await, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_failing_publish_records_nothing() {
        let bus = InMemorySpecBus::default();
        bus.set_fail_publish(true);
        assert!(bus.publish("default/test", &update(1)).await.is_err());
        assert!(bus.published().await.is_empty());
    }

    #[tokio::test]
    async fn test_acks_flow_through_stream() {
        let bus = InMemorySpecBus::default();
        bus.send_ack(FeatureSetSpecAck::new("default/test", 1, "job-1"))
            .await
            .unwrap();
        let ack = bus.next_ack().await.unwrap().unwrap();
        assert_eq!(ack.feature_set_version, 1);
    }
}
