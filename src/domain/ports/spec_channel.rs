//! Notification channel ports.
//!
//! Outbound spec updates and inbound acknowledgements travel over a message
//! bus that is at-least-once and only ordered per key.

use async_trait::async_trait;

use crate::domain::errors::DomainResult;
use crate::domain::models::{FeatureSetSpecAck, SpecUpdate};

/// Publishes spec updates keyed by `project/name`.
#[async_trait]
pub trait SpecPublisher: Send + Sync {
    async fn publish(&self, key: &str, update: &SpecUpdate) -> DomainResult<()>;
}

/// Source of acknowledgements from running jobs.
#[async_trait]
pub trait AckStream: Send + Sync {
    /// Next acknowledgement, or `None` once the stream is closed.
    async fn next_ack(&self) -> DomainResult<Option<FeatureSetSpecAck>>;
}
