//! Ack consumer: pulls acknowledgements off the ack stream and hands each to
//! the delivery tracker.
//!
//! The transport may never redeliver an ack, so an ack that fails on a
//! transient error is retried in place before the next one is read.

use backoff::ExponentialBackoffBuilder;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::domain::errors::DomainResult;
use crate::domain::models::FeatureSetSpecAck;
use crate::domain::ports::AckStream;
use crate::services::delivery_tracker::{AckOutcome, DeliveryTracker};

/// Pause after a stream error before reading again.
const STREAM_ERROR_BACKOFF: Duration = Duration::from_millis(500);

/// Retry budget for one ack.
#[derive(Debug, Clone)]
pub struct AckConsumerConfig {
    pub initial_retry_interval: Duration,
    /// Give up on an ack after this long; `None` retries until stopped.
    pub max_retry_elapsed: Option<Duration>,
}

impl Default for AckConsumerConfig {
    fn default() -> Self {
        Self {
            initial_retry_interval: Duration::from_millis(100),
            max_retry_elapsed: Some(Duration::from_secs(300)),
        }
    }
}

pub struct AckConsumer {
    stream: Arc<dyn AckStream>,
    tracker: Arc<DeliveryTracker>,
    config: AckConsumerConfig,
    stop_flag: Arc<AtomicBool>,
}

impl AckConsumer {
    pub fn new(stream: Arc<dyn AckStream>, tracker: Arc<DeliveryTracker>) -> Self {
        Self::with_config(stream, tracker, AckConsumerConfig::default())
    }

    pub fn with_config(
        stream: Arc<dyn AckStream>,
        tracker: Arc<DeliveryTracker>,
        config: AckConsumerConfig,
    ) -> Self {
        Self {
            stream,
            tracker,
            config,
            stop_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag that ends the loop once set. The loop notices it between acks.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop_flag.clone()
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<u64> {
        tokio::spawn(self.run())
    }

    /// Consume until the stream closes or the stop flag is set. Returns the
    /// number of acks handled.
    pub async fn run(self) -> u64 {
        let mut handled = 0u64;
        info!("ack consumer started");

        while !self.stop_flag.load(Ordering::Acquire) {
            let ack = match self.stream.next_ack().await {
                Ok(Some(ack)) => ack,
                Ok(None) => {
                    debug!("ack stream closed");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "failed to read from ack stream");
                    tokio::time::sleep(STREAM_ERROR_BACKOFF).await;
                    continue;
                }
            };

            handled += 1;
            match self.dispatch(&ack).await {
                Ok(outcome) => debug!(
                    feature_set = %ack.feature_set_reference,
                    version = ack.feature_set_version,
                    job_id = %ack.job_id,
                    outcome = outcome.as_str(),
                    "ack handled"
                ),
                Err(e) => warn!(
                    feature_set = %ack.feature_set_reference,
                    version = ack.feature_set_version,
                    job_id = %ack.job_id,
                    error = %e,
                    "giving up on ack"
                ),
            }
        }

        info!(handled, "ack consumer stopped");
        handled
    }

    /// Hand one ack to the tracker, retrying transient failures with
    /// exponential backoff until it succeeds, the budget runs out or the
    /// consumer is stopped.
    async fn dispatch(&self, ack: &FeatureSetSpecAck) -> DomainResult<AckOutcome> {
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(self.config.initial_retry_interval)
            .with_max_elapsed_time(self.config.max_retry_elapsed)
            .build();
        let tracker = &self.tracker;
        let stop_flag = &self.stop_flag;

        backoff::future::retry(policy, move || async move {
            match tracker.handle_ack(ack).await {
                Ok(outcome) => Ok(outcome),
                Err(err) if err.is_transient() && !stop_flag.load(Ordering::Acquire) => {
                    warn!(
                        feature_set = %ack.feature_set_reference,
                        version = ack.feature_set_version,
                        job_id = %ack.job_id,
                        error = %err,
                        "failed to apply ack, retrying"
                    );
                    Err(backoff::Error::transient(err))
                }
                Err(err) => Err(backoff::Error::permanent(err)),
            }
        })
        .await
    }
}
