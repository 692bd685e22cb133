//! Spec notifier.
//!
//! Assigns the next version of a feature set and publishes its spec to the
//! serving job. The version is reserved in the catalog before anything is
//! sent, so a transport failure is retried with the same version and a
//! completed publication is never sent twice.

use std::sync::Arc;
use tracing::{debug, info};

use crate::domain::errors::DomainResult;
use crate::domain::models::{FeatureSet, SpecUpdate};
use crate::domain::ports::{Catalog, SpecPublisher};

/// What a call to [`SpecNotifier::notify`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Publication {
    /// A new version was assigned and sent.
    Published(u64),
    /// The reserved version was sent again after an earlier transport failure.
    Resent(u64),
    /// The current content was already delivered to this job.
    UpToDate(u64),
}

impl Publication {
    pub fn version(&self) -> u64 {
        match self {
            Self::Published(v) | Self::Resent(v) | Self::UpToDate(v) => *v,
        }
    }

    pub fn was_sent(&self) -> bool {
        !matches!(self, Self::UpToDate(_))
    }
}

pub struct SpecNotifier {
    catalog: Arc<dyn Catalog>,
    publisher: Arc<dyn SpecPublisher>,
}

impl SpecNotifier {
    pub fn new(catalog: Arc<dyn Catalog>, publisher: Arc<dyn SpecPublisher>) -> Self {
        Self { catalog, publisher }
    }

    /// Publish `feature_set` for `job_id`.
    ///
    /// `feature_set` must be the latest catalog state; a stale copy fails
    /// with `ConcurrencyConflict` and is retried on the next tick.
    pub async fn notify(&self, feature_set: &FeatureSet, job_id: &str) -> DomainResult<Publication> {
        let reference = feature_set.reference();
        let digest = feature_set.delivery_digest(job_id);
        let same_content = feature_set.meta.published_digest.as_deref() == Some(digest.as_str());

        let (spec, publication) = match (same_content, feature_set.meta.awaiting_publication) {
            (true, false) => {
                debug!(feature_set = %reference, version = feature_set.version(), "spec already delivered");
                return Ok(Publication::UpToDate(feature_set.version()));
            }
            (true, true) => (
                feature_set.spec.clone(),
                Publication::Resent(feature_set.version()),
            ),
            (false, _) => {
                let reserved = self
                    .catalog
                    .begin_publication(&reference, feature_set.version(), &digest)
                    .await?;
                let version = reserved.version();
                (reserved.spec, Publication::Published(version))
            }
        };

        let update = SpecUpdate::new(spec, job_id);
        self.publisher.publish(&update.key(), &update).await?;
        self.catalog
            .complete_publication(&reference, publication.version())
            .await?;

        info!(
            feature_set = %reference,
            version = publication.version(),
            job_id = %job_id,
            resent = matches!(publication, Publication::Resent(_)),
            "published feature set spec"
        );
        Ok(publication)
    }
}
