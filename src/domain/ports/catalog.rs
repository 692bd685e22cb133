//! Catalog port.
//!
//! The catalog owns feature-set and store definitions. The controller reads
//! them every tick and writes back version and readiness bookkeeping.

use async_trait::async_trait;

use crate::domain::errors::DomainResult;
use crate::domain::models::{FeatureSet, FeatureSetRef, FeatureSetStatus, Store};

/// Filter criteria for listing feature sets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureSetFilter {
    /// Exact project, or `*`.
    pub project: String,
    /// Name wildcard pattern.
    pub name: String,
}

impl Default for FeatureSetFilter {
    fn default() -> Self {
        Self {
            project: "*".to_string(),
            name: "*".to_string(),
        }
    }
}

/// Remote catalog service.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// List feature sets matching the filter.
    async fn list_feature_sets(&self, filter: &FeatureSetFilter) -> DomainResult<Vec<FeatureSet>>;

    /// Get a single feature set.
    async fn get_feature_set(&self, reference: &FeatureSetRef) -> DomainResult<Option<FeatureSet>>;

    /// List every declared store.
    async fn list_stores(&self) -> DomainResult<Vec<Store>>;

    /// Set readiness, only if the feature set is still at `version`.
    ///
    /// Fails with `ConcurrencyConflict` when the version moved on.
    async fn update_feature_set_status(
        &self,
        reference: &FeatureSetRef,
        version: u64,
        status: FeatureSetStatus,
    ) -> DomainResult<()>;

    /// Assign `expected_version + 1`: status becomes pending, `digest` is
    /// recorded and the feature set is marked as awaiting publication.
    ///
    /// Fails with `ConcurrencyConflict` when the version is not
    /// `expected_version`. Returns the updated feature set.
    async fn begin_publication(
        &self,
        reference: &FeatureSetRef,
        expected_version: u64,
        digest: &str,
    ) -> DomainResult<FeatureSet>;

    /// Confirm that `version` reached the notification channel.
    async fn complete_publication(&self, reference: &FeatureSetRef, version: u64) -> DomainResult<()>;
}
