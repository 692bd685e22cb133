//! In-memory catalog for local runs and tests.

use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::selector::wildcard_matches;
use crate::domain::models::{FeatureSet, FeatureSetRef, FeatureSetStatus, Store};
use crate::domain::ports::{Catalog, FeatureSetFilter};

#[derive(Default)]
struct CatalogState {
    feature_sets: BTreeMap<FeatureSetRef, FeatureSet>,
    stores: BTreeMap<String, Store>,
}

/// Catalog held in process memory.
#[derive(Default)]
pub struct InMemoryCatalog {
    state: RwLock<CatalogState>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or redefine a feature set.
    ///
    /// Redefinition replaces the content but keeps the version and the
    /// publication bookkeeping, which only the controller advances.
    pub async fn apply_feature_set(&self, mut feature_set: FeatureSet) {
        let mut state = self.state.write().await;
        let reference = feature_set.reference();
        if let Some(existing) = state.feature_sets.get(&reference) {
            feature_set.spec.version = existing.spec.version;
            feature_set.meta = existing.meta.clone();
        }
        state.feature_sets.insert(reference, feature_set);
    }

    pub async fn remove_feature_set(&self, reference: &FeatureSetRef) -> Option<FeatureSet> {
        self.state.write().await.feature_sets.remove(reference)
    }

    /// Create or replace a store.
    pub async fn apply_store(&self, store: Store) {
        self.state
            .write()
            .await
            .stores
            .insert(store.name.clone(), store);
    }

    pub async fn remove_store(&self, name: &str) -> Option<Store> {
        self.state.write().await.stores.remove(name)
    }
}

fn conflict(reference: &FeatureSetRef) -> DomainError {
    DomainError::ConcurrencyConflict {
        entity: "feature_set".to_string(),
        id: reference.to_string(),
    }
}

#[async_trait]
impl Catalog for InMemoryCatalog {
    async fn list_feature_sets(&self, filter: &FeatureSetFilter) -> DomainResult<Vec<FeatureSet>> {
        let state = self.state.read().await;
        Ok(state
            .feature_sets
            .values()
            .filter(|fs| filter.project == "*" || filter.project == fs.spec.project)
            .filter(|fs| wildcard_matches(&filter.name, &fs.spec.name))
            .cloned()
            .collect())
    }

    async fn get_feature_set(&self, reference: &FeatureSetRef) -> DomainResult<Option<FeatureSet>> {
        Ok(self.state.read().await.feature_sets.get(reference).cloned())
    }

    async fn list_stores(&self) -> DomainResult<Vec<Store>> {
        Ok(self.state.read().await.stores.values().cloned().collect())
    }

    async fn update_feature_set_status(
        &self,
        reference: &FeatureSetRef,
        version: u64,
        status: FeatureSetStatus,
    ) -> DomainResult<()> {
        let mut state = self.state.write().await;
        let feature_set = state
            .feature_sets
            .get_mut(reference)
            .ok_or_else(|| DomainError::FeatureSetNotFound(reference.to_string()))?;
        if feature_set.spec.version != version {
            return Err(conflict(reference));
        }
        feature_set.meta.status = status;
        Ok(())
    }

    async fn begin_publication(
        &self,
        reference: &FeatureSetRef,
        expected_version: u64,
        digest: &str,
    ) -> DomainResult<FeatureSet> {
        let mut state = self.state.write().await;
        let feature_set = state
            .feature_sets
            .get_mut(reference)
            .ok_or_else(|| DomainError::FeatureSetNotFound(reference.to_string()))?;
        if feature_set.spec.version != expected_version {
            return Err(conflict(reference));
        }
        feature_set.spec.version += 1;
        feature_set.meta.status = FeatureSetStatus::Pending;
        feature_set.meta.published_digest = Some(digest.to_string());
        feature_set.meta.awaiting_publication = true;
        Ok(feature_set.clone())
    }

    async fn complete_publication(&self, reference: &FeatureSetRef, version: u64) -> DomainResult<()> {
        let mut state = self.state.write().await;
        let feature_set = state
            .feature_sets
            .get_mut(reference)
            .ok_or_else(|| DomainError::FeatureSetNotFound(reference.to_string()))?;
        // A newer version supersedes the confirmation.
        if feature_set.spec.version == version {
            feature_set.meta.awaiting_publication = false;
        }
        Ok(())
    }
}
