//! Desired-state assembler.
//!
//! Turns a catalog snapshot into the set of jobs that should be running:
//! feature sets filtered by selectors, stores filtered by the allow-list,
//! grouped by source (or by source and feature set without consolidation).

use std::collections::{BTreeMap, BTreeSet};

use tracing::warn;

use crate::domain::models::{FeatureSet, FeatureSetRef, FeatureSetSelector, Source, Store};
use crate::services::job_identity;

/// Feature sets and stores as read from the catalog in one tick.
#[derive(Debug, Clone, Default)]
pub struct CatalogSnapshot {
    pub feature_sets: Vec<FeatureSet>,
    pub stores: Vec<Store>,
}

impl CatalogSnapshot {
    pub fn new(feature_sets: Vec<FeatureSet>, stores: Vec<Store>) -> Self {
        Self {
            feature_sets,
            stores,
        }
    }

    pub fn feature_set(&self, reference: &FeatureSetRef) -> Option<&FeatureSet> {
        self.feature_sets
            .iter()
            .find(|fs| fs.spec.project == reference.project && fs.spec.name == reference.name)
    }
}

/// A job the controller wants running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredJob {
    pub identity: String,
    /// Normalized source.
    pub source: Source,
    pub stores: BTreeMap<String, Store>,
    pub feature_sets: BTreeSet<FeatureSetRef>,
}

/// Output of one assembly.
#[derive(Debug, Clone, Default)]
pub struct DesiredState {
    /// Desired jobs keyed by identity.
    pub jobs: BTreeMap<String, DesiredJob>,
    /// Feature sets left out because no job can be built for them, with the
    /// reason.
    pub rejected: Vec<(FeatureSetRef, String)>,
}

/// Assembler inputs that come from configuration.
#[derive(Debug, Clone)]
pub struct DesiredStateConfig {
    pub selectors: Vec<FeatureSetSelector>,
    /// Store names the controller may deliver to. Empty allows none.
    pub allowed_stores: BTreeSet<String>,
    pub consolidate: bool,
}

impl DesiredStateConfig {
    pub fn new(
        selectors: Vec<FeatureSetSelector>,
        allowed_stores: impl IntoIterator<Item = String>,
        consolidate: bool,
    ) -> Self {
        Self {
            selectors,
            allowed_stores: allowed_stores.into_iter().collect(),
            consolidate,
        }
    }

    fn selects(&self, reference: &FeatureSetRef) -> bool {
        self.selectors.iter().any(|s| s.matches(reference))
    }
}

/// Compute desired jobs keyed by identity.
///
/// Feature sets that no allowed store subscribes to produce no job. A feature
/// set whose source cannot be identified is rejected on its own and never
/// affects the others.
pub fn compute_desired(snapshot: &CatalogSnapshot, config: &DesiredStateConfig) -> DesiredState {
    let stores: Vec<&Store> = snapshot
        .stores
        .iter()
        .filter(|store| config.allowed_stores.contains(&store.name))
        .collect();

    let mut desired: BTreeMap<String, DesiredJob> = BTreeMap::new();
    let mut rejected = Vec::new();

    for feature_set in &snapshot.feature_sets {
        let reference = feature_set.reference();
        if !config.selects(&reference) {
            continue;
        }

        let wanted_by: Vec<&Store> = stores
            .iter()
            .copied()
            .filter(|store| store.is_subscribed_to(&reference))
            .collect();
        if wanted_by.is_empty() {
            continue;
        }

        let source = feature_set.spec.source.normalized();
        let identity = if config.consolidate {
            job_identity::identity(&source)
        } else {
            job_identity::feature_set_identity(&source, &reference)
        };
        let identity = match identity {
            Ok(identity) => identity,
            Err(err) => {
                warn!(feature_set = %reference, error = %err, "skipping feature set");
                rejected.push((reference, err.to_string()));
                continue;
            }
        };

        let job = desired
            .entry(identity.clone())
            .or_insert_with(|| DesiredJob {
                identity,
                source,
                stores: BTreeMap::new(),
                feature_sets: BTreeSet::new(),
            });
        job.feature_sets.insert(reference);
        for store in wanted_by {
            job.stores
                .entry(store.name.clone())
                .or_insert_with(|| store.clone());
        }
    }

    DesiredState {
        jobs: desired,
        rejected,
    }
}
