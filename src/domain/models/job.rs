//! Job domain model.
//!
//! A job is the controller's unit of reconciliation: one physical ingestion
//! pipeline reading from a source and delivering to a set of stores.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use super::feature_set::FeatureSetRef;
use super::source::Source;
use super::store::Store;
use super::version::ControllerVersion;

/// Label holding the encoded version of the controller that created a job.
pub const VERSION_LABEL: &str = "application.version";

/// Lifecycle of a job record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    /// Abort requested, runtime not yet confirmed stopped.
    Aborting,
    Aborted,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Aborting => "aborting",
            Self::Aborted => "aborted",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "running" => Some(Self::Running),
            "aborting" => Some(Self::Aborting),
            "aborted" => Some(Self::Aborted),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Aborted)
    }

    pub fn valid_transitions(&self) -> Vec<JobStatus> {
        match self {
            Self::Running => vec![Self::Aborting, Self::Aborted],
            Self::Aborting => vec![Self::Aborted],
            Self::Aborted => vec![],
        }
    }

    pub fn can_transition_to(&self, new_status: Self) -> bool {
        self.valid_transitions().contains(&new_status)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    /// A version was sent and not yet acknowledged by this job.
    InProgress,
    /// The job acknowledged `delivered_version`.
    Delivered,
}

/// What a job has acknowledged for one feature set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSetDeliveryStatus {
    /// Highest acknowledged version; 0 before the first ack.
    pub delivered_version: u64,
    pub status: DeliveryState,
}

impl FeatureSetDeliveryStatus {
    pub const fn in_progress() -> Self {
        Self {
            delivered_version: 0,
            status: DeliveryState::InProgress,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// `{identity}-{launch millis}`; new on every launch.
    pub id: String,
    /// Source-derived key shared by every launch for the same source.
    pub identity: String,
    /// Runtime handle assigned by the job manager.
    pub ext_id: Option<String>,
    pub runner: Option<String>,
    pub source: Source,
    pub stores: BTreeMap<String, Store>,
    pub feature_sets: BTreeSet<FeatureSetRef>,
    pub labels: BTreeMap<String, String>,
    pub controller_version: ControllerVersion,
    pub status: JobStatus,
    pub delivery_statuses: BTreeMap<FeatureSetRef, FeatureSetDeliveryStatus>,
    /// Optimistic concurrency counter, bumped on every persisted update.
    pub record_version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(
        identity: impl Into<String>,
        source: Source,
        stores: BTreeMap<String, Store>,
        feature_sets: BTreeSet<FeatureSetRef>,
        controller_version: ControllerVersion,
    ) -> Self {
        let identity = identity.into();
        let now = Utc::now();
        let delivery_statuses = feature_sets
            .iter()
            .map(|r| (r.clone(), FeatureSetDeliveryStatus::in_progress()))
            .collect();

        Self {
            id: format!("{}-{}", identity, now.timestamp_millis()),
            identity,
            ext_id: None,
            runner: None,
            source,
            stores,
            feature_sets,
            labels: BTreeMap::new(),
            controller_version,
            status: JobStatus::Running,
            delivery_statuses,
            record_version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn is_running(&self) -> bool {
        self.status == JobStatus::Running
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn transition_to(&mut self, new_status: JobStatus) -> Result<(), String> {
        if !self.status.can_transition_to(new_status) {
            return Err(format!(
                "Cannot transition job {} from {} to {}",
                self.id,
                self.status.as_str(),
                new_status.as_str()
            ));
        }
        self.status = new_status;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Replace the served feature sets, keeping delivery history for those
    /// still served and starting fresh entries for new ones.
    pub fn set_feature_sets(&mut self, feature_sets: BTreeSet<FeatureSetRef>) {
        self.delivery_statuses
            .retain(|reference, _| feature_sets.contains(reference));
        for reference in &feature_sets {
            self.delivery_statuses
                .entry(reference.clone())
                .or_insert_with(FeatureSetDeliveryStatus::in_progress);
        }
        self.feature_sets = feature_sets;
        self.updated_at = Utc::now();
    }

    /// Record an acknowledgement. Returns `false` when it would lower the
    /// recorded version.
    pub fn record_delivery(&mut self, reference: &FeatureSetRef, version: u64) -> bool {
        let entry = self
            .delivery_statuses
            .entry(reference.clone())
            .or_insert_with(FeatureSetDeliveryStatus::in_progress);
        if version < entry.delivered_version {
            return false;
        }
        entry.delivered_version = version;
        entry.status = DeliveryState::Delivered;
        self.updated_at = Utc::now();
        true
    }

    /// Mark a freshly published version as awaiting this job's ack.
    pub fn mark_in_progress(&mut self, reference: &FeatureSetRef) {
        let entry = self
            .delivery_statuses
            .entry(reference.clone())
            .or_insert_with(FeatureSetDeliveryStatus::in_progress);
        entry.status = DeliveryState::InProgress;
        self.updated_at = Utc::now();
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("Job id cannot be empty".to_string());
        }
        if self.identity.trim().is_empty() {
            return Err("Job identity cannot be empty".to_string());
        }
        if !self.labels.contains_key(VERSION_LABEL) {
            return Err(format!("Job {} is missing the {VERSION_LABEL} label", self.id));
        }
        self.source.validate()
    }
}
