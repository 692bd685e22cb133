//! Messages exchanged with running jobs over the notification channel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::feature_set::{FeatureSetRef, FeatureSetSpec};

/// Outbound: a feature-set spec at a freshly assigned version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecUpdate {
    pub spec: FeatureSetSpec,
    /// Job expected to pick the spec up.
    pub job_id: String,
    pub published_at: DateTime<Utc>,
}

impl SpecUpdate {
    pub fn new(spec: FeatureSetSpec, job_id: impl Into<String>) -> Self {
        Self {
            spec,
            job_id: job_id.into(),
            published_at: Utc::now(),
        }
    }

    /// Partition key: `project/name`.
    pub fn key(&self) -> String {
        FeatureSetRef::new(&self.spec.project, &self.spec.name).to_string()
    }

    pub fn version(&self) -> u64 {
        self.spec.version
    }
}

/// Inbound: a job confirming it processed a spec version.
///
/// The reference stays a raw string so malformed messages can be counted
/// and dropped instead of failing deserialization of the whole batch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FeatureSetSpecAck {
    pub feature_set_reference: String,
    pub feature_set_version: u64,
    pub job_id: String,
}

impl FeatureSetSpecAck {
    pub fn new(
        reference: impl Into<String>,
        version: u64,
        job_id: impl Into<String>,
    ) -> Self {
        Self {
            feature_set_reference: reference.into(),
            feature_set_version: version,
            job_id: job_id.into(),
        }
    }
}
