//! Feature set domain model.
//!
//! A feature set is a named, versioned schema ingested from a source. The
//! catalog owns it; the controller reads it, bumps its version whenever the
//! delivered content changes, and tracks its readiness.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use super::source::Source;

/// `(project, name)` reference, rendered as `project/name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FeatureSetRef {
    pub project: String,
    pub name: String,
}

impl FeatureSetRef {
    pub fn new(project: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            name: name.into(),
        }
    }

    pub fn parse(s: &str) -> Result<Self, String> {
        let mut parts = s.split('/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(project), Some(name), None) if !project.is_empty() && !name.is_empty() => {
                Ok(Self::new(project, name))
            }
            _ => Err(format!("Invalid feature set reference '{s}': expected project/name")),
        }
    }
}

impl std::fmt::Display for FeatureSetRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.project, self.name)
    }
}

impl TryFrom<String> for FeatureSetRef {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<FeatureSetRef> for String {
    fn from(value: FeatureSetRef) -> Self {
        value.to_string()
    }
}

/// Value type of an entity or feature column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValueType {
    Bytes,
    String,
    Int32,
    Int64,
    Double,
    Float,
    Bool,
}

/// A named, typed column of a feature set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub value_type: ValueType,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, value_type: ValueType) -> Self {
        Self {
            name: name.into(),
            value_type,
        }
    }
}

/// Readiness of a feature set across the jobs that serve it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureSetStatus {
    /// The current version has not been acknowledged yet.
    Pending,
    /// The serving job acknowledged the current version.
    Ready,
}

impl Default for FeatureSetStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl FeatureSetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "ready" => Some(Self::Ready),
            _ => None,
        }
    }
}

/// The deliverable definition of a feature set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSetSpec {
    pub project: String,
    pub name: String,
    /// Last published version; 0 means never published.
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub entities: Vec<FieldSpec>,
    #[serde(default)]
    pub features: Vec<FieldSpec>,
    pub source: Source,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Catalog bookkeeping around a feature set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSetMeta {
    #[serde(default)]
    pub status: FeatureSetStatus,
    /// Digest of the content and serving job of the last assigned version.
    #[serde(default)]
    pub published_digest: Option<String>,
    /// A version was assigned but its publication has not been confirmed.
    #[serde(default)]
    pub awaiting_publication: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSet {
    pub spec: FeatureSetSpec,
    #[serde(default)]
    pub meta: FeatureSetMeta,
}

/// Canonical hashing input; `version` is deliberately absent.
#[derive(Serialize)]
struct DigestInput<'a> {
    project: &'a str,
    name: &'a str,
    entities: &'a [FieldSpec],
    features: &'a [FieldSpec],
    source: Source,
    labels: &'a BTreeMap<String, String>,
    job_id: &'a str,
}

impl FeatureSet {
    pub fn new(project: impl Into<String>, name: impl Into<String>, source: Source) -> Self {
        Self {
            spec: FeatureSetSpec {
                project: project.into(),
                name: name.into(),
                version: 0,
                entities: Vec::new(),
                features: Vec::new(),
                source,
                labels: BTreeMap::new(),
            },
            meta: FeatureSetMeta::default(),
        }
    }

    pub fn with_entity(mut self, name: impl Into<String>, value_type: ValueType) -> Self {
        self.spec.entities.push(FieldSpec::new(name, value_type));
        self
    }

    pub fn with_feature(mut self, name: impl Into<String>, value_type: ValueType) -> Self {
        self.spec.features.push(FieldSpec::new(name, value_type));
        self
    }

    pub fn reference(&self) -> FeatureSetRef {
        FeatureSetRef::new(&self.spec.project, &self.spec.name)
    }

    pub fn version(&self) -> u64 {
        self.spec.version
    }

    pub fn status(&self) -> FeatureSetStatus {
        self.meta.status
    }

    /// SHA-256 over the delivered content plus the id of the serving job.
    ///
    /// Any change here requires a new published version.
    pub fn delivery_digest(&self, job_id: &str) -> String {
        let input = DigestInput {
            project: &self.spec.project,
            name: &self.spec.name,
            entities: &self.spec.entities,
            features: &self.spec.features,
            source: self.spec.source.normalized(),
            labels: &self.spec.labels,
            job_id,
        };
        // Serializing plain strings and enums cannot fail.
        let encoded = serde_json::to_vec(&input).unwrap_or_default();
        let digest = Sha256::digest(&encoded);
        format!("{digest:x}")
    }

    /// Whether `job_id` serving the current content still needs a publication.
    pub fn needs_publication(&self, job_id: &str) -> bool {
        let digest = self.delivery_digest(job_id);
        self.meta.awaiting_publication || self.meta.published_digest.as_deref() != Some(&digest)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.spec.project.trim().is_empty() {
            return Err("Feature set project cannot be empty".to_string());
        }
        if self.spec.name.trim().is_empty() {
            return Err("Feature set name cannot be empty".to_string());
        }
        self.spec.source.validate()
    }
}
