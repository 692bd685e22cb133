//! Store domain model.
//!
//! Stores are destinations declared outside the controller. Each carries
//! subscriptions selecting the feature sets it wants delivered.

use serde::{Deserialize, Serialize};

use super::feature_set::FeatureSetRef;
use super::selector::wildcard_matches;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreType {
    Redis,
    RedisCluster,
    Bigquery,
}

impl StoreType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Redis => "redis",
            Self::RedisCluster => "redis_cluster",
            Self::Bigquery => "bigquery",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "redis" => Some(Self::Redis),
            "redis_cluster" | "redis-cluster" => Some(Self::RedisCluster),
            "bigquery" => Some(Self::Bigquery),
            _ => None,
        }
    }
}

/// Selects feature sets a store wants. `project` and `name` accept wildcards.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Subscription {
    pub project: String,
    pub name: String,
    /// Exclusions win over inclusions.
    #[serde(default)]
    pub exclude: bool,
}

impl Subscription {
    pub fn new(project: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            name: name.into(),
            exclude: false,
        }
    }

    pub fn excluding(project: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            exclude: true,
            ..Self::new(project, name)
        }
    }

    pub fn matches(&self, reference: &FeatureSetRef) -> bool {
        wildcard_matches(&self.project, &reference.project)
            && wildcard_matches(&self.name, &reference.name)
    }
}

/// A named destination for feature data.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Store {
    pub name: String,
    #[serde(rename = "type")]
    pub store_type: StoreType,
    #[serde(default)]
    pub subscriptions: Vec<Subscription>,
}

impl Store {
    pub fn new(name: impl Into<String>, store_type: StoreType) -> Self {
        Self {
            name: name.into(),
            store_type,
            subscriptions: Vec::new(),
        }
    }

    pub fn with_subscription(mut self, subscription: Subscription) -> Self {
        self.subscriptions.push(subscription);
        self
    }

    /// A store wants a feature set when an inclusive subscription matches
    /// and no exclusive one does.
    pub fn is_subscribed_to(&self, reference: &FeatureSetRef) -> bool {
        let mut included = false;
        for subscription in &self.subscriptions {
            if subscription.matches(reference) {
                if subscription.exclude {
                    return false;
                }
                included = true;
            }
        }
        included
    }
}
