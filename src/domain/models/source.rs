//! Source domain model.
//!
//! A source is the origin stream a job ingests from. Two sources are the
//! same source when their normalized forms are equal.

use serde::{Deserialize, Serialize};

/// Kind of origin stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Kafka,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Kafka => "kafka",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "kafka" => Some(Self::Kafka),
            _ => None,
        }
    }
}

/// Kafka connection settings for a source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KafkaSourceConfig {
    /// Comma-separated `host:port` list.
    pub bootstrap_servers: String,
    pub topic: String,
}

/// An origin stream definition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Source {
    #[serde(rename = "type")]
    pub source_type: SourceType,
    pub kafka: KafkaSourceConfig,
}

impl Source {
    pub fn kafka(bootstrap_servers: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            source_type: SourceType::Kafka,
            kafka: KafkaSourceConfig {
                bootstrap_servers: bootstrap_servers.into(),
                topic: topic.into(),
            },
        }
    }

    /// Canonical form: bootstrap servers trimmed, sorted and deduplicated.
    ///
    /// All equality checks between sources go through this form so that
    /// `"a:9092,b:9092"` and `"b:9092, a:9092"` are the same stream.
    pub fn normalized(&self) -> Self {
        let mut servers: Vec<&str> = self
            .kafka
            .bootstrap_servers
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        servers.sort_unstable();
        servers.dedup();

        Self {
            source_type: self.source_type,
            kafka: KafkaSourceConfig {
                bootstrap_servers: servers.join(","),
                topic: self.kafka.topic.trim().to_string(),
            },
        }
    }

    pub fn same_as(&self, other: &Self) -> bool {
        self.normalized() == other.normalized()
    }

    pub fn validate(&self) -> Result<(), String> {
        let normalized = self.normalized();
        if normalized.kafka.bootstrap_servers.is_empty() {
            return Err("Source bootstrap servers cannot be empty".to_string());
        }
        if normalized.kafka.topic.is_empty() {
            return Err("Source topic cannot be empty".to_string());
        }
        Ok(())
    }
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}://{}/{}",
            self.source_type.as_str(),
            self.kafka.bootstrap_servers,
            self.kafka.topic
        )
    }
}
