//! Deterministic job identities.
//!
//! The identity of a job is a content hash of its normalized source (and,
//! without consolidation, of the feature set it serves). The same source
//! always maps to the same identity, across restarts and field orderings.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{FeatureSetRef, Source};

/// Number of hex characters kept from the digest.
const IDENTITY_HASH_LEN: usize = 10;

#[derive(Serialize)]
struct IdentityInput<'a> {
    source: &'a Source,
    #[serde(skip_serializing_if = "Option::is_none")]
    feature_set: Option<String>,
}

fn hash_identity(source: &Source, feature_set: Option<&FeatureSetRef>) -> DomainResult<String> {
    let normalized = source.normalized();
    normalized.validate().map_err(DomainError::Identity)?;

    let input = IdentityInput {
        source: &normalized,
        feature_set: feature_set.map(ToString::to_string),
    };
    let encoded = serde_json::to_vec(&input).map_err(|e| DomainError::Identity(e.to_string()))?;
    let digest = format!("{:x}", Sha256::digest(&encoded));

    Ok(format!(
        "{}-{}",
        normalized.source_type.as_str(),
        &digest[..IDENTITY_HASH_LEN]
    ))
}

/// Identity of a job consolidating every feature set of `source`.
pub fn identity(source: &Source) -> DomainResult<String> {
    hash_identity(source, None)
}

/// Identity of a job dedicated to one feature set of `source`.
pub fn feature_set_identity(source: &Source, feature_set: &FeatureSetRef) -> DomainResult<String> {
    hash_identity(source, Some(feature_set))
}
