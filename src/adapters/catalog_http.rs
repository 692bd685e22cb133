//! HTTP client for the catalog REST API.
//!
//! Maps non-2xx responses onto domain errors: 404 on a feature-set route is
//! `FeatureSetNotFound`, 409 is `ConcurrencyConflict`, anything else is a
//! transient `Catalog` error.

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode, Url};
use serde::Serialize;
use std::time::Duration;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{CatalogConfig, FeatureSet, FeatureSetRef, FeatureSetStatus, Store};
use crate::domain::ports::{Catalog, FeatureSetFilter};

#[derive(Serialize)]
struct StatusUpdateRequest {
    version: u64,
    status: FeatureSetStatus,
}

#[derive(Serialize)]
struct PublicationRequest<'a> {
    expected_version: u64,
    digest: &'a str,
}

#[derive(Debug, Clone)]
pub struct HttpCatalogClient {
    http: Client,
    base_url: Url,
}

impl HttpCatalogClient {
    pub fn new(config: &CatalogConfig) -> DomainResult<Self> {
        let base_url = Url::parse(&config.url)
            .map_err(|e| DomainError::ValidationFailed(format!("invalid catalog url '{}': {e}", config.url)))?;
        if base_url.cannot_be_a_base() {
            return Err(DomainError::ValidationFailed(format!(
                "catalog url '{}' cannot be a base",
                config.url
            )));
        }
        let http = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .user_agent(concat!("sluice/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| DomainError::Catalog(format!("failed to build http client: {e}")))?;
        Ok(Self { http, base_url })
    }

    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn feature_set_url(&self, reference: &FeatureSetRef, rest: &[&str]) -> Url {
        let mut segments = vec![
            "api",
            "v1",
            "feature-sets",
            reference.project.as_str(),
            reference.name.as_str(),
        ];
        segments.extend_from_slice(rest);
        self.url(&segments)
    }

    /// Pass 2xx responses through, map everything else.
    async fn checked(response: Response, reference: Option<&FeatureSetRef>) -> DomainResult<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(match (status, reference) {
            (StatusCode::NOT_FOUND, Some(reference)) => {
                DomainError::FeatureSetNotFound(reference.to_string())
            }
            (StatusCode::CONFLICT, Some(reference)) => DomainError::ConcurrencyConflict {
                entity: "feature_set".to_string(),
                id: reference.to_string(),
            },
            _ => DomainError::Catalog(format!("catalog returned {status}: {body}")),
        })
    }
}

#[async_trait]
impl Catalog for HttpCatalogClient {
    async fn list_feature_sets(&self, filter: &FeatureSetFilter) -> DomainResult<Vec<FeatureSet>> {
        let response = self
            .http
            .get(self.url(&["api", "v1", "feature-sets"]))
            .query(&[("project", &filter.project), ("name", &filter.name)])
            .send()
            .await?;
        Ok(Self::checked(response, None).await?.json().await?)
    }

    async fn get_feature_set(&self, reference: &FeatureSetRef) -> DomainResult<Option<FeatureSet>> {
        let response = self
            .http
            .get(self.feature_set_url(reference, &[]))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(Self::checked(response, Some(reference)).await?.json().await?))
    }

    async fn list_stores(&self) -> DomainResult<Vec<Store>> {
        let response = self
            .http
            .get(self.url(&["api", "v1", "stores"]))
            .send()
            .await?;
        Ok(Self::checked(response, None).await?.json().await?)
    }

    async fn update_feature_set_status(
        &self,
        reference: &FeatureSetRef,
        version: u64,
        status: FeatureSetStatus,
    ) -> DomainResult<()> {
        let response = self
            .http
            .put(self.feature_set_url(reference, &["status"]))
            .json(&StatusUpdateRequest { version, status })
            .send()
            .await?;
        Self::checked(response, Some(reference)).await?;
        Ok(())
    }

    async fn begin_publication(
        &self,
        reference: &FeatureSetRef,
        expected_version: u64,
        digest: &str,
    ) -> DomainResult<FeatureSet> {
        let response = self
            .http
            .post(self.feature_set_url(reference, &["publications"]))
            .json(&PublicationRequest {
                expected_version,
                digest,
            })
            .send()
            .await?;
        Ok(Self::checked(response, Some(reference)).await?.json().await?)
    }

    async fn complete_publication(&self, reference: &FeatureSetRef, version: u64) -> DomainResult<()> {
        let version = version.to_string();
        let response = self
            .http
            .post(self.feature_set_url(reference, &["publications", version.as_str(), "complete"]))
            .send()
            .await?;
        Self::checked(response, Some(reference)).await?;
        Ok(())
    }
}
