const BASE_DELAY: Duration = Duration::from_millis(500);
const MAX_RETRIES: u32 = 3;

use crate::metadata_store::{MetadataStore, StoreError, decode_documents};
use crate::types::{PolicyBundle, PolicyRef};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{RequestBuilder, Response, StatusCode, Url};
use serde::{Deserialize, Serialize};
use tokio::time::{Duration, sleep};

#[derive(Deserialize)]
struct PageMetadata {
    cursor: String,
    has_more: bool,
}

#[derive(Deserialize)]
struct PolicyPage {
    data: Vec<serde_json::Value>,
    metadata: PageMetadata,
}

#[derive(Serialize)]
struct PercentageUpdate {
    canary_percentage: u8,
    updated_at: DateTime<Utc>,
}

/// Metadata store behind the control plane's HTTP API.
pub struct ControlPlaneStore {
    client: reqwest::Client,
    policies_url: String,
    base_delay: Duration,
}

impl ControlPlaneStore {
    pub fn new(base_url: &str) -> Self {
        let policies_url = format!("{}/{}/", base_url.trim_end_matches('/'), "policies");

        ControlPlaneStore {
            client: reqwest::Client::new(),
            policies_url,
            base_delay: BASE_DELAY,
        }
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    fn policy_url(&self, reference: &PolicyRef) -> Result<Url, StoreError> {
        let mut url =
            Url::parse(&self.policies_url).map_err(|e| StoreError::InvalidUrl(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| StoreError::InvalidUrl(self.policies_url.clone()))?
            .pop_if_empty()
            .push(&reference.to_string());
        Ok(url)
    }

    /// Sends the request built by `build`, retrying on throttling and
    /// transient server errors with exponential backoff.
    async fn send(&self, build: impl Fn() -> RequestBuilder) -> Result<Response, StoreError> {
        const RETRIABLE_STATUS_CODES: &[StatusCode] = &[
            StatusCode::TOO_MANY_REQUESTS,     // 429
            StatusCode::INTERNAL_SERVER_ERROR, // 500
            StatusCode::BAD_GATEWAY,           // 502
            StatusCode::SERVICE_UNAVAILABLE,   // 503
            StatusCode::GATEWAY_TIMEOUT,       // 504
        ];

        let mut retries = 0;
        loop {
            let response = build().send().await?;
            let status = response.status();
            if !RETRIABLE_STATUS_CODES.contains(&status) {
                return Ok(response);
            }
            if retries >= MAX_RETRIES {
                tracing::warn!(%status, retries, "control plane retries exhausted");
                return Err(StoreError::RetriesExceeded);
            }
            sleep(self.base_delay * 2_u32.pow(retries)).await;
            retries += 1;
        }
    }
}

#[async_trait]
impl MetadataStore for ControlPlaneStore {
    async fn list_all(&self) -> Result<Vec<PolicyBundle>, StoreError> {
        let mut bundles = Vec::new();
        let mut cursor: Option<String> = None;
        let mut page_fetches = 0;

        loop {
            let mut url = Url::parse(&self.policies_url)
                .map_err(|e| StoreError::InvalidUrl(e.to_string()))?;
            if let Some(ref c) = cursor {
                url.query_pairs_mut().append_pair("cursor", c);
            }

            let response = self
                .send(|| self.client.get(url.clone()))
                .await?
                .error_for_status()?;
            let page = response.json::<PolicyPage>().await?;

            bundles.extend(decode_documents(page.data));
            page_fetches += 1;
            cursor = Some(page.metadata.cursor);

            if !page.metadata.has_more {
                break;
            }
        }

        tracing::debug!(page_fetches, documents = bundles.len(), "fetched policies");
        Ok(bundles)
    }

    async fn get(&self, reference: &PolicyRef) -> Result<PolicyBundle, StoreError> {
        let url = self.policy_url(reference)?;
        let response = self.send(|| self.client.get(url.clone())).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(StoreError::NotFound(reference.to_string()));
        }
        Ok(response.error_for_status()?.json::<PolicyBundle>().await?)
    }

    async fn update_canary_percentage(
        &self,
        reference: &PolicyRef,
        percentage: u8,
        updated_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let url = self.policy_url(reference)?;
        let body = PercentageUpdate {
            canary_percentage: percentage,
            updated_at,
        };
        let response = self
            .send(|| self.client.patch(url.clone()).json(&body))
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(StoreError::NotFound(reference.to_string())),
            StatusCode::METHOD_NOT_ALLOWED => Err(StoreError::Unsupported(self.kind())),
            _ => {
                response.error_for_status()?;
                Ok(())
            }
        }
    }

    fn kind(&self) -> &'static str {
        "control_plane"
    }
}
