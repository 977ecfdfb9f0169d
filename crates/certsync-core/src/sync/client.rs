//! HTTP client for the certsync reconciliation API.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::models::{CertificateData, CertificateId, SyncOperation, SyncPayload, SyncResponse};
use crate::util::normalize_base_url;

use super::error::{error_from_response, SyncError, SyncResult};

/// Source of bearer tokens for API calls.
///
/// Token acquisition belongs to the identity provider integration; the sync
/// engine only asks for a currently valid token.
#[allow(async_fn_in_trait)]
pub trait TokenProvider {
    async fn access_token(&self) -> SyncResult<String>;
}

/// Fixed token, for the CLI and tests.
#[derive(Clone)]
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl fmt::Debug for StaticTokenProvider {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("StaticTokenProvider")
            .field("token", &"[REDACTED]")
            .finish()
    }
}

impl TokenProvider for StaticTokenProvider {
    async fn access_token(&self) -> SyncResult<String> {
        let token = self.token.trim();
        if token.is_empty() {
            return Err(SyncError::Unauthorized(
                "access token must not be empty".to_string(),
            ));
        }
        Ok(token.to_string())
    }
}

/// Server side of the drain.
#[allow(async_fn_in_trait)]
pub trait SyncTransport {
    /// Create the certificate or update its header fields.
    async fn ensure_certificate(
        &self,
        access_token: &str,
        id: &CertificateId,
        header: &CertificateData,
    ) -> SyncResult<()>;

    /// Bulk-reconcile the nested collections of one certificate.
    async fn push_snapshot(
        &self,
        access_token: &str,
        id: &CertificateId,
        payload: &SyncPayload,
    ) -> SyncResult<SyncResponse>;

    /// Apply one queued operation.
    async fn apply_operation(&self, access_token: &str, operation: &SyncOperation)
        -> SyncResult<()>;
}

#[derive(Debug, Clone)]
pub struct SyncApiClient {
    base_url: String,
    client: reqwest::Client,
}

impl SyncApiClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> SyncResult<Self> {
        let base_url =
            normalize_base_url(base_url.into().as_str()).map_err(SyncError::Configuration)?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| {
                SyncError::Configuration(format!("Failed to construct HTTP client: {error}"))
            })?;
        Ok(Self { base_url, client })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Unauthenticated endpoint used for connectivity probes.
    pub fn health_url(&self) -> String {
        format!("{}/healthz", self.base_url)
    }

    /// Underlying HTTP client, shared with connectivity probes.
    pub const fn http_client(&self) -> &reqwest::Client {
        &self.client
    }

    fn certificate_url(&self, id: &CertificateId, suffix: &str) -> String {
        format!("{}/v1/certificates/{id}{suffix}", self.base_url)
    }

    async fn send_json<T: Serialize + ?Sized>(
        &self,
        request: reqwest::RequestBuilder,
        access_token: &str,
        body: &T,
    ) -> SyncResult<reqwest::Response> {
        let response = request
            .bearer_auth(access_token)
            .header("Accept", "application/json")
            .json(body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        Ok(response)
    }
}

impl SyncTransport for SyncApiClient {
    async fn ensure_certificate(
        &self,
        access_token: &str,
        id: &CertificateId,
        header: &CertificateData,
    ) -> SyncResult<()> {
        let request = self.client.put(self.certificate_url(id, ""));
        self.send_json(request, access_token, header).await?;
        Ok(())
    }

    async fn push_snapshot(
        &self,
        access_token: &str,
        id: &CertificateId,
        payload: &SyncPayload,
    ) -> SyncResult<SyncResponse> {
        let request = self.client.put(self.certificate_url(id, "/sync"));
        let response = self.send_json(request, access_token, payload).await?;
        let body = response.json::<SyncResponse>().await?;
        tracing::info!(
            "Bulk sync of {id} acknowledged (request {}): {} boards, {} circuits, {} observations",
            body.request_id,
            body.stats.boards_upserted,
            body.stats.circuits_upserted,
            body.stats.observations_upserted
        );
        Ok(body)
    }

    async fn apply_operation(
        &self,
        access_token: &str,
        operation: &SyncOperation,
    ) -> SyncResult<()> {
        let request = self
            .client
            .post(self.certificate_url(&operation.certificate_id, "/operations"));
        self.send_json(request, access_token, operation).await?;
        Ok(())
    }
}
