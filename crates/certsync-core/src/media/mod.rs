//! Backend media signing client for certificate attachments.
//!
//! Uses backend-issued presigned operations to move photographs and
//! signatures in and out of object storage. [`OfflineUploader`] wraps it with
//! the offline queue fallback.

mod offline;

use std::time::Duration;

use reqwest::Method;
use serde::{Deserialize, Serialize};

use crate::models::{AttachmentKind, CertificateId};
use crate::sync::{error_from_response, SyncError, SyncResult};
use crate::util::normalize_base_url;

pub use offline::{FileUrl, OfflineUploader};

/// Result of an upload, identical whether it went online or into the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadedFile {
    /// Permanent object key, or an `offline:` reference while queued.
    pub key: String,
    pub size: u64,
    pub content_type: String,
}

/// One blob to upload.
#[derive(Debug, Clone, Copy)]
pub struct UploadRequest<'a> {
    pub certificate_id: &'a CertificateId,
    pub kind: AttachmentKind,
    pub filename: &'a str,
    pub content_type: &'a str,
    pub bytes: &'a [u8],
}

/// Network side of attachment handling.
#[allow(async_fn_in_trait)]
pub trait MediaTransport {
    async fn upload(&self, access_token: &str, request: UploadRequest<'_>)
        -> SyncResult<UploadedFile>;

    /// Short-lived URL for viewing a permanently stored object.
    async fn download_url(&self, access_token: &str, object_key: &str) -> SyncResult<String>;
}

/// HTTP client for managed media operations backed by the certsync API.
#[derive(Debug, Clone)]
pub struct MediaApiClient {
    base_url: String,
    client: reqwest::Client,
}

impl MediaApiClient {
    /// Builds a client for an explicit API base URL.
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

    /// Returns the base URL this client was configured with.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn execute(&self, operation: PresignedOperation, body: Option<Vec<u8>>) -> SyncResult<()> {
        let method = parse_method(&operation.method)?;
        let mut request = self.client.request(method, &operation.url);
        for (name, value) in operation.headers {
            if name.eq_ignore_ascii_case("host") {
                continue;
            }
            request = request.header(name, value);
        }
        if let Some(body) = body {
            request = request.body(body);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        Ok(())
    }
}

impl MediaTransport for MediaApiClient {
    async fn upload(
        &self,
        access_token: &str,
        request: UploadRequest<'_>,
    ) -> SyncResult<UploadedFile> {
        let response = self
            .client
            .post(format!("{}/v1/media/presign/upload", self.base_url))
            .bearer_auth(access_token)
            .header("Accept", "application/json")
            .json(&PresignUploadRequest {
                certificate_id: request.certificate_id.to_string(),
                kind: request.kind,
                filename: request.filename,
                content_type: request.content_type,
            })
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        let presigned = response.json::<PresignResponse>().await?;

        self.execute(presigned.operation, Some(request.bytes.to_vec()))
            .await?;

        tracing::debug!(
            "Uploaded {} ({} bytes) as {}",
            request.kind,
            request.bytes.len(),
            presigned.object_key
        );
        Ok(UploadedFile {
            key: presigned.object_key,
            size: request.bytes.len() as u64,
            content_type: request.content_type.to_string(),
        })
    }

    async fn download_url(&self, access_token: &str, object_key: &str) -> SyncResult<String> {
        let url = format!(
            "{}/v1/media/presign/download?objectKey={}",
            self.base_url,
            urlencoding::encode(object_key)
        );
        let response = self
            .client
            .get(url)
            .bearer_auth(access_token)
            .header("Accept", "application/json")
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        let presigned = response.json::<PresignResponse>().await?;
        Ok(presigned.operation.url)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PresignUploadRequest<'a> {
    certificate_id: String,
    kind: AttachmentKind,
    filename: &'a str,
    content_type: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PresignResponse {
    object_key: String,
    operation: PresignedOperation,
}

#[derive(Debug, Clone, Deserialize)]
struct PresignedOperation {
    method: String,
    url: String,
    #[serde(default)]
    headers: Vec<(String, String)>,
}

fn parse_method(raw: &str) -> SyncResult<Method> {
    Method::from_bytes(raw.as_bytes())
        .map_err(|error| SyncError::Server {
            status: 0,
            message: format!("Unsupported HTTP method: {error}"),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_rejects_invalid_base_url() {
        assert!(MediaApiClient::new("", Duration::from_secs(5)).is_err());
        assert!(MediaApiClient::new("example.com", Duration::from_secs(5)).is_err());
        let client = MediaApiClient::new("https://api.example.com/", Duration::from_secs(5)).unwrap();
        assert_eq!(client.base_url(), "https://api.example.com");
    }

    #[test]
    fn presign_response_parses_header_pairs() {
        let payload = r#"{
            "objectKey": "engineers/abc/certificates/1/photo/x.jpg",
            "operation": {"method": "PUT", "url": "https://r2/x", "headers": [["content-type", "image/jpeg"]]}
        }"#;
        let parsed: PresignResponse = serde_json::from_str(payload).unwrap();
        assert_eq!(parsed.operation.headers.len(), 1);
        assert_eq!(parse_method(&parsed.operation.method).unwrap(), Method::PUT);
    }

    #[tokio::test]
    async fn unreachable_api_is_a_connectivity_failure() {
        let client = MediaApiClient::new("http://127.0.0.1:9", Duration::from_secs(2)).unwrap();
        let id = CertificateId::new();
        let error = client
            .upload(
                "token",
                UploadRequest {
                    certificate_id: &id,
                    kind: AttachmentKind::Photo,
                    filename: "a.jpg",
                    content_type: "image/jpeg",
                    bytes: &[1, 2, 3],
                },
            )
            .await
            .unwrap_err();
        assert!(error.is_connectivity(), "{error}");
    }
}
