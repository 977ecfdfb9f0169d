use std::time::Duration;

use aws_credential_types::Credentials;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::Client;
use aws_types::region::Region;
use certsync_core::models::AttachmentKind;
use certsync_core::CertificateId;
use serde::Serialize;

use crate::config::{AppConfig, R2RuntimeConfig};
use crate::error::AppError;

const MAX_FILENAME_LEN: usize = 96;

#[derive(Debug, Clone, Serialize)]
pub struct PresignedOperation {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
}

#[derive(Clone)]
pub struct R2PresignService {
    bucket: String,
    ttl: Duration,
    client: Client,
}

impl R2PresignService {
    pub fn from_config(config: &AppConfig) -> Option<Self> {
        config
            .r2
            .clone()
            .map(|r2| Self::new(r2, config.media_url_ttl))
    }

    pub fn new(config: R2RuntimeConfig, ttl: Duration) -> Self {
        let credentials = Credentials::new(
            config.access_key_id,
            config.secret_access_key,
            None,
            None,
            "certsync-api-r2",
        );

        let endpoint = format!("https://{}.r2.cloudflarestorage.com", config.account_id);
        let shared_config = aws_sdk_s3::Config::builder()
            .region(Region::new("auto"))
            .endpoint_url(endpoint)
            .credentials_provider(credentials)
            .force_path_style(true)
            .build();

        Self {
            bucket: config.bucket,
            ttl,
            client: Client::from_conf(shared_config),
        }
    }

    pub async fn presign_upload(
        &self,
        object_key: &str,
        content_type: Option<&str>,
    ) -> Result<PresignedOperation, AppError> {
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(object_key);
        if let Some(content_type) = content_type.map(str::trim).filter(|value| !value.is_empty()) {
            request = request.content_type(content_type);
        }
        let operation = request
            .presigned(presign_config(self.ttl)?)
            .await
            .map_err(|error| {
                AppError::external(format!(
                    "Failed to presign upload URL: {}",
                    sanitize(&error)
                ))
            })?;
        Ok(map_presigned(
            operation.method().to_string(),
            operation.uri().to_string(),
            operation.headers(),
        ))
    }

    pub async fn presign_download(&self, object_key: &str) -> Result<PresignedOperation, AppError> {
        let operation = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(object_key)
            .presigned(presign_config(self.ttl)?)
            .await
            .map_err(|error| {
                AppError::external(format!(
                    "Failed to presign download URL: {}",
                    sanitize(&error)
                ))
            })?;
        Ok(map_presigned(
            operation.method().to_string(),
            operation.uri().to_string(),
            operation.headers(),
        ))
    }
}

/// Prefix every object of one engineer lives under.
pub fn engineer_prefix(engineer_id: &str) -> String {
    format!("engineers/{engineer_id}/")
}

/// Server-chosen object key for a new attachment.
pub fn attachment_object_key(
    engineer_id: &str,
    certificate_id: &CertificateId,
    kind: AttachmentKind,
    filename: &str,
) -> String {
    format!(
        "{}certificates/{certificate_id}/{kind}/{}-{}",
        engineer_prefix(engineer_id),
        uuid::Uuid::now_v7(),
        sanitize_filename(filename)
    )
}

/// Validate a client-supplied key and confirm it belongs to `engineer_id`.
pub fn owned_object_key(engineer_id: &str, raw: &str) -> Result<String, AppError> {
    let key = raw.trim().trim_start_matches('/').to_string();
    if key.is_empty() {
        return Err(AppError::bad_request("objectKey is required"));
    }
    if key.contains("..") {
        return Err(AppError::bad_request(
            "objectKey must not contain path traversal segments",
        ));
    }
    if !key.starts_with(&engineer_prefix(engineer_id)) {
        return Err(AppError::not_found("object"));
    }
    Ok(key)
}

fn sanitize_filename(raw: &str) -> String {
    let name = raw.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = name
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '-' | '_') {
                ch
            } else {
                '_'
            }
        })
        .take(MAX_FILENAME_LEN)
        .collect();
    let cleaned = cleaned.trim_matches('.');
    if cleaned.is_empty() {
        "file".to_string()
    } else {
        cleaned.to_string()
    }
}

fn map_presigned<'a>(
    method: String,
    url: String,
    headers: impl Iterator<Item = (&'a str, &'a str)>,
) -> PresignedOperation {
    let headers = headers
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect();
    PresignedOperation {
        method,
        url,
        headers,
    }
}

fn presign_config(ttl: Duration) -> Result<PresigningConfig, AppError> {
    PresigningConfig::expires_in(ttl)
        .map_err(|error| AppError::internal(format!("Invalid presign TTL: {}", sanitize(&error))))
}

fn sanitize(error: &impl std::fmt::Display) -> String {
    error.to_string().replace('\n', " ").trim().to_string()
}
