//! Offline-aware upload wrapper.

use base64::prelude::{Engine as _, BASE64_STANDARD};

use crate::connectivity::ConnectivityMonitor;
use crate::db::AttachmentQueue;
use crate::models::{is_offline_key, AttachmentKind, CertificateId, QueuedAttachment};
use crate::sync::{SyncError, SyncResult, TokenProvider};

use super::{MediaTransport, UploadRequest, UploadedFile};

/// Where a stored reference can be viewed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileUrl {
    /// `data:` URI built from a queued blob; needs no network.
    Inline(String),
    /// Presigned URL of the permanently stored object.
    Remote(String),
}

impl FileUrl {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Inline(url) | Self::Remote(url) => url,
        }
    }
}

/// Uploads attachments, falling back to the offline queue when the network
/// is unavailable.
#[derive(Clone)]
pub struct OfflineUploader<M> {
    media: M,
    queue: AttachmentQueue,
    connectivity: ConnectivityMonitor,
}

impl<M: MediaTransport> OfflineUploader<M> {
    pub const fn new(media: M, queue: AttachmentQueue, connectivity: ConnectivityMonitor) -> Self {
        Self {
            media,
            queue,
            connectivity,
        }
    }

    /// Upload `bytes`, or queue them under a provisional reference when the
    /// failure is connectivity-related.
    ///
    /// Authorization, not-found and validation failures are returned as-is.
    pub async fn upload_file_offline<P: TokenProvider>(
        &self,
        bytes: Vec<u8>,
        filename: &str,
        content_type: Option<&str>,
        kind: AttachmentKind,
        certificate_id: &CertificateId,
        tokens: &P,
    ) -> SyncResult<UploadedFile> {
        let content_type = infer_content_type(content_type, filename);

        let attempt = async {
            let access_token = tokens.access_token().await?;
            self.media
                .upload(
                    &access_token,
                    UploadRequest {
                        certificate_id,
                        kind,
                        filename,
                        content_type: &content_type,
                        bytes: &bytes,
                    },
                )
                .await
        }
        .await;

        let error = match attempt {
            Ok(uploaded) => return Ok(uploaded),
            Err(error) => error,
        };
        if error.is_connectivity() {
            self.connectivity.set_online(false);
        }
        if !self.should_queue(&error) {
            return Err(error);
        }

        let record = QueuedAttachment::new(*certificate_id, kind, bytes, content_type, filename)?;
        self.queue.queue_photo(&record).await?;
        tracing::info!(
            "Upload of {kind} for certificate {certificate_id} deferred as {}: {error}",
            record.temp_key
        );

        Ok(UploadedFile {
            size: record.size(),
            key: record.temp_key,
            content_type: record.content_type,
        })
    }

    /// Resolve a stored reference to something viewable.
    ///
    /// Provisional references are served from the queue without touching the
    /// network.
    pub async fn get_file_url_offline<P: TokenProvider>(
        &self,
        key: &str,
        tokens: &P,
    ) -> SyncResult<FileUrl> {
        if is_offline_key(key) {
            let record = self
                .queue
                .get_queued_photo_by_key(key)
                .await?
                .ok_or_else(|| SyncError::NotFound(format!("queued attachment {key}")))?;
            return Ok(FileUrl::Inline(data_uri(&record.content_type, &record.bytes)));
        }

        let access_token = tokens.access_token().await?;
        let url = self.media.download_url(&access_token, key).await?;
        Ok(FileUrl::Remote(url))
    }

    fn should_queue(&self, error: &SyncError) -> bool {
        if error.is_connectivity() {
            return true;
        }
        !self.connectivity.is_online()
            && !error.is_permanent()
            && !matches!(error, SyncError::Cancelled | SyncError::Store(_))
    }
}

/// Content type from the caller, or guessed from the file extension.
pub(crate) fn infer_content_type(content_type: Option<&str>, filename: &str) -> String {
    content_type
        .map(str::trim)
        .filter(|value| !value.is_empty() && *value != "application/octet-stream")
        .map_or_else(
            || {
                mime_guess::from_path(filename)
                    .first_or_octet_stream()
                    .essence_str()
                    .to_string()
            },
            ToString::to_string,
        )
}

fn data_uri(content_type: &str, bytes: &[u8]) -> String {
    let encoded = BASE64_STANDARD.encode(bytes);
    format!("data:{content_type};base64,{encoded}")
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::db::LocalStore;
    use crate::sync::StaticTokenProvider;

    #[derive(Clone, Default)]
    struct FakeMedia {
        failure: Arc<Mutex<Option<SyncError>>>,
        download_calls: Arc<AtomicUsize>,
    }

    impl FakeMedia {
        fn failing(error: SyncError) -> Self {
            let media = Self::default();
            *media.failure.lock().unwrap() = Some(error);
            media
        }
    }

    impl MediaTransport for FakeMedia {
        async fn upload(
            &self,
            _access_token: &str,
            request: UploadRequest<'_>,
        ) -> SyncResult<UploadedFile> {
            if let Some(error) = self.failure.lock().unwrap().take() {
                return Err(error);
            }
            Ok(UploadedFile {
                key: format!("engineers/e1/{}/{}", request.kind, request.filename),
                size: request.bytes.len() as u64,
                content_type: request.content_type.to_string(),
            })
        }

        async fn download_url(&self, _access_token: &str, object_key: &str) -> SyncResult<String> {
            self.download_calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("https://r2.example.com/{object_key}?sig=1"))
        }
    }

    async fn uploader(media: FakeMedia, online: bool) -> (OfflineUploader<FakeMedia>, LocalStore) {
        let store = LocalStore::open_in_memory().await.unwrap();
        let uploader =
            OfflineUploader::new(media, store.attachments(), ConnectivityMonitor::new(online));
        (uploader, store)
    }

    #[tokio::test]
    async fn online_upload_returns_permanent_key() {
        let (uploader, store) = uploader(FakeMedia::default(), true).await;
        let tokens = StaticTokenProvider::new("token");

        let uploaded = uploader
            .upload_file_offline(
                vec![1, 2, 3],
                "board.jpg",
                None,
                AttachmentKind::Photo,
                &CertificateId::new(),
                &tokens,
            )
            .await
            .unwrap();
        assert_eq!(uploaded.key, "engineers/e1/photo/board.jpg");
        assert_eq!(uploaded.content_type, "image/jpeg");
        assert_eq!(store.attachments().queued_photo_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn offline_signature_is_previewable_without_network() {
        let media = FakeMedia::failing(SyncError::Offline("no route to host".to_string()));
        let (uploader, _store) = uploader(media.clone(), true).await;
        let tokens = StaticTokenProvider::new("token");

        let uploaded = uploader
            .upload_file_offline(
                vec![0x89, b'P', b'N', b'G'],
                "signature.png",
                Some("image/png"),
                AttachmentKind::Signature,
                &CertificateId::new(),
                &tokens,
            )
            .await
            .unwrap();
        assert!(is_offline_key(&uploaded.key));
        assert_eq!(uploaded.size, 4);
        assert_eq!(uploaded.content_type, "image/png");
        assert!(!uploader.connectivity.is_online());

        let url = uploader
            .get_file_url_offline(&uploaded.key, &tokens)
            .await
            .unwrap();
        assert_eq!(url, FileUrl::Inline("data:image/png;base64,iVBORw==".to_string()));
        assert_eq!(media.download_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn permanent_failures_are_never_queued() {
        let media = FakeMedia::failing(SyncError::Unauthorized("expired".to_string()));
        let (uploader, store) = uploader(media, false).await;

        let error = uploader
            .upload_file_offline(
                vec![1],
                "a.jpg",
                None,
                AttachmentKind::Photo,
                &CertificateId::new(),
                &StaticTokenProvider::new("token"),
            )
            .await
            .unwrap_err();
        assert!(matches!(error, SyncError::Unauthorized(_)));
        assert_eq!(store.attachments().queued_photo_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn transient_failure_while_offline_is_queued() {
        let media = FakeMedia::failing(SyncError::Server {
            status: 502,
            message: "bad gateway".to_string(),
        });
        let (uploader, store) = uploader(media, false).await;

        let uploaded = uploader
            .upload_file_offline(
                vec![1],
                "a.jpg",
                None,
                AttachmentKind::Photo,
                &CertificateId::new(),
                &StaticTokenProvider::new("token"),
            )
            .await
            .unwrap();
        assert!(is_offline_key(&uploaded.key));
        assert_eq!(store.attachments().queued_photo_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn transient_failure_while_online_is_returned() {
        let media = FakeMedia::failing(SyncError::Server {
            status: 500,
            message: "boom".to_string(),
        });
        let (uploader, _store) = uploader(media, true).await;

        let error = uploader
            .upload_file_offline(
                vec![1],
                "a.jpg",
                None,
                AttachmentKind::Photo,
                &CertificateId::new(),
                &StaticTokenProvider::new("token"),
            )
            .await
            .unwrap_err();
        assert!(matches!(error, SyncError::Server { status: 500, .. }));
    }

    #[tokio::test]
    async fn permanent_keys_resolve_through_presign() {
        let media = FakeMedia::default();
        let (uploader, _store) = uploader(media.clone(), true).await;

        let url = uploader
            .get_file_url_offline("engineers/e1/photo/a.jpg", &StaticTokenProvider::new("t"))
            .await
            .unwrap();
        assert!(matches!(url, FileUrl::Remote(_)));
        assert_eq!(media.download_calls.load(Ordering::SeqCst), 1);

        assert!(matches!(
            uploader
                .get_file_url_offline("offline:missing", &StaticTokenProvider::new("t"))
                .await,
            Err(SyncError::NotFound(_))
        ));
    }

    #[test]
    fn content_type_falls_back_to_extension() {
        assert_eq!(infer_content_type(None, "a.png"), "image/png");
        assert_eq!(infer_content_type(Some("application/octet-stream"), "a.jpg"), "image/jpeg");
        assert_eq!(infer_content_type(Some(" image/webp "), "a.bin"), "image/webp");
        assert_eq!(infer_content_type(None, "blob"), "application/octet-stream");
    }
}
