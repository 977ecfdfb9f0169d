//! Queue drain.
//!
//! Walks every dirty certificate: pushes its header, uploads the attachments
//! its data still references provisionally, and then either pushes the whole
//! snapshot (when a full-sync item is queued) or replays the queued
//! operations in FIFO order.
//! A queue item is only removed after the server confirmed it.

use std::collections::BTreeSet;
use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::connectivity::ConnectivityMonitor;
use crate::db::LocalStore;
use crate::media::{MediaTransport, UploadRequest};
use crate::models::{
    collect_offline_keys, CertificateSnapshot, SyncOperation, SyncOperationKind, SyncPayload,
    SyncQueueItem, SyncStats,
};
use crate::util::now_millis;

use super::client::{SyncTransport, TokenProvider};
use super::error::{SyncError, SyncResult};

/// Backoff applied to retryable failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts before an item is dead-lettered.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(900),
        }
    }
}

impl RetryPolicy {
    /// Retry on the very next drain.
    pub const fn immediate() -> Self {
        Self {
            max_attempts: 8,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before the next attempt after `retries` failures.
    pub fn delay_for(&self, retries: u32) -> Duration {
        let exponent = retries.saturating_sub(1).min(20);
        self.base_delay
            .saturating_mul(1 << exponent)
            .min(self.max_delay)
    }
}

/// Outcome of one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DrainReport {
    /// Certificates left clean by this pass.
    pub certificates_synced: u32,
    pub operations_applied: u32,
    pub bulk_pushes: u32,
    pub attachments_uploaded: u32,
    pub retries_scheduled: u32,
    /// Sequence numbers dead-lettered during this pass.
    pub dead_lettered: Vec<i64>,
    /// Certificates skipped because their next item is backing off.
    pub deferred: u32,
    /// Certificates whose queue holds only dead-lettered items.
    pub blocked: u32,
    /// The pass stopped early because the network went away.
    pub stopped_offline: bool,
    pub stats: SyncStats,
}

impl DrainReport {
    fn add_stats(&mut self, stats: SyncStats) {
        self.stats.boards_upserted += stats.boards_upserted;
        self.stats.circuits_upserted += stats.circuits_upserted;
        self.stats.observations_upserted += stats.observations_upserted;
    }
}

/// What a failed attempt did to its queue item.
enum Disposition {
    DeadLettered,
    Retrying,
    Offline,
}

enum Flow {
    NextCertificate,
    StopOffline,
}

/// Drives the local queue into the certsync API.
pub struct SyncDrain<T, M, P> {
    store: LocalStore,
    transport: T,
    media: M,
    tokens: P,
    policy: RetryPolicy,
}

impl<T, M, P> SyncDrain<T, M, P>
where
    T: SyncTransport,
    M: MediaTransport,
    P: TokenProvider,
{
    pub fn new(store: LocalStore, transport: T, media: M, tokens: P) -> Self {
        Self {
            store,
            transport,
            media,
            tokens,
            policy: RetryPolicy::default(),
        }
    }

    #[must_use]
    pub const fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub const fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Run one pass over every dirty certificate.
    ///
    /// Authorization failures abort the pass; the affected items keep their
    /// retry counts. Cancelling `cancel` interrupts the in-flight request and
    /// leaves the queue exactly as it was before that request.
    pub async fn drain(&self, cancel: &CancellationToken) -> SyncResult<DrainReport> {
        let mut report = DrainReport::default();
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        let dirty = self.store.get_dirty_certificates().await?;
        if dirty.is_empty() {
            tracing::debug!("Sync drain found nothing to do");
            return Ok(report);
        }
        let access_token = self.tokens.access_token().await?;

        for snapshot in dirty {
            let flow = self
                .drain_certificate(&access_token, snapshot, cancel, &mut report)
                .await?;
            if matches!(flow, Flow::StopOffline) {
                report.stopped_offline = true;
                break;
            }
        }

        tracing::info!(
            "Sync drain finished: {} synced, {} operations, {} bulk pushes, {} retries, {} dead-lettered",
            report.certificates_synced,
            report.operations_applied,
            report.bulk_pushes,
            report.retries_scheduled,
            report.dead_lettered.len()
        );
        Ok(report)
    }

    /// Drain now if online, then again after every offline to online
    /// transition, until `cancel` fires.
    ///
    /// Only authorization failures end the loop with an error; anything else
    /// is logged and waits for the next reconnect.
    pub async fn drain_on_reconnect(
        &self,
        connectivity: &ConnectivityMonitor,
        cancel: &CancellationToken,
    ) -> SyncResult<()> {
        let mut receiver = connectivity.subscribe();
        let mut online = *receiver.borrow_and_update();
        if online {
            self.drain_and_log(connectivity, cancel).await?;
        }

        loop {
            tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                changed = receiver.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                    let now_online = *receiver.borrow_and_update();
                    let reconnected = now_online && !online;
                    online = now_online;
                    if reconnected {
                        self.drain_and_log(connectivity, cancel).await?;
                    }
                }
            }
        }
    }

    async fn drain_and_log(
        &self,
        connectivity: &ConnectivityMonitor,
        cancel: &CancellationToken,
    ) -> SyncResult<()> {
        match self.drain(cancel).await {
            Ok(report) => {
                if report.stopped_offline {
                    connectivity.set_online(false);
                }
                Ok(())
            }
            Err(SyncError::Cancelled) => Ok(()),
            Err(error @ SyncError::Unauthorized(_)) => Err(error),
            Err(error) => {
                tracing::error!("Sync drain failed: {error}");
                Ok(())
            }
        }
    }

    async fn drain_certificate(
        &self,
        access_token: &str,
        snapshot: CertificateSnapshot,
        cancel: &CancellationToken,
        report: &mut DrainReport,
    ) -> SyncResult<Flow> {
        let id = snapshot.id;
        let mut items = self.store.pending_syncs_for(&id).await?;
        if items.is_empty() {
            // Dirty without queued work: reconcile the whole snapshot.
            self.store.queue_sync(&SyncOperation::full_sync(id)).await?;
            items = self.store.pending_syncs_for(&id).await?;
        }

        let Some(gate) = gate_item(&items) else {
            tracing::debug!("Certificate {id} only has dead-lettered items");
            report.blocked += 1;
            return Ok(Flow::NextCertificate);
        };
        if !gate.is_due(now_millis()) {
            report.deferred += 1;
            return Ok(Flow::NextCertificate);
        }
        let gate_seq = gate.seq;

        // The server must know the certificate before it signs uploads for it.
        if let Err(error) = self.ensure_header(access_token, &snapshot, cancel).await {
            return self.stop_certificate(gate_seq, error, report).await;
        }

        let uploaded = match self
            .upload_attachments(access_token, &snapshot, &items, cancel, report)
            .await
        {
            Ok(uploaded) => uploaded,
            Err(error) => return self.stop_certificate(gate_seq, error, report).await,
        };

        let Some(snapshot) = self.store.get_certificate(&id).await? else {
            return Ok(Flow::NextCertificate);
        };
        let items = self.store.pending_syncs_for(&id).await?;
        let observed = snapshot.last_modified;

        if uploaded > 0 {
            if let Err(error) = self.ensure_header(access_token, &snapshot, cancel).await {
                return self.stop_certificate(gate_seq, error, report).await;
            }
        }

        let live: Vec<&SyncQueueItem> = items.iter().filter(|item| !item.dead_lettered).collect();
        if let Some(full_sync) = live
            .iter()
            .find(|item| item.operation.kind == SyncOperationKind::FullSync)
        {
            let superseded = items.iter().map(|item| item.seq).max().unwrap_or(full_sync.seq);
            if let Err(error) = self
                .push_snapshot(access_token, &snapshot, superseded, cancel, report)
                .await
            {
                return self.stop_certificate(full_sync.seq, error, report).await;
            }
        } else {
            let now = now_millis();
            for item in live {
                if !item.is_due(now) {
                    report.deferred += 1;
                    return Ok(Flow::NextCertificate);
                }
                let applied = guarded(
                    cancel,
                    self.transport.apply_operation(access_token, &item.operation),
                )
                .await;
                match applied {
                    Ok(()) => {
                        self.store.remove_sync_item(item.seq).await?;
                        report.operations_applied += 1;
                    }
                    Err(error) => match self.handle_failure(item.seq, error, report).await? {
                        Disposition::DeadLettered => {}
                        Disposition::Retrying => return Ok(Flow::NextCertificate),
                        Disposition::Offline => return Ok(Flow::StopOffline),
                    },
                }
            }
        }

        if self.store.pending_syncs_for(&id).await?.is_empty()
            && self.store.mark_synced_if_unmodified(&id, observed).await?
        {
            report.certificates_synced += 1;
        }
        Ok(Flow::NextCertificate)
    }

    async fn push_snapshot(
        &self,
        access_token: &str,
        snapshot: &CertificateSnapshot,
        superseded: i64,
        cancel: &CancellationToken,
        report: &mut DrainReport,
    ) -> SyncResult<()> {
        let payload = SyncPayload::from_snapshot(snapshot)
            .map_err(|error| SyncError::Validation(error.to_string()))?;
        let response = guarded(
            cancel,
            self.transport
                .push_snapshot(access_token, &snapshot.id, &payload),
        )
        .await?;

        let removed = self
            .store
            .remove_syncs_through(&snapshot.id, superseded)
            .await?;
        tracing::debug!(
            "Bulk sync of {} superseded {removed} queued items",
            snapshot.id
        );
        report.bulk_pushes += 1;
        report.add_stats(response.stats);
        Ok(())
    }

    /// Create or refresh the server-side header, leaving out fields that
    /// still point at provisional attachments.
    async fn ensure_header(
        &self,
        access_token: &str,
        snapshot: &CertificateSnapshot,
        cancel: &CancellationToken,
    ) -> SyncResult<()> {
        let mut header = snapshot.header_fields();
        header.retain(|_, value| {
            let mut keys = BTreeSet::new();
            collect_offline_keys(value, &mut keys);
            keys.is_empty()
        });
        guarded(
            cancel,
            self.transport
                .ensure_certificate(access_token, &snapshot.id, &header),
        )
        .await
    }

    /// Upload queued blobs still referenced by the snapshot or a live item.
    /// Returns how many were uploaded.
    async fn upload_attachments(
        &self,
        access_token: &str,
        snapshot: &CertificateSnapshot,
        items: &[SyncQueueItem],
        cancel: &CancellationToken,
        report: &mut DrainReport,
    ) -> SyncResult<u32> {
        let keys = referenced_offline_keys(snapshot, items);
        let mut uploaded_count = 0;
        if keys.is_empty() {
            return Ok(uploaded_count);
        }

        let queue = self.store.attachments();
        for temp_key in keys {
            let record = queue.get_queued_photo_by_key(&temp_key).await?.ok_or_else(|| {
                SyncError::Validation(format!(
                    "attachment {temp_key} is referenced but no longer queued"
                ))
            })?;
            let uploaded = guarded(
                cancel,
                self.media.upload(
                    access_token,
                    UploadRequest {
                        certificate_id: &snapshot.id,
                        kind: record.kind,
                        filename: &record.filename,
                        content_type: &record.content_type,
                        bytes: &record.bytes,
                    },
                ),
            )
            .await?;
            self.store
                .apply_permanent_reference(&snapshot.id, &temp_key, &uploaded.key)
                .await?;
            report.attachments_uploaded += 1;
            uploaded_count += 1;
        }
        Ok(uploaded_count)
    }

    /// Charge a failure to `seq` and give up on this certificate for now.
    async fn stop_certificate(
        &self,
        seq: i64,
        error: SyncError,
        report: &mut DrainReport,
    ) -> SyncResult<Flow> {
        match self.handle_failure(seq, error, report).await? {
            Disposition::Offline => Ok(Flow::StopOffline),
            Disposition::DeadLettered | Disposition::Retrying => Ok(Flow::NextCertificate),
        }
    }

    async fn handle_failure(
        &self,
        seq: i64,
        error: SyncError,
        report: &mut DrainReport,
    ) -> SyncResult<Disposition> {
        match error {
            SyncError::Cancelled
            | SyncError::Unauthorized(_)
            | SyncError::Configuration(_)
            | SyncError::Store(_) => Err(error),
            error if error.is_retryable() => {
                let message = error.to_string();
                let retries = self.store.increment_retry(seq).await?;
                if retries >= self.policy.max_attempts {
                    self.store.dead_letter(seq, &message).await?;
                    report.dead_lettered.push(seq);
                } else {
                    let delay = self.retry_delay(retries, &error);
                    let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
                    self.store
                        .schedule_retry(seq, now_millis().saturating_add(delay_ms), &message)
                        .await?;
                    report.retries_scheduled += 1;
                    tracing::warn!(
                        "Sync item {seq} failed (attempt {retries}), retrying in {}s: {message}",
                        delay.as_secs()
                    );
                }
                if error.is_connectivity() {
                    Ok(Disposition::Offline)
                } else {
                    Ok(Disposition::Retrying)
                }
            }
            error => {
                self.store.dead_letter(seq, &error.to_string()).await?;
                report.dead_lettered.push(seq);
                Ok(Disposition::DeadLettered)
            }
        }
    }

    fn retry_delay(&self, retries: u32, error: &SyncError) -> Duration {
        let delay = self.policy.delay_for(retries);
        match error {
            SyncError::RateLimited {
                retry_after_secs: Some(secs),
            } => delay.max(Duration::from_secs(*secs)),
            _ => delay,
        }
    }
}

/// The item whose backoff gates the certificate: a live full-sync item when
/// one is queued, otherwise the oldest live item.
fn gate_item(items: &[SyncQueueItem]) -> Option<&SyncQueueItem> {
    let mut live = items.iter().filter(|item| !item.dead_lettered);
    let head = live.clone().next()?;
    Some(
        live.find(|item| item.operation.kind == SyncOperationKind::FullSync)
            .unwrap_or(head),
    )
}

fn referenced_offline_keys(
    snapshot: &CertificateSnapshot,
    items: &[SyncQueueItem],
) -> BTreeSet<String> {
    let mut keys = BTreeSet::new();
    for value in snapshot.data.values() {
        collect_offline_keys(value, &mut keys);
    }
    for item in items.iter().filter(|item| !item.dead_lettered) {
        for value in item.operation.payload.values() {
            collect_offline_keys(value, &mut keys);
        }
    }
    keys
}

async fn guarded<F, R>(cancel: &CancellationToken, future: F) -> SyncResult<R>
where
    F: Future<Output = SyncResult<R>>,
{
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(SyncError::Cancelled),
        result = future => result,
    }
}
