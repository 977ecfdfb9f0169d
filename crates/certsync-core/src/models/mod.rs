//! Data models for certsync

mod assessment;
mod attachment;
mod certificate;
mod operation;
mod payload;

pub use assessment::{compute_overall_assessment, ClassificationCode, OverallAssessment};
pub use attachment::{
    collect_offline_keys, is_offline_key, new_offline_key, replace_reference, AttachmentKind,
    QueuedAttachment, OFFLINE_KEY_PREFIX,
};
pub use certificate::{
    CertificateData, CertificateId, CertificateSnapshot, SnapshotStatus, BOARDS_KEY, CIRCUITS_KEY,
    OBSERVATIONS_KEY,
};
pub(crate) use certificate::{is_collection_key, merge_fields};
pub use operation::{SyncOperation, SyncOperationKind, SyncQueueItem};
pub use payload::{
    BoardPayload, CircuitPayload, ObservationPayload, SyncPayload, SyncResponse, SyncStats,
};
