use certsync_core::db::LocalStore;

use crate::commands::common::{
    certificate_status_item, format_status_lines, CertificateStatusItem,
};
use crate::error::CliError;

pub async fn run_status(store: &LocalStore, as_json: bool) -> Result<(), CliError> {
    let items = collect_status(store).await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&items)?);
        return Ok(());
    }

    if items.is_empty() {
        println!("No certificates stored locally.");
        return Ok(());
    }
    for line in format_status_lines(&items) {
        println!("{line}");
    }

    let queued = store.attachments().queued_photo_count().await?;
    if queued > 0 {
        println!("{queued} attachment(s) waiting for upload");
    }
    Ok(())
}

pub async fn collect_status(store: &LocalStore) -> Result<Vec<CertificateStatusItem>, CliError> {
    let snapshots = store.list_local_certificates().await?;
    let queue = store.get_pending_syncs().await?;
    Ok(snapshots
        .iter()
        .map(|snapshot| certificate_status_item(snapshot, &queue))
        .collect())
}
