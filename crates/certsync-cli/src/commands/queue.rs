use certsync_core::db::LocalStore;

use crate::commands::common::format_queue_lines;
use crate::error::CliError;

pub async fn run_queue_list(store: &LocalStore, as_json: bool) -> Result<(), CliError> {
    let items = store.get_pending_syncs().await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&items)?);
    } else if items.is_empty() {
        println!("Sync queue is empty.");
    } else {
        for line in format_queue_lines(&items) {
            println!("{line}");
        }
    }
    Ok(())
}

pub async fn run_dead_letters(store: &LocalStore, as_json: bool) -> Result<(), CliError> {
    let items = store.dead_lettered_syncs().await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&items)?);
    } else if items.is_empty() {
        println!("No dead-lettered operations.");
    } else {
        for line in format_queue_lines(&items) {
            println!("{line}");
        }
    }
    Ok(())
}

pub async fn run_queue_retry(store: &LocalStore, seq: i64) -> Result<(), CliError> {
    if !store.requeue_sync(seq).await? {
        return Err(CliError::QueueItemNotFound(seq));
    }
    println!("Operation #{seq} requeued");
    Ok(())
}
