use certsync_core::db::LocalStore;

use crate::commands::common::parse_certificate_id;
use crate::error::CliError;

pub async fn run_discard(store: &LocalStore, id: &str) -> Result<(), CliError> {
    let id = parse_certificate_id(id)?;
    if !store.delete_local_certificate(&id).await? {
        return Err(CliError::CertificateNotFound(id.to_string()));
    }
    println!("Discarded local copy of {id}");
    Ok(())
}
