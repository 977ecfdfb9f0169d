use std::time::Duration;

use certsync_core::config::ClientConfig;
use certsync_core::connectivity::ConnectivityMonitor;
use certsync_core::db::LocalStore;
use certsync_core::sync::{DrainReport, SyncApiClient, SyncError};
use tokio_util::sync::CancellationToken;

use crate::commands::common::build_drain;
use crate::error::CliError;

pub async fn run_drain(
    store: &LocalStore,
    config: &ClientConfig,
    as_json: bool,
) -> Result<(), CliError> {
    let drain = build_drain(store, config)?;
    let cancel = CancellationToken::new();
    let interrupt = async {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
        std::future::pending::<()>().await;
    };
    let result = tokio::select! {
        result = drain.drain(&cancel) => result,
        () = interrupt => return Ok(()),
    };
    let report = match result {
        Ok(report) => report,
        Err(SyncError::Cancelled) => {
            println!("Drain interrupted; unfinished operations stay queued");
            return Ok(());
        }
        Err(error) => return Err(error.into()),
    };

    if as_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for line in format_report(&report) {
            println!("{line}");
        }
    }
    Ok(())
}

/// Probe the API every `probe_interval` seconds and drain on each reconnect.
pub async fn run_watch(
    store: &LocalStore,
    config: &ClientConfig,
    probe_interval: u64,
) -> Result<(), CliError> {
    let drain = build_drain(store, config)?;
    let probe = SyncApiClient::new(config.require_api_base_url()?, config.http_timeout)?;
    let interval = Duration::from_secs(probe_interval.max(1));
    let monitor = ConnectivityMonitor::new(false);
    let cancel = CancellationToken::new();

    let probe_loop = async {
        let health_url = probe.health_url();
        while !cancel.is_cancelled() {
            monitor.probe(probe.http_client(), &health_url).await;
            tokio::select! {
                () = cancel.cancelled() => {}
                () = tokio::time::sleep(interval) => {}
            }
        }
        std::future::pending::<()>().await;
    };
    let shutdown = async {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Stopping watch");
        }
        cancel.cancel();
        std::future::pending::<()>().await;
    };

    println!(
        "Watching {} (probe every {}s, Ctrl-C to stop)",
        probe.base_url(),
        interval.as_secs()
    );
    // Only the drain ends the select, so it always unwinds through `cancel`.
    tokio::select! {
        result = drain.drain_on_reconnect(&monitor, &cancel) => result?,
        () = probe_loop => {}
        () = shutdown => {}
    }
    Ok(())
}

pub fn format_report(report: &DrainReport) -> Vec<String> {
    let mut lines = vec![format!(
        "Synced {} certificate(s): {} operation(s) applied, {} bulk push(es), {} attachment(s) uploaded",
        report.certificates_synced,
        report.operations_applied,
        report.bulk_pushes,
        report.attachments_uploaded
    )];
    if report.bulk_pushes > 0 {
        lines.push(format!(
            "Server upserted {} board(s), {} circuit(s), {} observation(s)",
            report.stats.boards_upserted,
            report.stats.circuits_upserted,
            report.stats.observations_upserted
        ));
    }
    if report.retries_scheduled > 0 || report.deferred > 0 {
        lines.push(format!(
            "{} retry(ies) scheduled, {} certificate(s) waiting on backoff",
            report.retries_scheduled, report.deferred
        ));
    }
    if !report.dead_lettered.is_empty() {
        let seqs = report
            .dead_lettered
            .iter()
            .map(|seq| format!("#{seq}"))
            .collect::<Vec<_>>()
            .join(", ");
        lines.push(format!(
            "Dead-lettered {seqs}; inspect with `certsync queue dead-letters`"
        ));
    }
    if report.blocked > 0 {
        lines.push(format!(
            "{} certificate(s) blocked by dead-lettered operations",
            report.blocked
        ));
    }
    if report.stopped_offline {
        lines.push("Stopped early: server unreachable".to_string());
    }
    lines
}
