use std::path::Path;

use tandem_core::config::SyncSettings;
use tandem_core::sync::{
    NotificationClient, Scheduler, ShutdownOutcome, SyncEvent, SyncReport,
};
use tokio::sync::broadcast::error::RecvError;

use crate::commands::common::open_manager;
use crate::error::CliError;

pub async fn run_sync(as_json: bool, db_path: &Path) -> Result<(), CliError> {
    let settings = SyncSettings::from_env()?;
    let manager = open_manager(&settings, db_path)?;

    let report = manager.run_cycle().await?;
    if as_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for line in format_report_lines(&report) {
            println!("{line}");
        }
    }

    match report.aborted {
        Some(abort) => Err(CliError::SyncAborted(abort.message)),
        None => Ok(()),
    }
}

pub async fn run_watch(db_path: &Path) -> Result<(), CliError> {
    let settings = SyncSettings::from_env()?;
    let manager = open_manager(&settings, db_path)?;
    let mut events = manager.subscribe();

    let scheduler = Scheduler::start(manager, settings.scheduler_config());
    let listener = match settings.notify_url.as_deref() {
        Some(url) => Some(
            NotificationClient::new(url, settings.api_token.as_str(), scheduler.handle())?
                .spawn(scheduler.shutdown_signal()),
        ),
        None => None,
    };
    println!("Watching for changes; press Ctrl-C to stop");

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            result = &mut ctrl_c => {
                result?;
                break;
            }
            event = events.recv() => match event {
                Ok(event) => println!("{}", format_event(&event)),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Dropped sync events");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    let outcome = scheduler.shutdown(settings.shutdown_timeout).await;
    if let Some(listener) = listener {
        listener.abort();
    }
    if outcome == ShutdownOutcome::TimedOut {
        eprintln!("A sync cycle was still running at exit; its changes stay pending");
    }
    Ok(())
}

pub fn format_report_lines(report: &SyncReport) -> Vec<String> {
    let mut lines = report
        .entities
        .iter()
        .map(|entity| {
            let mut line = format!(
                "{:<16} pushed {:>3}  pulled {:>3}  conflicts {:>2}  errors {:>2}",
                entity.entity_type,
                entity.push.applied,
                entity.pull.applied,
                entity.push.conflicts + entity.pull.conflicts,
                entity.push.errors + entity.pull.errors,
            );
            if let Some(error) = &entity.error {
                line.push_str(&format!("  ({error})"));
            }
            line
        })
        .collect::<Vec<_>>();

    match &report.aborted {
        Some(abort) => {
            lines.push(format!(
                "Stopped at {}: {}",
                abort.entity_type, abort.message
            ));
            if !abort.skipped.is_empty() {
                lines.push(format!("Not visited: {}", abort.skipped.join(", ")));
            }
            if abort.auth_required {
                lines.push("Check TANDEM_API_TOKEN and try again".to_string());
            }
        }
        None => lines.push(format!(
            "Sync completed: {} pushed, {} pulled, {} conflicts",
            report.pushed(),
            report.pulled(),
            report.conflicts()
        )),
    }
    lines
}

pub fn format_event(event: &SyncEvent) -> String {
    match event {
        SyncEvent::CycleCompleted(report) if report.is_complete() => format!(
            "synced: {} pushed, {} pulled, {} conflicts",
            report.pushed(),
            report.pulled(),
            report.conflicts()
        ),
        SyncEvent::CycleCompleted(report) => match &report.aborted {
            Some(abort) => format!("sync stopped at {}: {}", abort.entity_type, abort.message),
            None => format!("synced with {} errors", report.errors()),
        },
        SyncEvent::ConflictDetected {
            conflict_id,
            entity_type,
            local_id,
        } => format!("conflict #{conflict_id} on {entity_type}/{local_id}"),
        SyncEvent::AuthRequired { message } => format!("sign-in required: {message}"),
    }
}
