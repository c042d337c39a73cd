use crate::app::{App, RegisterOutcome};
use anyhow::Result;
use mediasort_core::discovery::{self, GlobSet};
use notify::event::{CreateKind, ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Paths from a watcher event that should be offered to `register_file`.
pub fn registrable_paths(event: &Event, excludes: &GlobSet) -> Vec<PathBuf> {
    let arrived = matches!(
        event.kind,
        EventKind::Create(CreateKind::File | CreateKind::Any)
            | EventKind::Modify(ModifyKind::Name(RenameMode::To | RenameMode::Any))
            | EventKind::Modify(ModifyKind::Data(_))
    );
    if !arrived {
        return Vec::new();
    }
    event
        .paths
        .iter()
        .filter(|p| p.is_file() && discovery::is_candidate(p, excludes))
        .cloned()
        .collect()
}

/// Registers files as they appear under `paths` until `cancel` fires.
pub async fn watch_paths(app: &App, paths: Vec<PathBuf>, cancel: CancellationToken) -> Result<()> {
    let mut watch_list = if paths.is_empty() {
        app.watch_roots()
    } else {
        paths
    };
    if watch_list.is_empty() {
        watch_list.push(PathBuf::from("."));
    }
    let excludes = discovery::exclude_set(&app.config.library.exclude)?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut watcher: RecommendedWatcher = Watcher::new(
        move |res: notify::Result<Event>| {
            let _ = tx.send(res);
        },
        notify::Config::default().with_poll_interval(Duration::from_secs(2)),
    )?;
    for p in &watch_list {
        let mode = if p.is_dir() {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        watcher.watch(p, mode)?;
    }

    info!(paths = watch_list.len(), "watching for new files");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = rx.recv() => {
                let Some(result) = received else { break };
                let event = match result {
                    Ok(event) => event,
                    Err(e) => {
                        warn!(error = %e, "watch error");
                        continue;
                    }
                };
                for path in registrable_paths(&event, &excludes) {
                    match app.register_path(&path).await {
                        Ok(RegisterOutcome::Registered { file }) => {
                            info!(file_hash = %file.file_hash, path = %path.display(), "registered from watch");
                        }
                        Ok(RegisterOutcome::AlreadyTracked { .. }) => {}
                        Err(e) => warn!(path = %path.display(), error = %e, "register failed"),
                    }
                }
            }
        }
    }
    info!("watch stopped");
    Ok(())
}
