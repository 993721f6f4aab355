//! Periodic maintenance drivers.
//!
//! Three independent interval loops: directory re-scans, database backups,
//! and verification-session flushes. Each tick runs through the public store
//! or registry API, so the loops serialize naturally on the single write
//! slot. Failures are logged and the loop keeps going.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::storage::sqlite::Store;
use crate::verify::VerificationRegistry;

pub fn spawn_update_loop(store: Arc<Store>, interval: Duration, shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // the first tick fires immediately
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let cancel = shutdown.child_token();
            match store.update_directories(&cancel).await {
                Ok(comments) => {
                    tracing::info!(skipped = comments.len(), "periodic update finished");
                    for comment in comments {
                        tracing::debug!(comment, "update comment");
                    }
                    if let Err(err) = store.clean_database().await {
                        tracing::error!(error = %format!("{err:#}"), "periodic clean failed");
                    }
                }
                Err(err) => {
                    tracing::error!(error = %format!("{err:#}"), "periodic update failed");
                }
            }
        }
    });
}

pub fn spawn_backup_loop(
    store: Arc<Store>,
    config: Arc<Config>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let target = config.backup_path();
            match store.backup_database(&target).await {
                Ok(()) => tracing::info!(target = %target.display(), "backup finished"),
                Err(err) => {
                    tracing::error!(error = %format!("{err:#}"), "backup failed");
                }
            }
        }
    });
}

pub fn spawn_session_flush_loop(
    registry: Arc<VerificationRegistry>,
    lifetime: Duration,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(lifetime);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let dropped = registry.flush(lifetime);
            if dropped > 0 {
                tracing::info!(dropped, "flushed expired verification sessions");
            }
        }
    });
}
