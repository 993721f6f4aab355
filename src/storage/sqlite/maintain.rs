//! Garbage collection and backups.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use rusqlite::TransactionBehavior;

use super::Store;

impl Store {
    /// Drop tokens and fields no longer referenced by any link, then compact
    /// the database file.
    pub async fn clean_database(&self) -> Result<()> {
        let mut conn = self.writer().await;

        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let tokens = tx.execute(
            "DELETE FROM tokens WHERE NOT EXISTS \
             (SELECT 1 FROM links WHERE links.tid = tokens.tid)",
            [],
        )?;
        let fields = tx.execute(
            "DELETE FROM fields WHERE NOT EXISTS \
             (SELECT 1 FROM links WHERE links.fid = fields.fid)",
            [],
        )?;
        tx.commit()?;
        tracing::debug!(tokens, fields, "cleaned unreferenced interned rows");

        conn.execute("VACUUM", []).context("failed to vacuum")?;
        Ok(())
    }

    /// Write a compacted snapshot of the live database to `target`.
    ///
    /// Any previous snapshot is first renamed aside and only removed once the
    /// new one is complete, so a usable snapshot exists at all times; on
    /// failure the previous snapshot is restored.
    pub async fn backup_database(&self, target: &Path) -> Result<()> {
        // Holding the write slot keeps the snapshot settled.
        let conn = self.writer().await;

        let target_str = target
            .to_str()
            .ok_or_else(|| anyhow!("backup target {} is not valid UTF-8", target.display()))?;
        let aside = PathBuf::from(format!("{target_str}.backup"));

        let had_previous = target.exists();
        if had_previous {
            std::fs::rename(target, &aside).with_context(|| {
                format!("failed to move the previous backup aside to {}", aside.display())
            })?;
        }

        let result = conn
            .execute("VACUUM INTO ?1", [target_str])
            .with_context(|| format!("failed to back up into {}", target.display()));

        match result {
            Ok(_) => {
                if had_previous {
                    if let Err(err) = std::fs::remove_file(&aside) {
                        tracing::warn!(
                            aside = %aside.display(),
                            error = %err,
                            "failed to remove the superseded backup"
                        );
                    }
                }
                Ok(())
            }
            Err(err) => {
                if had_previous {
                    // A partial target would shadow the good snapshot.
                    let _ = std::fs::remove_file(target);
                    if let Err(restore_err) = std::fs::rename(&aside, target) {
                        tracing::error!(
                            aside = %aside.display(),
                            error = %restore_err,
                            "failed to restore the previous backup"
                        );
                    }
                }
                Err(err)
            }
        }
    }
}
