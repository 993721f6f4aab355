//! Directory registration and incremental re-indexing.

use std::collections::{HashMap, HashSet};
use std::fs::Metadata;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use rusqlite::{params, Transaction, TransactionBehavior};
use tokio_util::sync::CancellationToken;

use super::Store;
use super::StoreOptions;
use crate::load::{load_many, LoadedFile};
use crate::scan::scan_directory;
use crate::tokenize::Tokenizer;
use crate::Cancelled;

pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Reject base-name lists the scanner cannot use: empty lists, empty names,
/// names with path separators, duplicates.
pub fn validate_base_names(names: &[String]) -> Result<()> {
    if names.is_empty() {
        bail!("at least one base name is required");
    }
    let mut seen = HashSet::new();
    for name in names {
        if name.is_empty() {
            bail!("base names cannot be empty");
        }
        if name.contains('/') {
            bail!("base name {name:?} cannot contain a path separator");
        }
        if !seen.insert(name.as_str()) {
            bail!("duplicate base name {name:?}");
        }
    }
    Ok(())
}

/// Registered paths must be absolute and cleaned.
pub fn validate_directory_path(dir: &Path) -> Result<()> {
    let raw = dir
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("directory path is not valid UTF-8"))?;
    if raw.is_empty() {
        bail!("directory path cannot be empty");
    }
    if !dir.is_absolute() {
        bail!("directory path {raw:?} is not absolute");
    }
    if raw != "/" && raw.ends_with('/') {
        bail!("directory path {raw:?} has a trailing slash");
    }
    if dir
        .components()
        .any(|c| matches!(c, std::path::Component::ParentDir | std::path::Component::CurDir))
    {
        bail!("directory path {raw:?} is not cleaned");
    }
    Ok(())
}

fn path_str(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| anyhow::anyhow!("path {} is not valid UTF-8", path.display()))
}

impl Store {
    /// Register `dir` (or replace its registration) and index its contents,
    /// all in one write transaction. Returns per-file comments for anything
    /// that was skipped.
    pub async fn add_new_directory(
        &self,
        dir: &Path,
        names: &[String],
        user: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>> {
        validate_directory_path(dir)?;
        validate_base_names(names)?;

        let mut conn = self.writer().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let names_blob = serde_json::to_vec(names).context("failed to encode base names")?;
        let did: i64 = tx.query_row(
            "INSERT INTO dirs(path, user, time, names) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(path) DO UPDATE SET
               user = excluded.user, time = excluded.time, names = excluded.names
             RETURNING did",
            params![path_str(dir)?, user, unix_now(), names_blob],
            |row| row.get(0),
        )?;

        let comments = refresh_directory(&tx, did, dir, names, self.options(), cancel)?;
        tx.commit()?;
        Ok(comments)
    }

    /// Re-scan every registered directory, applying the same diff-and-apply
    /// logic as registration, in one transaction.
    pub async fn update_directories(&self, cancel: &CancellationToken) -> Result<Vec<String>> {
        let mut conn = self.writer().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let dirs: Vec<(i64, String, Vec<u8>)> = {
            let mut stmt = tx.prepare("SELECT did, path, names FROM dirs ORDER BY did")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?;
            rows.collect::<rusqlite::Result<_>>()?
        };

        let mut comments = Vec::new();
        for (did, path, names_blob) in dirs {
            let names: Vec<String> = serde_json::from_slice(&names_blob)
                .with_context(|| format!("corrupt base names for {path}"))?;
            comments.extend(refresh_directory(
                &tx,
                did,
                Path::new(&path),
                &names,
                self.options(),
                cancel,
            )?);
        }
        tx.commit()?;

        // Give the query planner a chance to refresh its statistics after a
        // potentially large churn.
        conn.execute_batch("PRAGMA optimize;")?;
        Ok(comments)
    }

    /// Drop a registered directory; paths and links cascade away.
    pub async fn delete_directory(&self, dir: &Path) -> Result<()> {
        let conn = self.writer().await;
        conn.execute("DELETE FROM dirs WHERE path = ?1", params![path_str(dir)?])?;
        Ok(())
    }
}

enum Action {
    New,
    Update(i64),
}

fn refresh_directory(
    tx: &Transaction<'_>,
    did: i64,
    dir: &Path,
    names: &[String],
    options: &StoreOptions,
    cancel: &CancellationToken,
) -> Result<Vec<String>> {
    let name_set: HashSet<String> = names.iter().cloned().collect();
    let scanned = scan_directory(dir, &name_set, &options.whitelist, cancel)?;
    let mut comments = scanned.failures;

    let mut existing: HashMap<String, (i64, i64)> = HashMap::new();
    {
        let mut stmt = tx.prepare_cached("SELECT pid, path, time FROM paths WHERE did = ?1")?;
        let mut rows = stmt.query(params![did])?;
        while let Some(row) = rows.next()? {
            existing.insert(row.get(1)?, (row.get(0)?, row.get(2)?));
        }
    }

    let mut actions: HashMap<PathBuf, Action> = HashMap::new();
    let mut to_load: Vec<(PathBuf, Metadata)> = Vec::new();
    for (path, meta) in scanned.files {
        let Some(key) = path.to_str() else {
            comments.push(format!("{} is not valid UTF-8", path.display()));
            continue;
        };
        match existing.remove(key) {
            None => {
                actions.insert(path.clone(), Action::New);
                to_load.push((path, meta));
            }
            Some((pid, time)) => {
                if time != meta.mtime() {
                    actions.insert(path.clone(), Action::Update(pid));
                    to_load.push((path, meta));
                }
            }
        }
    }
    // Whatever is left in `existing` no longer shows up on disk.
    let mut purged: Vec<i64> = existing.into_values().map(|(pid, _)| pid).collect();

    let loaded = load_many(to_load, options.concurrency, cancel)?;

    let tokenizer = Tokenizer::new(false);
    for result in loaded {
        if cancel.is_cancelled() {
            return Err(Cancelled.into());
        }
        let Some(action) = actions.get(&result.path) else {
            continue;
        };
        match result.outcome {
            Ok(file) => {
                let pid = match action {
                    Action::New => {
                        // Overlapping registrations can both scan the same
                        // file; the most recent scan takes ownership.
                        let pid: i64 = tx
                            .prepare_cached(
                                "INSERT INTO paths(did, path, user, time, metadata)
                                 VALUES (?1, ?2, ?3, ?4, ?5)
                                 ON CONFLICT(path) DO UPDATE SET
                                   did = excluded.did, user = excluded.user,
                                   time = excluded.time, metadata = excluded.metadata
                                 RETURNING pid",
                            )?
                            .query_row(
                                params![
                                    did,
                                    path_str(&file.path)?,
                                    file.user,
                                    file.time,
                                    file.raw
                                ],
                                |row| row.get(0),
                            )?;
                        tx.prepare_cached("DELETE FROM links WHERE pid = ?1")?
                            .execute(params![pid])?;
                        pid
                    }
                    Action::Update(pid) => {
                        tx.prepare_cached(
                            "UPDATE paths SET user = ?1, time = ?2, metadata = ?3 WHERE pid = ?4",
                        )?
                        .execute(params![file.user, file.time, file.raw, pid])?;
                        tx.prepare_cached("DELETE FROM links WHERE pid = ?1")?
                            .execute(params![pid])?;
                        *pid
                    }
                };
                insert_links(tx, pid, &file, &tokenizer, options.path_field.as_deref())?;
            }
            Err(reason) => {
                comments.push(format!(
                    "failed to index {}: {reason}",
                    result.path.display()
                ));
                // A previously indexed file that can no longer be loaded is
                // dropped rather than left stale.
                if let Action::Update(pid) = action {
                    purged.push(*pid);
                }
            }
        }
    }

    for pid in purged {
        tx.prepare_cached("DELETE FROM paths WHERE pid = ?1")?
            .execute(params![pid])?;
    }

    Ok(comments)
}

fn insert_links(
    tx: &Transaction<'_>,
    pid: i64,
    file: &LoadedFile,
    tokenizer: &Tokenizer,
    path_field: Option<&str>,
) -> Result<()> {
    let mut pairs = Vec::new();
    collect_tokens(&file.parsed, "", tokenizer, &mut pairs);
    if let Some(field) = path_field {
        for token in tokenizer.tokenize(&file.path.to_string_lossy()) {
            pairs.push((field.to_string(), token));
        }
    }

    let mut insert_token = tx.prepare_cached("INSERT OR IGNORE INTO tokens(token) VALUES (?1)")?;
    let mut insert_field = tx.prepare_cached("INSERT OR IGNORE INTO fields(field) VALUES (?1)")?;
    let mut insert_link = tx.prepare_cached(
        "INSERT OR IGNORE INTO links(pid, fid, tid)
         SELECT ?1, fields.fid, tokens.tid FROM fields, tokens
         WHERE fields.field = ?2 AND tokens.token = ?3",
    )?;

    for (field, token) in pairs {
        insert_token.execute(params![token])?;
        insert_field.execute(params![field])?;
        insert_link.execute(params![pid, field, token])?;
    }
    Ok(())
}

/// Flatten a JSON document into (dotted field, token) pairs. Strings and
/// numbers are tokenized; numbers keep their source digit form. Booleans and
/// nulls contribute nothing. Array elements share their container's field.
fn collect_tokens(
    value: &serde_json::Value,
    field: &str,
    tokenizer: &Tokenizer,
    out: &mut Vec<(String, String)>,
) {
    match value {
        serde_json::Value::String(s) => {
            for token in tokenizer.tokenize(s) {
                out.push((field.to_string(), token));
            }
        }
        serde_json::Value::Number(n) => {
            for token in tokenizer.tokenize(&n.to_string()) {
                out.push((field.to_string(), token));
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                collect_tokens(item, field, tokenizer, out);
            }
        }
        serde_json::Value::Object(map) => {
            for (key, child) in map {
                let nested = if field.is_empty() {
                    key.clone()
                } else {
                    format!("{field}.{key}")
                };
                collect_tokens(child, &nested, tokenizer, out);
            }
        }
        serde_json::Value::Bool(_) | serde_json::Value::Null => {}
    }
}
