//! Metadata file loading and user attribution.

use std::collections::HashMap;
use std::fs::Metadata;
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};

use anyhow::{Context, Result};
use nix::unistd::{Uid, User};
use tokio_util::sync::CancellationToken;

use crate::Cancelled;

/// A successfully loaded metadata file.
#[derive(Debug, Clone)]
pub struct LoadedFile {
    pub path: PathBuf,
    pub user: String,
    pub time: i64,
    pub raw: Vec<u8>,
    pub parsed: serde_json::Value,
}

/// Outcome of loading one file; failures are data, not errors.
#[derive(Debug)]
pub struct LoadResult {
    pub path: PathBuf,
    pub outcome: Result<LoadedFile, String>,
}

/// Resolve a uid to a username, caching lookups for the lifetime of the
/// process. Returns `None` for uids with no passwd entry.
pub fn username_for_uid(uid: u32) -> Option<String> {
    static CACHE: OnceLock<Mutex<HashMap<u32, Option<String>>>> = OnceLock::new();
    let cache = CACHE.get_or_init(|| Mutex::new(HashMap::new()));

    if let Some(hit) = cache.lock().unwrap().get(&uid) {
        return hit.clone();
    }
    let resolved = User::from_uid(Uid::from_raw(uid))
        .ok()
        .flatten()
        .map(|user| user.name);
    cache.lock().unwrap().insert(uid, resolved.clone());
    resolved
}

/// Load a single metadata file: read it whole, parse as JSON, and attribute
/// it to the owning user and modification time from `meta` (the stat of the
/// symlink target, when the scanner followed one).
pub fn load_file(path: PathBuf, meta: &Metadata) -> LoadResult {
    let outcome = (|| {
        let raw = std::fs::read(&path).map_err(|err| format!("failed to read file: {err}"))?;
        let parsed: serde_json::Value = serde_json::from_slice(&raw)
            .map_err(|err| format!("failed to parse JSON: {err}"))?;
        let uid = meta.uid();
        let user = username_for_uid(uid)
            .ok_or_else(|| format!("failed to resolve username for uid {uid}"))?;
        Ok(LoadedFile {
            path: path.clone(),
            user,
            time: meta.mtime(),
            raw,
            parsed,
        })
    })();
    LoadResult { path, outcome }
}

/// Load many files on a fixed-size worker pool. The pool bounds open file
/// descriptors on large directories; `concurrency` is clamped to at least one
/// worker. Returns `Cancelled` if the token fired while work was in flight.
pub fn load_many(
    files: Vec<(PathBuf, Metadata)>,
    concurrency: usize,
    cancel: &CancellationToken,
) -> Result<Vec<LoadResult>> {
    use rayon::prelude::*;

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(concurrency.max(1))
        .thread_name(|i| format!("loader-{i}"))
        .build()
        .context("failed to build loader thread pool")?;

    let results = pool.install(|| {
        files
            .into_par_iter()
            .map(|(path, meta)| {
                if cancel.is_cancelled() {
                    return LoadResult {
                        path,
                        outcome: Err("load cancelled".to_string()),
                    };
                }
                load_file(path, &meta)
            })
            .collect::<Vec<_>>()
    });

    if cancel.is_cancelled() {
        return Err(Cancelled.into());
    }
    Ok(results)
}
