//! Directory walking for metadata discovery.

use std::collections::{HashMap, HashSet};
use std::fs::Metadata;
use std::path::{Path, PathBuf};

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use crate::whitelist::LinkWhitelist;
use crate::Cancelled;

/// Directories containing a file by this name are skipped wholesale.
pub const IGNORE_MARKER: &str = ".SewerRatignore";

/// Files discovered by a scan, keyed by absolute path, with the stat of each
/// file (or of its symlink target). Individual problems land in `failures`
/// as human-readable strings rather than aborting the walk.
#[derive(Debug, Default)]
pub struct ScanOutput {
    pub files: HashMap<PathBuf, Metadata>,
    pub failures: Vec<String>,
}

/// Walk `root` depth-first and collect every file whose basename is in
/// `names`. Dot-directories and directories carrying [`IGNORE_MARKER`] are
/// skipped. Symbolic links are only followed when `whitelist` admits them:
/// directory links are traversed in place (indexed paths stay under `root`),
/// file links contribute the stat of their target.
///
/// The only error this returns is [`Cancelled`].
pub fn scan_directory(
    root: &Path,
    names: &HashSet<String>,
    whitelist: &LinkWhitelist,
    cancel: &CancellationToken,
) -> Result<ScanOutput> {
    let mut out = ScanOutput::default();

    match std::fs::metadata(root) {
        Ok(meta) if meta.is_dir() => {}
        Ok(_) => {
            out.failures
                .push(format!("{} is not a directory", root.display()));
            return Ok(out);
        }
        Err(err) => {
            out.failures
                .push(format!("failed to stat {}: {err}", root.display()));
            return Ok(out);
        }
    }

    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        if cancel.is_cancelled() {
            return Err(Cancelled.into());
        }

        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) => {
                out.failures
                    .push(format!("failed to list {}: {err}", dir.display()));
                continue;
            }
        };

        let mut listed = Vec::new();
        let mut ignored = false;
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    out.failures
                        .push(format!("failed to read an entry of {}: {err}", dir.display()));
                    continue;
                }
            };
            if entry.file_name() == IGNORE_MARKER {
                ignored = true;
                break;
            }
            listed.push(entry);
        }
        if ignored {
            continue;
        }

        for entry in listed {
            if cancel.is_cancelled() {
                return Err(Cancelled.into());
            }
            let path = entry.path();
            let Some(name) = entry.file_name().to_str().map(String::from) else {
                out.failures
                    .push(format!("{} has a non-UTF-8 name", path.display()));
                continue;
            };
            let file_type = match entry.file_type() {
                Ok(ft) => ft,
                Err(err) => {
                    out.failures
                        .push(format!("failed to stat {}: {err}", path.display()));
                    continue;
                }
            };

            if file_type.is_dir() {
                if !name.starts_with('.') {
                    stack.push(path);
                }
                continue;
            }

            if file_type.is_symlink() {
                let target_meta = match std::fs::metadata(&path) {
                    Ok(meta) => meta,
                    Err(err) => {
                        out.failures.push(format!(
                            "failed to stat the target of {}: {err}",
                            path.display()
                        ));
                        continue;
                    }
                };
                if target_meta.is_dir() {
                    // Traverse the link path itself so indexed paths stay
                    // under the registered directory.
                    if !name.starts_with('.') && whitelist.allows_link(&path) {
                        stack.push(path);
                    }
                } else if names.contains(&name) && whitelist.allows_link(&path) {
                    out.files.insert(path, target_meta);
                }
                continue;
            }

            if file_type.is_file() && names.contains(&name) {
                match entry.metadata() {
                    Ok(meta) => {
                        out.files.insert(path, meta);
                    }
                    Err(err) => {
                        out.failures
                            .push(format!("failed to stat {}: {err}", path.display()));
                    }
                }
            }
        }
    }

    Ok(out)
}
