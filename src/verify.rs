//! In-process registry of pending registration sessions.
//!
//! Registration is a two-phase ownership proof: `provision` hands out a
//! one-shot code, the caller creates a file by that name inside the target
//! directory, and the finish step pops the session and checks the file on
//! disk. Sessions are sharded across a fixed set of locks to keep contention
//! down.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;

const SHARD_COUNT: usize = 16;
const CODE_BYTES: usize = 32;
const PROVISION_ATTEMPTS: usize = 10;

/// Filename prefix of every verification code.
const CODE_PREFIX: &str = ".sewer_";

#[derive(Debug)]
struct Session {
    code: String,
    created: Instant,
}

pub struct VerificationRegistry {
    shards: Vec<Mutex<HashMap<PathBuf, Session>>>,
}

impl Default for VerificationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl VerificationRegistry {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    fn shard(&self, dir: &Path) -> &Mutex<HashMap<PathBuf, Session>> {
        // Path length modulo is good enough to spread sessions out.
        &self.shards[dir.as_os_str().len() % SHARD_COUNT]
    }

    /// Create (or replace) the pending session for `dir` and return its code.
    /// Codes are drawn from 256 bits of entropy; if a file by the generated
    /// name already exists in `dir`, a fresh code is drawn, up to a bounded
    /// number of attempts.
    pub fn provision(&self, dir: &Path) -> Result<String> {
        for _ in 0..PROVISION_ATTEMPTS {
            let mut buf = [0u8; CODE_BYTES];
            rand::thread_rng().fill_bytes(&mut buf);
            let code = format!("{CODE_PREFIX}{}", URL_SAFE_NO_PAD.encode(buf));
            if std::fs::symlink_metadata(dir.join(&code)).is_ok() {
                continue;
            }
            self.shard(dir).lock().unwrap().insert(
                dir.to_path_buf(),
                Session {
                    code: code.clone(),
                    created: Instant::now(),
                },
            );
            return Ok(code);
        }
        bail!(
            "failed to generate an unused verification code for {}",
            dir.display()
        )
    }

    /// Remove and return the pending code for `dir`, if any.
    pub fn pop(&self, dir: &Path) -> Option<String> {
        self.shard(dir)
            .lock()
            .unwrap()
            .remove(dir)
            .map(|session| session.code)
    }

    /// Drop every session older than `lifetime`; returns how many were
    /// removed.
    pub fn flush(&self, lifetime: Duration) -> usize {
        let mut dropped = 0;
        for shard in &self.shards {
            let mut sessions = shard.lock().unwrap();
            let before = sessions.len();
            sessions.retain(|_, session| session.created.elapsed() < lifetime);
            dropped += before - sessions.len();
        }
        dropped
    }
}
