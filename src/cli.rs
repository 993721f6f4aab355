//! Command-line interface.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use clap::Parser;

/// Metadata indexing and search service for shared filesystems.
#[derive(Debug, Parser)]
#[command(name = "sewerrat", version, about)]
pub struct Cli {
    /// Path to the index database file.
    #[arg(long, default_value = "index.sqlite3")]
    pub db: PathBuf,

    /// Port to listen on.
    #[arg(long, default_value_t = 8080)]
    pub port: u16,

    /// Interval between database backups (e.g. 24h, 30m).
    #[arg(long, default_value = "24h", value_parser = parse_duration)]
    pub backup: Duration,

    /// Interval between re-scans of all registered directories.
    #[arg(long, default_value = "24h", value_parser = parse_duration)]
    pub update: Duration,

    /// Lifetime of pending verification sessions.
    #[arg(long, default_value = "10m", value_parser = parse_duration)]
    pub session: Duration,

    /// URL prefix for all endpoints (e.g. /api/v1).
    #[arg(long, default_value = "")]
    pub prefix: String,

    /// Path to a JSON file of whitelisted symlink-target directories.
    #[arg(long)]
    pub whitelist: Option<PathBuf>,

    /// Worker count for the metadata loader pool.
    #[arg(long, default_value_t = 4)]
    pub concurrency: usize,

    /// Index each file's own path under this metadata field.
    #[arg(long)]
    pub path_field: Option<String>,

    /// How long writes wait on a busy database (e.g. 10s).
    #[arg(long, default_value = "10s", value_parser = parse_duration)]
    pub timeout: Duration,
}

/// Parse Go-style duration strings: an integer followed by `s`, `m`, or `h`.
pub fn parse_duration(raw: &str) -> Result<Duration> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| anyhow!("duration {raw:?} has no unit"))?;
    let (digits, unit) = raw.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| anyhow!("invalid duration {raw:?}"))?;
    let seconds = match unit {
        "s" => value,
        "m" => value * 60,
        "h" => value * 3600,
        other => bail!("unknown duration unit {other:?} in {raw:?}"),
    };
    Ok(Duration::from_secs(seconds))
}
