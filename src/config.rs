//! Runtime configuration assembled from the command line.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;

use crate::cli::Cli;
use crate::whitelist::LinkWhitelist;

#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: PathBuf,
    pub port: u16,
    pub url_prefix: String,
    pub backup_interval: Duration,
    pub update_interval: Duration,
    pub session_lifetime: Duration,
    pub busy_timeout: Duration,
    pub concurrency: usize,
    pub path_field: Option<String>,
}

impl Config {
    /// Build the runtime configuration, loading the whitelist file if one was
    /// given.
    pub fn from_cli(cli: &Cli) -> Result<(Self, LinkWhitelist)> {
        let whitelist = match &cli.whitelist {
            Some(path) => LinkWhitelist::load(path)?,
            None => LinkWhitelist::new(),
        };
        let mut url_prefix = cli.prefix.trim_end_matches('/').to_string();
        if !url_prefix.is_empty() && !url_prefix.starts_with('/') {
            url_prefix.insert(0, '/');
        }
        Ok((
            Self {
                db_path: cli.db.clone(),
                port: cli.port,
                url_prefix,
                backup_interval: cli.backup,
                update_interval: cli.update,
                session_lifetime: cli.session,
                busy_timeout: cli.timeout,
                concurrency: cli.concurrency.max(1),
                path_field: cli.path_field.clone(),
            },
            whitelist,
        ))
    }

    /// The backup target lives next to the database file.
    pub fn backup_path(&self) -> PathBuf {
        let mut raw = self.db_path.as_os_str().to_os_string();
        raw.push(".backup");
        PathBuf::from(raw)
    }
}
