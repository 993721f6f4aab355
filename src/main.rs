use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use sewerrat::cli::Cli;
use sewerrat::config::Config;
use sewerrat::period;
use sewerrat::server::{self, AppState};
use sewerrat::storage::sqlite::{Store, StoreOptions};
use sewerrat::verify::VerificationRegistry;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let (config, whitelist) = Config::from_cli(&cli)?;
    let config = Arc::new(config);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        db = %config.db_path.display(),
        port = config.port,
        "starting sewerrat"
    );
    if whitelist.is_empty() {
        info!("no link whitelist configured; symbolic links will not be followed");
    }

    let store = Arc::new(Store::open(
        &config.db_path,
        StoreOptions {
            busy_timeout: config.busy_timeout,
            concurrency: config.concurrency,
            path_field: config.path_field.clone(),
            whitelist: whitelist.clone(),
        },
    )?);
    let registry = Arc::new(VerificationRegistry::new());
    let shutdown = CancellationToken::new();

    period::spawn_update_loop(store.clone(), config.update_interval, shutdown.clone());
    period::spawn_backup_loop(
        store.clone(),
        config.clone(),
        config.backup_interval,
        shutdown.clone(),
    );
    period::spawn_session_flush_loop(registry.clone(), config.session_lifetime, shutdown.clone());

    let state = Arc::new(AppState {
        config,
        store,
        registry,
        whitelist: Arc::new(whitelist),
        shutdown: shutdown.clone(),
    });

    let result = server::serve(state).await;
    shutdown.cancel();
    result
}
