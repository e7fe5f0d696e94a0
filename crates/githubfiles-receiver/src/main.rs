//! githubfiles-receiver - Alertmanager webhook to GitHub files.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use githubfiles_receiver::server::{build_router, shutdown_signal, ReceiverState};
use githubfiles_receiver::{
    Cli, Config, ContentReconciler, DebounceQueue, GitHubStore, RemoteStore, Templater,
};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load(Cli::parse()).context("Failed to load configuration")?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .context("Invalid log level")?;
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    if let Some(path) = &config.source {
        info!(path = %path.display(), "Using config file");
    }
    info!(
        repo = %config.repo.full_name(),
        dir = %config.repo.dir,
        engine = ?config.engine,
        debounce_delay = ?config.debounce_delay,
        dry_run = config.dry_run,
        "Starting githubfiles-receiver"
    );

    let token = std::env::var("GITHUB_TOKEN").ok().filter(|t| !t.is_empty());
    if token.is_none() {
        warn!("GITHUB_TOKEN is not set, requests to GitHub are unauthenticated");
    }
    let store: Arc<dyn RemoteStore> = Arc::new(
        GitHubStore::new(
            &config.api_url,
            &config.repo.owner,
            &config.repo.repo,
            token,
            config.request_timeout,
        )
        .context("Failed to create GitHub client")?
        .with_branch(&config.branch),
    );

    let reconciler = Arc::new(ContentReconciler::new(
        store,
        Templater::new(config.repo.clone()),
        config.reconciler_settings(),
    ));

    let queue = Arc::new(DebounceQueue::new(config.debounce_delay));
    let shutdown = CancellationToken::new();
    let queue_task = tokio::spawn(queue.clone().run(reconciler, shutdown.clone()));

    let state = Arc::new(ReceiverState::new(queue, config.enabled_label.clone()));
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen))?;
    info!(addr = %config.listen, "Listening for Alertmanager webhooks");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    shutdown.cancel();
    queue_task.await.context("Debounce queue task failed")?;
    info!("githubfiles-receiver stopped");

    Ok(())
}
