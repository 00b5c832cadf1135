use std::sync::Arc;

use anyhow::{Context, Result};
use bollard::Docker;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use runbox_config::Config;
use runbox_filesign::Signer;
use runbox_runner::{Executor, RunnerRegistry};
use runbox_sandbox::SandboxManager;
use runbox_server::{create_router, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env()?;
    info!("starting runbox sandbox server");
    info!("  http address:    {}", config.http_addr);
    info!("  public base url: {}", config.public_base_url);
    info!("  sandbox root:    {}", config.sandbox_root);
    if config.sandbox_host_path != config.sandbox_root {
        info!(
            "  sandbox host path: {} (for Docker bind mounts)",
            config.sandbox_host_path
        );
    }
    if let Some(docker_host) = &config.docker_host {
        info!("  docker host:     {}", docker_host);
    }

    // Honors DOCKER_HOST when set.
    let docker = Docker::connect_with_defaults().context("failed to create Docker client")?;
    docker
        .ping()
        .await
        .context("cannot reach the Docker daemon")?;
    info!("connected to Docker daemon");

    let registry = RunnerRegistry::discover(&docker)
        .await
        .context("runner discovery failed")?;
    for runner in registry.list() {
        info!("  runner {}: {}", runner.language, runner.image);
    }
    if registry.is_empty() {
        warn!(
            "no runner images found; build images labelled {}=true and {}=<language>",
            runbox_runner::registry::RUNNER_LABEL,
            runbox_runner::registry::LANGUAGE_LABEL
        );
    }

    std::fs::create_dir_all(&config.sandbox_root)
        .context("failed to create sandbox root directory")?;

    let signer = Arc::new(Signer::new(&config.file_secret, &config.public_base_url));
    let sandbox = Arc::new(SandboxManager::new(
        &config.sandbox_root,
        &config.sandbox_host_path,
        signer.clone(),
    ));
    let state = AppState {
        registry: Arc::new(registry),
        executor: Arc::new(Executor::new(docker)),
        sandbox,
        signer,
        api_token: config.api_token.clone(),
    };

    let app = create_router(state);
    let listener = TcpListener::bind(&config.http_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.http_addr))?;
    info!("server listening on {}", config.http_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
