use std::sync::Arc;

use kube::Client;
use tokio::signal;
use tracing::{error, info, warn};

use storage_churn::backend::{KubeClaimProvider, KubePodProvider, ProjectNamespace};
use storage_churn::config::{Config, ENV_PREFIX};
use storage_churn::scenario::ChurnScenario;
use storage_churn::tracker::{CleanupGuard, LifecycleTracker};

/// Prefix of namespaces created when none is configured
const NAMESPACE_PREFIX: &str = "storage-churn";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("storage_churn=info".parse()?)
                .add_directive("kube=info".parse()?),
        )
        .init();

    let config = load_config()?;
    info!(?config, "Starting storage-churn");

    let client = Client::try_default().await?;
    info!("Connected to Kubernetes cluster");

    let project = match &config.namespace {
        Some(_) => None,
        None => Some(ProjectNamespace::create(client.clone(), NAMESPACE_PREFIX).await?),
    };
    let namespace = match (&config.namespace, &project) {
        (Some(ns), _) => ns.clone(),
        (None, Some(project)) => project.name().to_string(),
        (None, None) => return Err("no namespace available".into()),
    };
    info!(namespace = %namespace, "Running churn scenario");

    let tracker = Arc::new(LifecycleTracker::new());
    let guard = CleanupGuard::new(Arc::clone(&tracker));

    let claims = Arc::new(KubeClaimProvider::new(client.clone(), &namespace));
    let pods = Arc::new(KubePodProvider::new(
        client.clone(),
        &namespace,
        config.pod_image.clone(),
    ));
    let mut scenario = ChurnScenario::new(config, claims, pods).with_tracker(tracker);

    // On a signal the run finishes its current phase and tears down itself
    let stop = scenario.stop_handle();
    let run = scenario.run();
    tokio::pin!(run);
    let report = tokio::select! {
        report = &mut run => report,
        _ = shutdown_signal() => {
            warn!("Received shutdown signal, stopping after the current phase");
            stop.stop();
            run.await
        }
    };

    let cleanup = guard.run().await;
    if !cleanup.is_clean() {
        for failure in cleanup.failures() {
            error!(error = %failure, "Teardown left a resource behind");
        }
    }

    if let Some(project) = &project
        && let Err(e) = project.cleanup().await
    {
        error!(namespace = %project.name(), error = %e, "Failed to delete namespace");
    }

    if report.is_success() && cleanup.is_clean() {
        info!(phases = report.phases.len(), "Churn scenario passed");
        return Ok(());
    }

    for phase in &report.phases {
        for failure in &phase.failures {
            error!(phase = %phase.phase, "{failure}");
        }
    }
    Err(format!(
        "churn scenario ended in {} with {} failures, {} teardown failures",
        report.final_phase,
        report.failure_count(),
        cleanup.failure_count()
    )
    .into())
}

/// Config from an optional JSON file (first argument), then `CHURN_*` overrides
fn load_config() -> Result<Config, Box<dyn std::error::Error>> {
    let mut config = match std::env::args().nth(1) {
        Some(path) => Config::from_json(&std::fs::read_to_string(path)?)?,
        None => Config::default(),
    };
    config.apply_overrides(|key| std::env::var(format!("{ENV_PREFIX}{key}")).ok())?;
    config.validate()?;
    Ok(config)
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
