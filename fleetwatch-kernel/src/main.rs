/**
 * FLEETWATCH - Point d'entrée du collecteur de flotte
 *
 * RÔLE : Bootstrap (env, logging, config, stockage) puis exécution
 * selon le mode :
 * - continuous : un cycle toutes les `interval_minutes`, disque quotidien,
 *   rétention au démarrage puis hebdomadaire, arrêt propre sur Ctrl-C
 * - scheduled  : un seul cycle (extras via COLLECT_DISK_USAGE / RUN_CLEANUP),
 *   code de sortie non nul si aucun hôte n'a abouti
 * - cleanup    : rétention seule
 */

use anyhow::{Context, Result};
use fleetwatch_kernel::config::{load_config, RunMode};
use fleetwatch_kernel::scheduler::Collector;
use fleetwatch_kernel::storage::{SqliteStore, Store};
use fleetwatch_probe::SshProbeExecutor;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Résolu au premier Ctrl-C; jamais si le handler n'a pas pu être installé
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "cannot listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                EnvFilter::new("fleetwatch=info,fleetwatch_kernel=info,fleetwatch_probe=info")
            }),
        )
        .init();

    let cfg = load_config().await.context("loading fleet configuration")?;
    let mode = RunMode::from_env();
    info!(hosts = cfg.hosts.len(), mode = ?mode, "fleetwatch starting");
    if cfg.hosts.is_empty() {
        warn!("no hosts configured");
    }

    let store: Arc<dyn Store> = Arc::new(
        SqliteStore::open(&cfg.storage.path)
            .with_context(|| format!("opening database {}", cfg.storage.path.display()))?,
    );
    let runner = Arc::new(SshProbeExecutor::new(cfg.collection.ssh_options()));
    let collector = Collector::new(cfg, runner, store);

    match mode {
        RunMode::CleanupOnly => {
            collector.cleanup().await.context("retention cleanup")?;
            Ok(())
        }
        RunMode::Scheduled(extras) => {
            if !collector.run_once(extras).await.any_done() {
                anyhow::bail!("no host completed the collection cycle");
            }
            Ok(())
        }
        RunMode::Continuous => {
            collector.run_continuous(shutdown_signal()).await;
            Ok(())
        }
    }
}
