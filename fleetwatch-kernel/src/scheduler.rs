/**
 * SCHEDULER - Enchaînement des cycles et de la maintenance
 *
 * MODES :
 * - run_once       : un cycle (scheduled), rétention optionnelle avant
 * - run_continuous : un cycle par intervalle jusqu'au signal d'arrêt
 *
 * CADENCE (continuous) :
 * - rétention au démarrage puis toutes les `cleanup_every_days`
 * - disque toutes les `disk_usage_every_hours`, jamais au premier cycle
 * - le signal d'arrêt est écouté pendant toute la durée d'un cycle
 */

use crate::cache::TtlCache;
use crate::config::{CollectionConf, CycleExtras, FleetConfig};
use crate::cycle::{CycleReport, CycleSettings, Orchestrator};
use crate::health::HealthTracker;
use crate::query::{QueryCache, QueryService};
use crate::storage::{run_retention, PruneReport, Store, StoreError};
use fleetwatch_probe::ProbeRunner;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

/// Quels cycles déclenchent disque et rétention
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cadence {
    pub every: Duration,
    pub disk_every: u64,
    pub cleanup_every: u64,
}

impl Cadence {
    pub fn from_config(conf: &CollectionConf) -> Self {
        Self {
            every: conf.interval(),
            disk_every: conf.cycles_per(conf.disk_usage_period()),
            cleanup_every: conf.cycles_per(conf.cleanup_period()),
        }
    }

    /// `n` : index du cycle depuis le démarrage
    pub fn disk_due(&self, n: u64) -> bool {
        n > 0 && n % self.disk_every == 0
    }

    /// Le cycle 0 inclut la rétention de démarrage
    pub fn cleanup_due(&self, n: u64) -> bool {
        n % self.cleanup_every == 0
    }
}

pub struct Collector {
    cfg: FleetConfig,
    store: Arc<dyn Store>,
    cache: Arc<QueryCache>,
    orchestrator: Orchestrator,
    health: HealthTracker,
    queries: QueryService,
}

impl Collector {
    pub fn new(cfg: FleetConfig, runner: Arc<dyn ProbeRunner>, store: Arc<dyn Store>) -> Self {
        let cache: Arc<QueryCache> = Arc::new(TtlCache::new(cfg.cache.ttl()));
        let orchestrator = Orchestrator::new(&cfg, runner, store.clone()).with_cache(cache.clone());
        let health = HealthTracker::new().with_cache(cache.clone());
        let queries = QueryService::new(
            store.clone(),
            cache.clone(),
            cfg.hosts.iter().map(|h| h.name.clone()).collect(),
            cfg.collection.liveness_threshold(),
        );
        Self {
            cfg,
            store,
            cache,
            orchestrator,
            health,
            queries,
        }
    }

    pub fn with_settings(mut self, settings: CycleSettings) -> Self {
        self.orchestrator = self.orchestrator.with_settings(settings);
        self
    }

    pub fn cache(&self) -> &Arc<QueryCache> {
        &self.cache
    }

    pub fn health(&self) -> &HealthTracker {
        &self.health
    }

    pub fn queries(&self) -> &QueryService {
        &self.queries
    }

    pub async fn cleanup(&self) -> Result<PruneReport, StoreError> {
        let report = run_retention(self.store.clone(), self.cfg.storage.retention_days).await?;
        self.cache.clear();
        Ok(report)
    }

    /// Un cycle, puis health et liveness dans les logs
    pub async fn cycle(&self, collect_disk: bool) -> CycleReport {
        let report = self.orchestrator.run_cycle(collect_disk).await;
        self.health.record_cycle(&report);
        self.health.log_health();

        match self.queries.liveness() {
            Ok(hosts) => {
                let offline: Vec<_> = hosts
                    .iter()
                    .filter(|h| !h.online)
                    .map(|h| h.host.as_str())
                    .collect();
                if !offline.is_empty() {
                    warn!(offline = ?offline, "hosts without a recent collection");
                }
            }
            Err(e) => warn!(error = %e, "liveness query failed"),
        }
        report
    }

    /// Un run unique : une rétention en échec n'empêche pas la collecte
    pub async fn run_once(&self, extras: CycleExtras) -> CycleReport {
        if extras.run_cleanup {
            if let Err(e) = self.cleanup().await {
                error!(error = %e, "cleanup failed, collecting anyway");
            }
        }
        self.cycle(extras.collect_disk).await
    }

    /// Cycles périodiques jusqu'à `shutdown`, qui interrompt aussi un cycle en cours
    pub async fn run_continuous<S>(&self, shutdown: S)
    where
        S: Future<Output = ()>,
    {
        let cadence = Cadence::from_config(&self.cfg.collection);
        info!(
            interval_secs = cadence.every.as_secs(),
            disk_every_cycles = cadence.disk_every,
            cleanup_every_cycles = cadence.cleanup_every,
            "continuous mode"
        );

        tokio::pin!(shutdown);
        let mut ticker = tokio::time::interval(cadence.every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut n: u64 = 0;
        loop {
            let ticker = &mut ticker;
            let work = async move {
                ticker.tick().await;
                if cadence.cleanup_due(n) {
                    if let Err(e) = self.cleanup().await {
                        error!(error = %e, cycle_index = n, "cleanup failed");
                    }
                }
                self.cycle(cadence.disk_due(n)).await;
            };
            tokio::select! {
                _ = work => n += 1,
                _ = &mut shutdown => {
                    info!(cycles = n, "shutdown requested");
                    self.cache.clear();
                    return;
                }
            }
        }
    }
}
