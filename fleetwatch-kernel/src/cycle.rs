/**
 * CYCLE - Orchestrateur d'un cycle de collecte
 *
 * RÔLE :
 * Parcourt la flotte configurée, borne la concurrence (pool de permis),
 * isole les échecs hôte par hôte et enchaîne pour chaque hôte :
 * Probe Executor -> Field Parser -> Storage Writer.
 *
 * MACHINE D'ÉTATS (par hôte, par cycle) :
 * Pending -> Probing -> Parsing -> Validating -> Persisting -> {Done | Skipped | Failed}
 * - probe en échec (retries épuisés ou erreur fatale)  -> Failed
 * - RecordInvalid sur un champ non-nullable          -> Skipped, rien n'est écrit
 * - stockage en échec (retries épuisés ou fatal)      -> Failed (perte de données loggée)
 * - deadline du cycle dépassée                        -> Failed, la tâche est abandonnée
 */

use crate::config::{FleetConfig, ProbeCatalog};
use crate::query::{keys, QueryCache};
use crate::retry::{RetryError, RetryPolicy};
use crate::storage::{Store, StoreError};
use chrono::{DateTime, Utc};
use fleetwatch_probe::{
    parse_line, parse_lines, resolve_session, server_metrics_schema, user_activity_schema,
    CollectionResult, ProbeError, ProbeId, ProbeRunner, ServerMetrics, Session, TargetHost,
    UserActivity,
};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HostPhase {
    Pending,
    Probing,
    Parsing,
    Validating,
    Persisting,
}

impl fmt::Display for HostPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HostPhase::Pending => "pending",
            HostPhase::Probing => "probing",
            HostPhase::Parsing => "parsing",
            HostPhase::Validating => "validating",
            HostPhase::Persisting => "persisting",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Done,
    Skipped,
    Failed,
}

/// Raison d'un Skipped / Failed
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Failure {
    /// connect_failed, auth_failed, timeout, record_invalid, storage_exhausted...
    pub kind: &'static str,
    /// Phase dans laquelle l'hôte s'est arrêté
    pub phase: HostPhase,
    pub message: String,
}

/// Résultat terminal d'un hôte pour un cycle
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HostOutcome {
    pub host: String,
    pub status: OutcomeStatus,
    pub probe_attempts: u32,
    pub store_attempts: u32,
    pub users_stored: usize,
    pub elapsed_ms: u64,
    pub failure: Option<Failure>,
}

/// État transitoire d'un hôte, jeté dès que le résultat est connu
struct HostRunState {
    host: String,
    phase: HostPhase,
    probe_attempts: u32,
    store_attempts: u32,
    started: Instant,
}

impl HostRunState {
    fn new(host: &str) -> Self {
        Self {
            host: host.to_string(),
            phase: HostPhase::Pending,
            probe_attempts: 0,
            store_attempts: 0,
            started: Instant::now(),
        }
    }

    fn advance(&mut self, phase: HostPhase) {
        debug!(host = %self.host, from = %self.phase, to = %phase, "phase");
        self.phase = phase;
    }

    fn finish(self, status: OutcomeStatus, users_stored: usize) -> HostOutcome {
        HostOutcome {
            host: self.host,
            status,
            probe_attempts: self.probe_attempts,
            store_attempts: self.store_attempts,
            users_stored,
            elapsed_ms: self.started.elapsed().as_millis() as u64,
            failure: None,
        }
    }

    fn stop(self, status: OutcomeStatus, kind: &'static str, message: String) -> HostOutcome {
        let phase = self.phase;
        let mut outcome = self.finish(status, 0);
        outcome.failure = Some(Failure {
            kind,
            phase,
            message,
        });
        outcome
    }
}

/// Résumé d'un cycle, pour le health tracker et les logs
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleSummary {
    pub cycle_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub hosts: usize,
    pub done: usize,
    pub skipped: usize,
    pub failed: usize,
    pub deadline_hit: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub cycle_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    pub deadline_hit: bool,
    /// Dans l'ordre de la configuration
    pub outcomes: Vec<HostOutcome>,
}

impl CycleReport {
    fn count(&self, status: OutcomeStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }

    pub fn done(&self) -> usize {
        self.count(OutcomeStatus::Done)
    }

    pub fn skipped(&self) -> usize {
        self.count(OutcomeStatus::Skipped)
    }

    pub fn failed(&self) -> usize {
        self.count(OutcomeStatus::Failed)
    }

    pub fn any_done(&self) -> bool {
        self.done() > 0
    }

    pub fn outcome(&self, host: &str) -> Option<&HostOutcome> {
        self.outcomes.iter().find(|o| o.host == host)
    }

    pub fn summary(&self) -> CycleSummary {
        CycleSummary {
            cycle_id: self.cycle_id,
            started_at: self.started_at,
            duration_ms: self.duration.as_millis() as u64,
            hosts: self.outcomes.len(),
            done: self.done(),
            skipped: self.skipped(),
            failed: self.failed(),
            deadline_hit: self.deadline_hit,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CycleSettings {
    pub concurrency: usize,
    pub deadline: Duration,
    pub probe_retry: RetryPolicy,
    pub storage_retry: RetryPolicy,
}

impl CycleSettings {
    pub fn from_config(cfg: &FleetConfig) -> Self {
        Self {
            concurrency: cfg.collection.concurrency.max(1),
            deadline: cfg.collection.cycle_deadline(),
            probe_retry: cfg.collection.retry.policy(),
            storage_retry: cfg.collection.retry.policy(),
        }
    }
}

/// Tout ce dont une tâche hôte a besoin, partagé entre les tâches d'un cycle
struct HostContext {
    runner: Arc<dyn ProbeRunner>,
    store: Arc<dyn Store>,
    cache: Option<Arc<QueryCache>>,
    catalog: ProbeCatalog,
    probe_retry: RetryPolicy,
    storage_retry: RetryPolicy,
    cycle_id: Uuid,
    cycle_started: DateTime<Utc>,
    collect_disk: bool,
}

pub struct Orchestrator {
    hosts: Vec<TargetHost>,
    catalog: ProbeCatalog,
    runner: Arc<dyn ProbeRunner>,
    store: Arc<dyn Store>,
    cache: Option<Arc<QueryCache>>,
    settings: CycleSettings,
}

impl Orchestrator {
    pub fn new(cfg: &FleetConfig, runner: Arc<dyn ProbeRunner>, store: Arc<dyn Store>) -> Self {
        Self {
            hosts: cfg.hosts.clone(),
            catalog: cfg.probes.clone(),
            runner,
            store,
            cache: None,
            settings: CycleSettings::from_config(cfg),
        }
    }

    /// Cache à invalider après chaque hôte Done
    pub fn with_cache(mut self, cache: Arc<QueryCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_settings(mut self, settings: CycleSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn hosts(&self) -> &[TargetHost] {
        &self.hosts
    }

    /// Un cycle complet sur la flotte; ne renvoie jamais d'erreur, tout est dans le rapport
    pub async fn run_cycle(&self, collect_disk: bool) -> CycleReport {
        let cycle_id = Uuid::new_v4();
        let started_at = Utc::now();
        let start = Instant::now();
        let deadline = start + self.settings.deadline;

        info!(
            cycle = %cycle_id,
            hosts = self.hosts.len(),
            concurrency = self.settings.concurrency,
            collect_disk,
            "collection cycle started"
        );

        let ctx = Arc::new(HostContext {
            runner: self.runner.clone(),
            store: self.store.clone(),
            cache: self.cache.clone(),
            catalog: self.catalog.clone(),
            probe_retry: self.settings.probe_retry.clone(),
            storage_retry: self.settings.storage_retry.clone(),
            cycle_id,
            cycle_started: started_at,
            collect_disk,
        });
        let permits = Arc::new(Semaphore::new(self.settings.concurrency));
        let mut tasks = JoinSet::new();

        for (index, host) in self.hosts.iter().cloned().enumerate() {
            let ctx = ctx.clone();
            let permits = permits.clone();
            let span = tracing::info_span!("host", host = %host.name, cycle = %cycle_id);
            tasks.spawn(
                async move {
                    // le sémaphore n'est jamais fermé
                    let _permit = permits.acquire_owned().await.ok();
                    (index, collect_host(&ctx, &host).await)
                }
                .instrument(span),
            );
        }

        let mut outcomes: Vec<Option<HostOutcome>> = vec![None; self.hosts.len()];
        let mut deadline_hit = false;
        loop {
            match tokio::time::timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(Ok((index, outcome)))) => outcomes[index] = Some(outcome),
                Ok(Some(Err(e))) => error!(cycle = %cycle_id, error = %e, "host task aborted"),
                Ok(None) => break,
                Err(_) => {
                    deadline_hit = true;
                    warn!(
                        cycle = %cycle_id,
                        pending = tasks.len(),
                        deadline_secs = self.settings.deadline.as_secs(),
                        "cycle deadline reached, abandoning remaining hosts"
                    );
                    // les enfants ssh sont tués au drop (kill_on_drop); une écriture
                    // spawn_blocking déjà lancée n'est pas annulable et peut encore committer
                    tasks.abort_all();
                    break;
                }
            }
        }

        let outcomes: Vec<HostOutcome> = outcomes
            .into_iter()
            .zip(&self.hosts)
            .map(|(outcome, host)| {
                outcome.unwrap_or_else(|| {
                    let (kind, message) = if deadline_hit {
                        ("deadline_exceeded", "abandoned at cycle deadline".to_string())
                    } else {
                        ("task_aborted", "host task ended without a result".to_string())
                    };
                    // un commit tardif reste possible : le cache de l'hôte ne doit pas le masquer
                    invalidate_host(&ctx, &host.name);
                    error!(
                        host = %host.name,
                        cycle = %cycle_id,
                        cycle_started = %started_at,
                        kind,
                        "host failed"
                    );
                    HostOutcome {
                        host: host.name.clone(),
                        status: OutcomeStatus::Failed,
                        probe_attempts: 0,
                        store_attempts: 0,
                        users_stored: 0,
                        elapsed_ms: start.elapsed().as_millis() as u64,
                        failure: Some(Failure {
                            kind,
                            phase: HostPhase::Pending,
                            message,
                        }),
                    }
                })
            })
            .collect();

        let report = CycleReport {
            cycle_id,
            started_at,
            duration: start.elapsed(),
            deadline_hit,
            outcomes,
        };
        info!(
            cycle = %cycle_id,
            done = report.done(),
            skipped = report.skipped(),
            failed = report.failed(),
            duration_ms = report.duration.as_millis() as u64,
            "collection cycle completed"
        );
        report
    }
}

fn log_terminal(ctx: &HostContext, outcome: &HostOutcome) {
    let Some(failure) = &outcome.failure else {
        return;
    };
    match outcome.status {
        OutcomeStatus::Skipped => warn!(
            host = %outcome.host,
            cycle = %ctx.cycle_id,
            cycle_started = %ctx.cycle_started,
            kind = failure.kind,
            phase = %failure.phase,
            error = %failure.message,
            "host skipped"
        ),
        _ => error!(
            host = %outcome.host,
            cycle = %ctx.cycle_id,
            cycle_started = %ctx.cycle_started,
            kind = failure.kind,
            phase = %failure.phase,
            error = %failure.message,
            "host failed"
        ),
    }
}

async fn collect_host(ctx: &HostContext, host: &TargetHost) -> HostOutcome {
    let outcome = run_host(ctx, host).await;
    log_terminal(ctx, &outcome);
    outcome
}

async fn run_host(ctx: &HostContext, host: &TargetHost) -> HostOutcome {
    let mut state = HostRunState::new(&host.name);

    // credentials résolus une seule fois, hors retry
    let session = match resolve_session(host) {
        Ok(session) => session,
        Err(source) => {
            let err = ProbeError::CredentialInvalid {
                host: host.name.clone(),
                source,
            };
            return state.stop(OutcomeStatus::Failed, err.kind(), err.to_string());
        }
    };

    state.advance(HostPhase::Probing);
    let server_raw = match probe(ctx, &session, ProbeId::ServerMetrics, &mut state).await {
        Ok(raw) => raw,
        Err(e) => return state.stop(OutcomeStatus::Failed, e.error().kind(), e.to_string()),
    };
    let users_raw = if host.runs(ProbeId::UserActivity) {
        match probe(ctx, &session, ProbeId::UserActivity, &mut state).await {
            Ok(raw) => Some(raw),
            Err(e) => return state.stop(OutcomeStatus::Failed, e.error().kind(), e.to_string()),
        }
    } else {
        None
    };

    state.advance(HostPhase::Parsing);
    let server_line = server_raw
        .lines()
        .map(str::trim)
        .rev()
        .find(|l| !l.is_empty())
        .unwrap_or("");
    let parsed_server = match parse_line(server_line, server_metrics_schema()) {
        Ok(parsed) => parsed,
        Err(invalid) => {
            return state.stop(OutcomeStatus::Skipped, "record_invalid", invalid.to_string())
        }
    };
    let parsed_users = users_raw
        .as_deref()
        .map(|raw| parse_lines(raw, user_activity_schema()))
        .unwrap_or_default();

    state.advance(HostPhase::Validating);
    let server = match ServerMetrics::try_from(&parsed_server) {
        Ok(server) => server,
        Err(invalid) => {
            return state.stop(OutcomeStatus::Skipped, "record_invalid", invalid.to_string())
        }
    };
    if !parsed_server.issues.is_empty() {
        debug!(host = %host.name, nulled = parsed_server.issues.len(), "server fields degraded to null");
    }
    let mut users = Vec::with_capacity(parsed_users.len());
    for parsed in parsed_users {
        // une ligne utilisateur invalide est écartée seule
        match parsed.and_then(|p| UserActivity::try_from(&p)) {
            Ok(user) => users.push(user),
            Err(invalid) => warn!(host = %host.name, cycle = %ctx.cycle_id, error = %invalid, "user line dropped"),
        }
    }

    let result = Arc::new(CollectionResult {
        host: host.name.clone(),
        collected_at: Utc::now(),
        cycle_id: ctx.cycle_id.to_string(),
        server,
        users,
    });

    state.advance(HostPhase::Persisting);
    match persist(ctx, result.clone()).await {
        Ok(attempts) => {
            state.store_attempts = attempts;
            invalidate_host(ctx, &host.name);
            info!(host = %host.name, users = result.users.len(), "host done");
            state.finish(OutcomeStatus::Done, result.users.len())
        }
        Err(RetryError::Exhausted { error, attempts }) => {
            state.store_attempts = attempts;
            error!(
                host = %host.name,
                cycle = %ctx.cycle_id,
                collected_at = %result.collected_at,
                "data loss: storage retries exhausted, collection dropped"
            );
            state.stop(OutcomeStatus::Failed, "storage_exhausted", error.to_string())
        }
        Err(RetryError::Fatal { error, attempts }) => {
            state.store_attempts = attempts;
            state.stop(OutcomeStatus::Failed, "storage_fatal", error.to_string())
        }
    }
}

async fn probe(
    ctx: &HostContext,
    session: &Session,
    probe: ProbeId,
    state: &mut HostRunState,
) -> Result<String, RetryError<ProbeError>> {
    let invocation = ctx.catalog.invocation(probe, ctx.collect_disk);
    let runner = &ctx.runner;
    let invocation = &invocation;
    let result = ctx
        .probe_retry
        .run(probe.as_str(), move |_| runner.run_probe(session, invocation))
        .await;
    state.probe_attempts += match &result {
        Ok(done) => done.attempts,
        Err(e) => e.attempts(),
    };
    result.map(|done| done.value)
}

/// Écriture via spawn_blocking (rusqlite est synchrone), sous retry
async fn persist(ctx: &HostContext, result: Arc<CollectionResult>) -> Result<u32, RetryError<StoreError>> {
    let done = ctx
        .storage_retry
        .run("store", |_| {
            let store = ctx.store.clone();
            let result = result.clone();
            async move {
                tokio::task::spawn_blocking(move || store.write_collection(&result))
                    .await
                    .unwrap_or_else(|e| Err(StoreError::Fatal(format!("writer task failed: {e}"))))
            }
        })
        .await?;
    Ok(done.attempts)
}

fn invalidate_host(ctx: &HostContext, host: &str) {
    if let Some(cache) = &ctx.cache {
        cache.invalidate(keys::LATEST);
        cache.invalidate(keys::LIVENESS);
        cache.invalidate_prefix(&keys::host_prefix(host));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::TtlCache;
    use crate::query::QueryResult;
    use crate::storage::{PruneReport, ServerSnapshot, SqliteStore, WriteReceipt};
    use fleetwatch_devkit::{
        auth_denied, connect_refused, init_test_tracing, sample_user, user_output, FleetFixture,
        ProbeScript, ScriptedProbeRunner, ServerLineBuilder, UserLineBuilder,
    };
    use fleetwatch_probe::CredentialRef;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn config(fleet: &FleetFixture) -> FleetConfig {
        FleetConfig {
            hosts: fleet.hosts.clone(),
            ..FleetConfig::default()
        }
    }

    fn orchestrator(
        cfg: &FleetConfig,
        runner: &ScriptedProbeRunner,
        store: Arc<dyn Store>,
    ) -> Orchestrator {
        Orchestrator::new(cfg, Arc::new(runner.clone()), store)
    }

    /// Échoue `failures` fois avec `error`, puis délègue au store SQLite
    struct FlakyStore {
        inner: SqliteStore,
        failures: u32,
        error: StoreError,
        writes: AtomicU32,
    }

    impl FlakyStore {
        fn new(failures: u32, error: StoreError) -> Self {
            Self {
                inner: SqliteStore::open_in_memory().unwrap(),
                failures,
                error,
                writes: AtomicU32::new(0),
            }
        }
    }

    impl Store for FlakyStore {
        fn write_collection(&self, result: &CollectionResult) -> Result<WriteReceipt, StoreError> {
            let n = self.writes.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.failures {
                return Err(self.error.clone());
            }
            self.inner.write_collection(result)
        }

        fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<PruneReport, StoreError> {
            self.inner.prune_older_than(cutoff)
        }

        fn latest_per_host(&self) -> Result<Vec<ServerSnapshot>, StoreError> {
            self.inner.latest_per_host()
        }

        fn history(
            &self,
            host: &str,
            from: DateTime<Utc>,
            to: DateTime<Utc>,
        ) -> Result<Vec<ServerSnapshot>, StoreError> {
            self.inner.history(host, from, to)
        }

        fn latest_users(&self, host: &str) -> Result<Vec<UserActivity>, StoreError> {
            self.inner.latest_users(host)
        }

        fn last_collected(&self) -> Result<HashMap<String, DateTime<Utc>>, StoreError> {
            self.inner.last_collected()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_host_does_not_block_the_fleet() {
        init_test_tracing();
        let fleet = FleetFixture::new(5);
        let runner = fleet.healthy_runner();
        runner.fail_always("host-03", ProbeId::ServerMetrics, connect_refused("host-03"));
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let orch = orchestrator(&config(&fleet), &runner, store.clone());

        let report = orch.run_cycle(false).await;

        assert_eq!(report.done(), 4);
        assert_eq!(report.failed(), 1);
        assert!(!report.deadline_hit);
        let names: Vec<_> = report.outcomes.iter().map(|o| o.host.as_str()).collect();
        assert_eq!(names, vec!["host-01", "host-02", "host-03", "host-04", "host-05"]);

        let failed = report.outcome("host-03").unwrap();
        assert_eq!(failed.status, OutcomeStatus::Failed);
        assert_eq!(failed.probe_attempts, 3);
        let failure = failed.failure.as_ref().unwrap();
        assert_eq!(failure.kind, "connect_failed");
        assert_eq!(failure.phase, HostPhase::Probing);
        assert_eq!(runner.calls("host-03", ProbeId::UserActivity), 0);

        let latest = store.latest_per_host().unwrap();
        assert_eq!(latest.len(), 4);
        assert!(latest.iter().all(|s| s.host != "host-03"));
        assert!(latest.iter().all(|s| s.cycle_id == report.cycle_id.to_string()));
        assert_eq!(store.latest_users("host-01").unwrap().len(), 2);

        let first: HashMap<_, _> = latest.iter().map(|s| (s.host.clone(), s.collected_at)).collect();
        let second = orch.run_cycle(false).await;
        assert_ne!(second.cycle_id, report.cycle_id);
        for snapshot in store.latest_per_host().unwrap() {
            assert!(snapshot.collected_at >= first[&snapshot.host]);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_timeout_only_fails_that_host() {
        let fleet = FleetFixture::new(3);
        let runner = fleet.healthy_runner();
        runner.script(
            "host-02",
            ProbeId::ServerMetrics,
            ProbeScript::Hang(Duration::from_secs(60)),
        );
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());

        let report = orchestrator(&config(&fleet), &runner, store).run_cycle(false).await;

        assert_eq!(report.done(), 2);
        let hung = report.outcome("host-02").unwrap();
        assert_eq!(hung.failure.as_ref().unwrap().kind, "timeout");
        assert_eq!(hung.probe_attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycle_deadline_abandons_stalled_hosts() {
        let fleet = FleetFixture::new(3);
        let runner = fleet.healthy_runner();
        runner.script("host-01", ProbeId::UserActivity, ProbeScript::Stall);
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let cfg = config(&fleet);
        let settings = CycleSettings {
            deadline: Duration::from_secs(30),
            ..CycleSettings::from_config(&cfg)
        };

        let report = orchestrator(&cfg, &runner, store.clone())
            .with_settings(settings)
            .run_cycle(false)
            .await;

        assert!(report.deadline_hit);
        assert_eq!(report.done(), 2);
        let stalled = report.outcome("host-01").unwrap();
        assert_eq!(stalled.status, OutcomeStatus::Failed);
        assert_eq!(stalled.failure.as_ref().unwrap().kind, "deadline_exceeded");
        assert!(report.duration >= Duration::from_secs(30));
        assert!(store.latest_per_host().unwrap().iter().all(|s| s.host != "host-01"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_host_cache_is_invalidated() {
        let fleet = FleetFixture::new(2);
        let runner = fleet.healthy_runner();
        runner.script("host-01", ProbeId::ServerMetrics, ProbeScript::Stall);
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let cache: Arc<QueryCache> = Arc::new(TtlCache::new(Duration::from_secs(900)));
        cache.insert(keys::users("host-01"), QueryResult::Users(vec![sample_user("old", 1.0)]));
        let cfg = config(&fleet);
        let settings = CycleSettings {
            deadline: Duration::from_secs(30),
            ..CycleSettings::from_config(&cfg)
        };

        let report = orchestrator(&cfg, &runner, store)
            .with_cache(cache.clone())
            .with_settings(settings)
            .run_cycle(false)
            .await;

        assert_eq!(
            report.outcome("host-01").unwrap().failure.as_ref().unwrap().kind,
            "deadline_exceeded"
        );
        assert!(cache.get(&keys::users("host-01")).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_bundled_script_output_reaches_done() {
        let fleet = FleetFixture::new(1);
        let runner = fleet.healthy_runner();
        runner.respond(
            "host-01",
            ProbeId::ServerMetrics,
            include_str!("../../probes/testdata/server_metrics.out"),
        );
        runner.respond(
            "host-01",
            ProbeId::UserActivity,
            include_str!("../../probes/testdata/user_activity.out"),
        );
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());

        let report = orchestrator(&config(&fleet), &runner, store.clone()).run_cycle(false).await;

        let outcome = report.outcome("host-01").unwrap();
        assert_eq!(outcome.status, OutcomeStatus::Done, "{:?}", outcome.failure);
        assert_eq!(outcome.users_stored, 2);
        let latest = store.latest_per_host().unwrap();
        assert_eq!(latest[0].metrics.operating_system, "Debian GNU/Linux 12 (bookworm)");
    }

    #[tokio::test(start_paused = true)]
    async fn test_counters_split_over_lines_are_skipped() {
        let fleet = FleetFixture::new(1);
        let runner = fleet.healthy_runner();
        let line = ServerLineBuilder::new().build();
        runner.respond("host-01", ProbeId::ServerMetrics, format!("{}\n0,0\n0\n", line.trim_end()));
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());

        let report = orchestrator(&config(&fleet), &runner, store).run_cycle(false).await;

        assert_eq!(report.outcome("host-01").unwrap().status, OutcomeStatus::Skipped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_server_record_is_skipped_without_writing() {
        let fleet = FleetFixture::new(2);
        let runner = fleet.healthy_runner();
        runner.respond(
            "host-02",
            ProbeId::ServerMetrics,
            ServerLineBuilder::new().virtual_cpus("many").build(),
        );
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());

        let report = orchestrator(&config(&fleet), &runner, store.clone()).run_cycle(false).await;

        let skipped = report.outcome("host-02").unwrap();
        assert_eq!(skipped.status, OutcomeStatus::Skipped);
        let failure = skipped.failure.as_ref().unwrap();
        assert_eq!(failure.kind, "record_invalid");
        assert!(failure.message.contains("virtual_cpus"));
        assert_eq!(skipped.store_attempts, 0);
        assert_eq!(report.skipped(), 1);

        let hosts: Vec<_> = store
            .latest_per_host()
            .unwrap()
            .into_iter()
            .map(|s| s.host)
            .collect();
        assert_eq!(hosts, vec!["host-01"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_probe_output_is_skipped() {
        let fleet = FleetFixture::new(1);
        let runner = fleet.healthy_runner();
        runner.respond("host-01", ProbeId::ServerMetrics, "\n\n");
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());

        let report = orchestrator(&config(&fleet), &runner, store).run_cycle(false).await;

        assert_eq!(report.skipped(), 1);
        assert!(!report.any_done());
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_failure_is_not_retried() {
        let fleet = FleetFixture::new(2);
        let runner = fleet.healthy_runner();
        runner.fail_always("host-01", ProbeId::ServerMetrics, auth_denied("host-01"));
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());

        let report = orchestrator(&config(&fleet), &runner, store).run_cycle(false).await;

        let denied = report.outcome("host-01").unwrap();
        assert_eq!(denied.probe_attempts, 1);
        assert_eq!(denied.failure.as_ref().unwrap().kind, "auth_failed");
        assert_eq!(runner.calls("host-01", ProbeId::ServerMetrics), 1);
        assert_eq!(report.done(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_credential_never_reaches_the_runner() {
        let mut fleet = FleetFixture::new(2);
        fleet.hosts[1].credential = CredentialRef::Env {
            username: "ops".to_string(),
            password_env: "FLEETWATCH_TEST_UNSET_PASSWORD_9F2C".to_string(),
        };
        let runner = fleet.healthy_runner();
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());

        let report = orchestrator(&config(&fleet), &runner, store).run_cycle(false).await;

        let outcome = report.outcome("host-02").unwrap();
        assert_eq!(outcome.status, OutcomeStatus::Failed);
        assert_eq!(outcome.failure.as_ref().unwrap().kind, "credential_invalid");
        assert_eq!(outcome.failure.as_ref().unwrap().phase, HostPhase::Pending);
        assert_eq!(outcome.probe_attempts, 0);
        assert_eq!(runner.calls("host-02", ProbeId::ServerMetrics), 0);
        assert_eq!(report.done(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_store_errors_are_retried() {
        let fleet = FleetFixture::new(1);
        let runner = fleet.healthy_runner();
        let store = Arc::new(FlakyStore::new(2, StoreError::Transient("database is locked".into())));

        let report = orchestrator(&config(&fleet), &runner, store.clone()).run_cycle(false).await;

        let outcome = report.outcome("host-01").unwrap();
        assert_eq!(outcome.status, OutcomeStatus::Done);
        assert_eq!(outcome.store_attempts, 3);
        assert_eq!(store.latest_per_host().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_store_retries_fail_the_host() {
        let fleet = FleetFixture::new(1);
        let runner = fleet.healthy_runner();
        let store = Arc::new(FlakyStore::new(10, StoreError::Transient("disk I/O error".into())));

        let report = orchestrator(&config(&fleet), &runner, store.clone()).run_cycle(false).await;

        let outcome = report.outcome("host-01").unwrap();
        assert_eq!(outcome.status, OutcomeStatus::Failed);
        assert_eq!(outcome.store_attempts, 3);
        let failure = outcome.failure.as_ref().unwrap();
        assert_eq!(failure.kind, "storage_exhausted");
        assert_eq!(failure.phase, HostPhase::Persisting);
        assert!(store.latest_per_host().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_store_error_is_not_retried() {
        let fleet = FleetFixture::new(1);
        let runner = fleet.healthy_runner();
        let store = Arc::new(FlakyStore::new(10, StoreError::Fatal("no such table".into())));

        let report = orchestrator(&config(&fleet), &runner, store.clone()).run_cycle(false).await;

        let outcome = report.outcome("host-01").unwrap();
        assert_eq!(outcome.store_attempts, 1);
        assert_eq!(outcome.failure.as_ref().unwrap().kind, "storage_fatal");
        assert_eq!(store.writes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_bound_is_respected() {
        let fleet = FleetFixture::new(6);
        let runner = ScriptedProbeRunner::new();
        for name in fleet.names() {
            runner.script(
                &name,
                ProbeId::ServerMetrics,
                ProbeScript::Delay(Duration::from_secs(5), ServerLineBuilder::new().build()),
            );
            runner.respond(&name, ProbeId::UserActivity, user_output(&[]));
        }
        let mut cfg = config(&fleet);
        cfg.collection.concurrency = 2;
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());

        let report = orchestrator(&cfg, &runner, store).run_cycle(false).await;

        assert_eq!(report.done(), 6);
        assert_eq!(runner.max_in_flight(), 2);
        // trois vagues de deux hôtes
        assert!(report.duration >= Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_is_invalidated_for_done_hosts_only() {
        let fleet = FleetFixture::new(2);
        let runner = fleet.healthy_runner();
        runner.fail_always("host-02", ProbeId::ServerMetrics, auth_denied("host-02"));
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let cache: Arc<QueryCache> = Arc::new(TtlCache::new(Duration::from_secs(900)));
        cache.insert(keys::LATEST, QueryResult::Latest(Vec::new()));
        cache.insert(keys::LIVENESS, QueryResult::Liveness(Vec::new()));
        cache.insert(keys::users("host-01"), QueryResult::Users(vec![sample_user("old", 1.0)]));
        cache.insert(keys::users("host-02"), QueryResult::Users(vec![sample_user("old", 1.0)]));

        let report = orchestrator(&config(&fleet), &runner, store)
            .with_cache(cache.clone())
            .run_cycle(false)
            .await;

        assert_eq!(report.done(), 1);
        assert!(cache.get(keys::LATEST).is_none());
        assert!(cache.get(keys::LIVENESS).is_none());
        assert!(cache.get(&keys::users("host-01")).is_none());
        assert!(cache.get(&keys::users("host-02")).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_bad_user_line_is_dropped_alone() {
        let fleet = FleetFixture::new(1);
        let runner = fleet.healthy_runner();
        runner.respond(
            "host-01",
            ProbeId::UserActivity,
            user_output(&[
                UserLineBuilder::new("alice").cpu("12.0"),
                UserLineBuilder::new("bob").processes("lots"),
                UserLineBuilder::new("carol"),
            ]),
        );
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());

        let report = orchestrator(&config(&fleet), &runner, store.clone()).run_cycle(false).await;

        assert_eq!(report.outcome("host-01").unwrap().users_stored, 2);
        let mut users: Vec<_> = store
            .latest_users("host-01")
            .unwrap()
            .into_iter()
            .map(|u| u.username)
            .collect();
        users.sort();
        assert_eq!(users, vec!["alice", "carol"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_host_without_user_probe_stores_no_users() {
        let mut fleet = FleetFixture::new(1);
        fleet.hosts[0].probes = vec![ProbeId::ServerMetrics];
        let runner = fleet.healthy_runner();
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());

        let report = orchestrator(&config(&fleet), &runner, store.clone()).run_cycle(true).await;

        let outcome = report.outcome("host-01").unwrap();
        assert_eq!(outcome.status, OutcomeStatus::Done);
        assert_eq!(outcome.users_stored, 0);
        assert_eq!(runner.calls("host-01", ProbeId::UserActivity), 0);
        assert!(store.latest_users("host-01").unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disk_flag_only_on_disk_cycles() {
        let fleet = FleetFixture::new(1);
        let runner = fleet.healthy_runner();
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let orch = orchestrator(&config(&fleet), &runner, store);

        orch.run_cycle(false).await;
        orch.run_cycle(true).await;

        let user_args: Vec<_> = runner
            .recorded()
            .into_iter()
            .filter(|c| c.invocation.probe == ProbeId::UserActivity)
            .map(|c| c.invocation.args)
            .collect();
        assert_eq!(user_args, vec![vec![], vec!["--collect-disk".to_string()]]);
        assert!(runner
            .recorded()
            .iter()
            .filter(|c| c.invocation.probe == ProbeId::ServerMetrics)
            .all(|c| c.invocation.args.is_empty()));
    }

    #[test]
    fn test_summary_counts() {
        let outcome = |host: &str, status| HostOutcome {
            host: host.to_string(),
            status,
            probe_attempts: 1,
            store_attempts: 1,
            users_stored: 0,
            elapsed_ms: 5,
            failure: None,
        };
        let report = CycleReport {
            cycle_id: Uuid::new_v4(),
            started_at: Utc::now(),
            duration: Duration::from_millis(1500),
            deadline_hit: false,
            outcomes: vec![
                outcome("a", OutcomeStatus::Done),
                outcome("b", OutcomeStatus::Skipped),
                outcome("c", OutcomeStatus::Failed),
                outcome("d", OutcomeStatus::Done),
            ],
        };
        let summary = report.summary();
        assert_eq!((summary.done, summary.skipped, summary.failed), (2, 1, 1));
        assert_eq!(summary.hosts, 4);
        assert_eq!(summary.duration_ms, 1500);
    }
}
