/**
 * CONFIG - Chargement de la configuration de la flotte
 *
 * RÔLE : Lit fleetwatch.yaml (hosts, probes, collection, storage, cache),
 * applique les valeurs par défaut, le fallback legacy SERVER{1..7}_* et valide.
 * Le mode d'exécution (continuous / scheduled / cleanup-only) vient de l'environnement.
 */

use crate::retry::RetryPolicy;
use fleetwatch_probe::{CredentialRef, ProbeId, ProbeInvocation, SshOptions, TargetHost};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Nombre de slots SERVER{i}_* lus en mode legacy
const LEGACY_SERVER_SLOTS: usize = 7;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid YAML in {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("duplicate host name '{0}'")]
    DuplicateHost(String),
    #[error("host '{0}' has an empty address")]
    EmptyAddress(String),
    #[error("host '{0}' does not run the server_metrics probe")]
    MissingServerProbe(String),
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FleetConfig {
    /// Ordre conservé : c'est l'ordre de dispatch du cycle
    #[serde(default)]
    pub hosts: Vec<TargetHost>,
    #[serde(default)]
    pub probes: ProbeCatalog,
    #[serde(default)]
    pub collection: CollectionConf,
    #[serde(default)]
    pub storage: StorageConf,
    #[serde(default)]
    pub cache: CacheConf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConf {
    pub script: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Scripts locaux envoyés sur l'hôte distant à chaque invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeCatalog {
    pub script_dir: PathBuf,
    pub server_metrics: ProbeConf,
    pub user_activity: ProbeConf,
    /// Argument ajouté à user_activity lors des cycles disque
    pub disk_flag: String,
}

impl Default for ProbeCatalog {
    fn default() -> Self {
        Self {
            script_dir: PathBuf::from("probes"),
            server_metrics: ProbeConf {
                script: PathBuf::from("server_metrics.sh"),
                args: Vec::new(),
            },
            user_activity: ProbeConf {
                script: PathBuf::from("user_activity.sh"),
                args: Vec::new(),
            },
            disk_flag: "--collect-disk".to_string(),
        }
    }
}

impl ProbeCatalog {
    pub fn invocation(&self, probe: ProbeId, collect_disk: bool) -> ProbeInvocation {
        let conf = match probe {
            ProbeId::ServerMetrics => &self.server_metrics,
            ProbeId::UserActivity => &self.user_activity,
        };
        let mut args = conf.args.clone();
        if probe == ProbeId::UserActivity && collect_disk {
            args.push(self.disk_flag.clone());
        }
        ProbeInvocation {
            probe,
            script: self.script_dir.join(&conf.script),
            args,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConf {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for RetryConf {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 2_000,
            multiplier: 2.0,
            max_delay_ms: 30_000,
            jitter: false,
        }
    }
}

impl RetryConf {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            multiplier: self.multiplier,
            max_delay: Duration::from_millis(self.max_delay_ms),
            jitter: self.jitter,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionConf {
    /// Nombre max d'hôtes traités en parallèle
    pub concurrency: usize,
    pub cycle_deadline_secs: u64,
    pub connect_timeout_secs: u64,
    pub exec_timeout_secs: u64,
    pub interval_minutes: u64,
    /// Cadence de collecte disque utilisateur (mode continu)
    pub disk_usage_every_hours: u64,
    /// Cadence du nettoyage de rétention (mode continu)
    pub cleanup_every_days: u64,
    /// Seuil de liveness, par défaut 2 x interval
    pub liveness_threshold_secs: Option<u64>,
    pub retry: RetryConf,
}

impl Default for CollectionConf {
    fn default() -> Self {
        Self {
            concurrency: 4,
            cycle_deadline_secs: 600,
            connect_timeout_secs: 10,
            exec_timeout_secs: 60,
            interval_minutes: 15,
            disk_usage_every_hours: 24,
            cleanup_every_days: 7,
            liveness_threshold_secs: None,
            retry: RetryConf::default(),
        }
    }
}

impl CollectionConf {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_minutes.saturating_mul(60))
    }

    pub fn cycle_deadline(&self) -> Duration {
        Duration::from_secs(self.cycle_deadline_secs)
    }

    pub fn liveness_threshold(&self) -> Duration {
        self.liveness_threshold_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.interval() * 2)
    }

    pub fn disk_usage_period(&self) -> Duration {
        Duration::from_secs(self.disk_usage_every_hours.saturating_mul(3600))
    }

    pub fn cleanup_period(&self) -> Duration {
        Duration::from_secs(self.cleanup_every_days.saturating_mul(24 * 3600))
    }

    /// Nombre de cycles entre deux occurrences d'une tâche périodique
    pub fn cycles_per(&self, period: Duration) -> u64 {
        let interval = self.interval().as_secs().max(1);
        (period.as_secs() / interval).max(1)
    }

    pub fn ssh_options(&self) -> SshOptions {
        SshOptions {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            exec_timeout: Duration::from_secs(self.exec_timeout_secs),
            ..SshOptions::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConf {
    pub path: PathBuf,
    pub retention_days: u32,
}

impl Default for StorageConf {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/fleetwatch.db"),
            retention_days: 90,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConf {
    pub ttl_secs: u64,
}

impl Default for CacheConf {
    fn default() -> Self {
        Self { ttl_secs: 900 }
    }
}

impl CacheConf {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl FleetConfig {
    pub fn from_yaml(txt: &str, origin: &str) -> Result<Self, ConfigError> {
        if txt.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(txt).map_err(|source| ConfigError::Parse {
            path: origin.to_string(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for host in &self.hosts {
            if !seen.insert(host.name.as_str()) {
                return Err(ConfigError::DuplicateHost(host.name.clone()));
            }
            if host.address.trim().is_empty() {
                return Err(ConfigError::EmptyAddress(host.name.clone()));
            }
            if !host.runs(ProbeId::ServerMetrics) {
                return Err(ConfigError::MissingServerProbe(host.name.clone()));
            }
        }
        if self.collection.concurrency == 0 {
            return Err(ConfigError::Invalid {
                field: "collection.concurrency",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.collection.interval_minutes == 0 {
            return Err(ConfigError::Invalid {
                field: "collection.interval_minutes",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.collection.disk_usage_every_hours == 0 {
            return Err(ConfigError::Invalid {
                field: "collection.disk_usage_every_hours",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.collection.cleanup_every_days == 0 {
            return Err(ConfigError::Invalid {
                field: "collection.cleanup_every_days",
                reason: "must be at least 1".to_string(),
            });
        }
        let retry = &self.collection.retry;
        if retry.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "collection.retry.max_attempts",
                reason: "must be at least 1".to_string(),
            });
        }
        if !(retry.multiplier >= 1.0) {
            return Err(ConfigError::Invalid {
                field: "collection.retry.multiplier",
                reason: format!("{} is below 1.0", retry.multiplier),
            });
        }
        Ok(())
    }
}

/// Hôtes déclarés par SERVER{i}_NAME / _IP / _USERNAME, mot de passe via SERVER{i}_PASSWORD
pub fn legacy_hosts_from_env() -> Vec<TargetHost> {
    legacy_hosts(|key| std::env::var(key).ok())
}

fn legacy_hosts(lookup: impl Fn(&str) -> Option<String>) -> Vec<TargetHost> {
    (1..=LEGACY_SERVER_SLOTS)
        .filter_map(|i| {
            let name = lookup(&format!("SERVER{i}_NAME")).filter(|n| !n.is_empty())?;
            let address = lookup(&format!("SERVER{i}_IP"))
                .or_else(|| lookup(&format!("SERVER{i}_HOST")))
                .unwrap_or_default();
            Some(TargetHost {
                name,
                address,
                port: fleetwatch_probe::target::DEFAULT_SSH_PORT,
                credential: CredentialRef::Env {
                    username: lookup(&format!("SERVER{i}_USERNAME")).unwrap_or_default(),
                    password_env: format!("SERVER{i}_PASSWORD"),
                },
                probes: vec![ProbeId::ServerMetrics, ProbeId::UserActivity],
            })
        })
        .collect()
}

/// Charge la config depuis FLEETWATCH_CONFIG (défaut: fleetwatch.yaml)
pub async fn load_config() -> Result<FleetConfig, ConfigError> {
    let path = std::env::var("FLEETWATCH_CONFIG").unwrap_or_else(|_| "fleetwatch.yaml".into());
    let mut cfg = if Path::new(&path).exists() {
        let txt = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.clone(),
                source,
            })?;
        FleetConfig::from_yaml(&txt, &path)?
    } else {
        warn!(path = %path, "no config file, using defaults");
        FleetConfig::default()
    };

    if cfg.hosts.is_empty() {
        cfg.hosts = legacy_hosts_from_env();
        if !cfg.hosts.is_empty() {
            info!(count = cfg.hosts.len(), "hosts loaded from SERVER{{i}}_* environment");
        }
    }

    cfg.validate()?;
    Ok(cfg)
}

/// Extras d'un run unique
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CycleExtras {
    pub collect_disk: bool,
    pub run_cleanup: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Continuous,
    Scheduled(CycleExtras),
    CleanupOnly,
}

impl RunMode {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let flag = |key: &str| {
            lookup(key)
                .map(|v| v.trim().eq_ignore_ascii_case("true"))
                .unwrap_or(false)
        };
        if flag("FLEETWATCH_CLEANUP_ONLY") {
            return RunMode::CleanupOnly;
        }
        match lookup("FLEETWATCH_MODE").as_deref().map(str::trim) {
            Some(mode) if mode.eq_ignore_ascii_case("scheduled") => RunMode::Scheduled(CycleExtras {
                collect_disk: flag("COLLECT_DISK_USAGE"),
                run_cleanup: flag("RUN_CLEANUP"),
            }),
            _ => RunMode::Continuous,
        }
    }
}
