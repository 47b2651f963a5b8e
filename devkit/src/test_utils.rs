/*!
Fixtures de test pour la collecte

Facilite l'écriture de tests avec:
- Une flotte de N hôtes (credentials ssh-agent, donc sans secret)
- Un probe runner pré-scripté avec des sorties valides pour toute la flotte
- Des enregistrements typés prêts à stocker
- Le logging tracing redirigé vers la sortie des tests
*/

use crate::line_builders::{user_output, ServerLineBuilder, UserLineBuilder};
use crate::probe_stub::ScriptedProbeRunner;
use chrono::{DateTime, NaiveDate, Utc};
use fleetwatch_probe::{
    CollectionResult, CredentialRef, ProbeId, ServerMetrics, TargetHost, UserActivity,
};
use tracing_subscriber::EnvFilter;

/// Init du logging pour les tests, idempotent
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Flotte fictive `host-01` .. `host-NN`
pub struct FleetFixture {
    pub hosts: Vec<TargetHost>,
}

impl FleetFixture {
    pub fn new(size: usize) -> Self {
        let hosts = (1..=size)
            .map(|i| TargetHost {
                name: format!("host-{i:02}"),
                address: format!("10.0.0.{}", 10 + i),
                port: 22,
                credential: CredentialRef::Agent {
                    username: "ops".to_string(),
                },
                probes: vec![ProbeId::ServerMetrics, ProbeId::UserActivity],
            })
            .collect();
        Self { hosts }
    }

    pub fn names(&self) -> Vec<String> {
        self.hosts.iter().map(|h| h.name.clone()).collect()
    }

    pub fn host(&self, index: usize) -> &TargetHost {
        &self.hosts[index]
    }

    /// Runner qui répond correctement pour chaque hôte (2 utilisateurs chacun)
    pub fn healthy_runner(&self) -> ScriptedProbeRunner {
        let runner = ScriptedProbeRunner::new();
        for host in &self.hosts {
            runner.respond(&host.name, ProbeId::ServerMetrics, ServerLineBuilder::new().build());
            runner.respond(
                &host.name,
                ProbeId::UserActivity,
                user_output(&[
                    UserLineBuilder::new("alice").cpu("45.0"),
                    UserLineBuilder::new("bob").cpu("5.5"),
                ]),
            );
        }
        runner
    }
}

pub fn sample_metrics() -> ServerMetrics {
    ServerMetrics {
        architecture: "x86_64".to_string(),
        operating_system: "Ubuntu 22.04.4 LTS".to_string(),
        physical_cpus: Some(2),
        virtual_cpus: 16,
        ram_used: Some("7.9G".to_string()),
        ram_total: Some("31.2G".to_string()),
        ram_percentage: 25.0,
        disk_used: Some("120G".to_string()),
        disk_total: Some("457G".to_string()),
        disk_percentage: 27.0,
        cpu_load_1min: 0.42,
        cpu_load_5min: Some(0.37),
        cpu_load_15min: Some(0.3),
        last_boot: NaiveDate::from_ymd_opt(2025, 1, 6).and_then(|d| d.and_hms_opt(7, 45, 0)),
        tcp_connections: Some(88),
        logged_users: Some(3),
        active_vnc_users: Some(0),
        active_ssh_users: Some(2),
    }
}

pub fn sample_user(username: &str, cpu_percent: f64) -> UserActivity {
    UserActivity {
        username: username.to_string(),
        cpu_percent,
        memory_percent: 1.2,
        disk_gb: Some(3.5),
        process_count: 12,
        top_process: Some("python3".to_string()),
        last_login: NaiveDate::from_ymd_opt(2025, 1, 9).and_then(|d| d.and_hms_opt(0, 0, 0)),
        full_name: None,
    }
}

/// Résultat de collecte avec `users` utilisateurs `user-0`, `user-1`...
pub fn sample_result(
    host: &str,
    collected_at: DateTime<Utc>,
    cycle_id: &str,
    users: usize,
) -> CollectionResult {
    CollectionResult {
        host: host.to_string(),
        collected_at,
        cycle_id: cycle_id.to_string(),
        server: sample_metrics(),
        users: (0..users)
            .map(|i| sample_user(&format!("user-{i}"), 10.0 * (users - i) as f64))
            .collect(),
    }
}
