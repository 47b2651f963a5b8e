/*!
Probe runner scripté pour tester le cycle sans SSH

Chaque couple (hôte, probe) reçoit un comportement : réponse fixe, échec
permanent, N échecs puis succès, délai, dépassement de timeout ou blocage.
Toutes les invocations sont enregistrées pour les assertions.
*/

use async_trait::async_trait;
use fleetwatch_probe::{ProbeError, ProbeId, ProbeInvocation, ProbeRunner, Session};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Comportement d'un couple (hôte, probe)
#[derive(Debug, Clone)]
pub enum ProbeScript {
    /// Sortie brute renvoyée immédiatement
    Respond(String),
    /// Même erreur à chaque tentative
    FailAlways(ProbeError),
    /// `failures` échecs, puis la sortie
    FailTimes {
        failures: usize,
        error: ProbeError,
        output: String,
    },
    /// Sortie renvoyée après un délai
    Delay(Duration, String),
    /// Attend `after` puis renvoie `ProbeError::Timeout`, comme un exec timeout
    Hang(Duration),
    /// Ne répond jamais
    Stall,
}

/// Invocation enregistrée
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub host: String,
    pub invocation: ProbeInvocation,
}

#[derive(Default)]
struct InFlight {
    current: AtomicUsize,
    max: AtomicUsize,
}

/// Stub de `ProbeRunner` piloté par script
#[derive(Clone, Default)]
pub struct ScriptedProbeRunner {
    scripts: Arc<Mutex<HashMap<(String, ProbeId), ProbeScript>>>,
    calls: Arc<Mutex<Vec<RecordedCall>>>,
    attempts: Arc<Mutex<HashMap<(String, ProbeId), usize>>>,
    in_flight: Arc<InFlight>,
}

impl ScriptedProbeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, host: &str, probe: ProbeId, script: ProbeScript) -> &Self {
        self.scripts
            .lock()
            .unwrap()
            .insert((host.to_string(), probe), script);
        self
    }

    pub fn respond(&self, host: &str, probe: ProbeId, output: impl Into<String>) -> &Self {
        self.script(host, probe, ProbeScript::Respond(output.into()))
    }

    pub fn fail_always(&self, host: &str, probe: ProbeId, error: ProbeError) -> &Self {
        self.script(host, probe, ProbeScript::FailAlways(error))
    }

    /// Nombre d'appels pour un couple (hôte, probe)
    pub fn calls(&self, host: &str, probe: ProbeId) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.host == host && c.invocation.probe == probe)
            .count()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn recorded(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Pic de probes exécutées simultanément
    pub fn max_in_flight(&self) -> usize {
        self.in_flight.max.load(Ordering::SeqCst)
    }

    fn next_attempt(&self, key: &(String, ProbeId)) -> usize {
        let mut attempts = self.attempts.lock().unwrap();
        let n = attempts.entry(key.clone()).or_insert(0);
        *n += 1;
        *n
    }
}

struct InFlightGuard<'a>(&'a InFlight);

impl<'a> InFlightGuard<'a> {
    fn enter(in_flight: &'a InFlight) -> Self {
        let now = in_flight.current.fetch_add(1, Ordering::SeqCst) + 1;
        in_flight.max.fetch_max(now, Ordering::SeqCst);
        Self(in_flight)
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.current.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ProbeRunner for ScriptedProbeRunner {
    async fn run_probe(
        &self,
        session: &Session,
        invocation: &ProbeInvocation,
    ) -> Result<String, ProbeError> {
        self.calls.lock().unwrap().push(RecordedCall {
            host: session.host.clone(),
            invocation: invocation.clone(),
        });
        let key = (session.host.clone(), invocation.probe);
        let attempt = self.next_attempt(&key);
        let script = self.scripts.lock().unwrap().get(&key).cloned();
        let _guard = InFlightGuard::enter(&self.in_flight);

        match script {
            None => Err(ProbeError::ConnectFailed {
                host: session.host.clone(),
                reason: format!("no script for {}", invocation.probe),
            }),
            Some(ProbeScript::Respond(output)) => Ok(output),
            Some(ProbeScript::FailAlways(error)) => Err(error),
            Some(ProbeScript::FailTimes {
                failures,
                error,
                output,
            }) => {
                if attempt <= failures {
                    Err(error)
                } else {
                    Ok(output)
                }
            }
            Some(ProbeScript::Delay(delay, output)) => {
                tokio::time::sleep(delay).await;
                Ok(output)
            }
            Some(ProbeScript::Hang(after)) => {
                tokio::time::sleep(after).await;
                Err(ProbeError::Timeout {
                    host: session.host.clone(),
                    after,
                })
            }
            Some(ProbeScript::Stall) => std::future::pending().await,
        }
    }
}

/// Erreurs prêtes à l'emploi
pub fn connect_refused(host: &str) -> ProbeError {
    ProbeError::ConnectFailed {
        host: host.to_string(),
        reason: "Connection refused".to_string(),
    }
}

pub fn auth_denied(host: &str) -> ProbeError {
    ProbeError::AuthFailed {
        host: host.to_string(),
        reason: "Permission denied (publickey,password).".to_string(),
    }
}
