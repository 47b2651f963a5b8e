/**
 * STORAGE - Persistance des résultats de collecte
 *
 * RÔLE :
 * Interface unique entre le cycle de collecte, la maintenance de rétention
 * et la couche de requêtes. Deux relations append-only :
 * - server_metrics : un échantillon par hôte et par cycle
 * - user_activity  : zéro ou plusieurs utilisateurs par échantillon
 *
 * FONCTIONNEMENT :
 * - write_collection = une écriture logique atomique par hôte et par cycle
 * - prune_older_than = maintenance idempotente (rétention, défaut 90 jours)
 * - les lectures ne voient que des enregistrements validés et committés
 * - StoreError distingue Transient (retry) et Fatal (enregistrement perdu)
 */

pub mod sqlite;

use crate::retry::Retryable;
use chrono::{DateTime, Utc};
use fleetwatch_probe::{CollectionResult, ServerMetrics, UserActivity};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info};

pub use sqlite::SqliteStore;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    /// Base occupée, verrouillée, pleine ou erreur I/O : on peut réessayer
    #[error("transient storage error: {0}")]
    Transient(String),
    /// Schéma incompatible, contrainte violée... : inutile de réessayer
    #[error("fatal storage error: {0}")]
    Fatal(String),
}

impl Retryable for StoreError {
    fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

/// Un échantillon server_metrics tel que relu depuis le store
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerSnapshot {
    pub host: String,
    pub collected_at: DateTime<Utc>,
    pub cycle_id: String,
    pub metrics: ServerMetrics,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WriteReceipt {
    pub server_row_id: i64,
    pub user_rows: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct PruneReport {
    pub server_rows: usize,
    pub user_rows: usize,
    pub vacuumed: bool,
}

impl PruneReport {
    pub fn total(&self) -> usize {
        self.server_rows + self.user_rows
    }
}

/// Interface commune des backends de stockage
///
/// Synchrone : les appelants async passent par `spawn_blocking`.
pub trait Store: Send + Sync {
    /// Écrit l'échantillon serveur et ses utilisateurs dans une seule transaction
    fn write_collection(&self, result: &CollectionResult) -> Result<WriteReceipt, StoreError>;

    /// Supprime tout ce qui est antérieur à `cutoff`; relancer ne change rien
    fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<PruneReport, StoreError>;

    /// Dernier échantillon de chaque hôte, trié par nom
    fn latest_per_host(&self) -> Result<Vec<ServerSnapshot>, StoreError>;

    /// Échantillons d'un hôte dans [from, to], du plus ancien au plus récent
    fn history(
        &self,
        host: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<ServerSnapshot>, StoreError>;

    /// Utilisateurs de la dernière collecte d'un hôte
    fn latest_users(&self, host: &str) -> Result<Vec<UserActivity>, StoreError>;

    /// Horodatage du dernier enregistrement committé, par hôte
    fn last_collected(&self) -> Result<HashMap<String, DateTime<Utc>>, StoreError>;
}

/// Maintenance de rétention : tout ce qui précède `now - retention_days` disparaît
pub async fn run_retention(
    store: Arc<dyn Store>,
    retention_days: u32,
) -> Result<PruneReport, StoreError> {
    let cutoff = Utc::now() - chrono::Duration::days(i64::from(retention_days));
    let report = tokio::task::spawn_blocking(move || store.prune_older_than(cutoff))
        .await
        .map_err(|e| StoreError::Fatal(format!("retention task failed: {e}")))?;

    match &report {
        Ok(r) => info!(
            cutoff = %cutoff,
            server_rows = r.server_rows,
            user_rows = r.user_rows,
            vacuumed = r.vacuumed,
            "retention cleanup done"
        ),
        Err(e) => error!(cutoff = %cutoff, error = %e, "retention cleanup failed"),
    }
    report
}
