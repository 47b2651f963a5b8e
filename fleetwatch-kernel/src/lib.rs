/**
 * FLEETWATCH KERNEL - Collecte périodique de métriques sur une flotte SSH
 *
 * MODULES :
 * - config  : configuration YAML, repli SERVER{i}_*, mode d'exécution
 * - retry   : backoff exponentiel borné, classification Retryable
 * - cycle   : orchestrateur d'un cycle (concurrence bornée, deadline)
 * - storage : écriture SQLite transactionnelle, rétention, lectures
 * - cache   : cache TTL read-through pour la couche de requêtes
 * - query   : requêtes mises en cache, liveness des hôtes
 * - health  : état du process et résumé du dernier cycle
 * - scheduler : cadence des cycles, rétention, arrêt sur signal
 */

pub mod cache;
pub mod config;
pub mod cycle;
pub mod health;
pub mod query;
pub mod retry;
pub mod scheduler;
pub mod storage;
