/*!
# Fleetwatch DevKit - Stubs et Utilitaires pour les tests de collecte

Bibliothèque facilitant les tests du kernel et des probes avec:
- Probe runner scripté (pas de SSH, comportements par hôte)
- Builders de lignes brutes server_metrics / user_activity
- Fixtures de flotte et d'enregistrements
- Init du logging tracing pour les tests
*/

pub mod line_builders;
pub mod probe_stub;
pub mod test_utils;

pub use line_builders::{user_output, ServerLineBuilder, UserLineBuilder};
pub use probe_stub::{auth_denied, connect_refused, ProbeScript, RecordedCall, ScriptedProbeRunner};
pub use test_utils::{
    init_test_tracing, sample_metrics, sample_result, sample_user, FleetFixture,
};
