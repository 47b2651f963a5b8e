//! Fleetwatch Probe - remote probes and typed parsing for fleet collection
//!
//! This crate covers everything between a configured host and a typed record:
//! - Target hosts and credential references (env, keyring, key file, agent)
//! - Remote probe execution over SSH with typed failures
//! - Declarative field schemas for each probe layout
//! - Schema-driven parsing and validation into typed records

pub mod execution;
pub mod parser;
pub mod records;
pub mod schema;
pub mod target;

pub use execution::{ProbeError, ProbeInvocation, ProbeRunner, SshOptions, SshProbeExecutor};
pub use parser::{parse_line, parse_lines, FieldIssue, FieldValue, ParsedRecord, RecordInvalid};
pub use records::{CollectionResult, ServerMetrics, UserActivity};
pub use schema::{server_metrics_schema, user_activity_schema, RecordSchema};
pub use target::{resolve_session, CredentialError, CredentialRef, ProbeId, Session, TargetHost};
