//! Typed records built from parsed probe output

use crate::parser::{FieldIssue, IssueKind, ParsedRecord, RecordInvalid};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;

/// One `server_metrics` sample
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerMetrics {
    pub architecture: String,
    pub operating_system: String,
    pub physical_cpus: Option<i64>,
    pub virtual_cpus: i64,
    pub ram_used: Option<String>,
    pub ram_total: Option<String>,
    pub ram_percentage: f64,
    pub disk_used: Option<String>,
    pub disk_total: Option<String>,
    pub disk_percentage: f64,
    pub cpu_load_1min: f64,
    pub cpu_load_5min: Option<f64>,
    pub cpu_load_15min: Option<f64>,
    pub last_boot: Option<NaiveDateTime>,
    pub tcp_connections: Option<i64>,
    pub logged_users: Option<i64>,
    pub active_vnc_users: Option<i64>,
    pub active_ssh_users: Option<i64>,
}

/// One user's resource usage on a host
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserActivity {
    pub username: String,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_gb: Option<f64>,
    pub process_count: i64,
    pub top_process: Option<String>,
    pub last_login: Option<NaiveDateTime>,
    pub full_name: Option<String>,
}

/// Everything collected from one host in one cycle
///
/// Built once and never modified; the storage writer takes ownership of it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollectionResult {
    pub host: String,
    pub collected_at: DateTime<Utc>,
    pub cycle_id: String,
    pub server: ServerMetrics,
    pub users: Vec<UserActivity>,
}

fn missing(schema: &'static str, field: &'static str) -> RecordInvalid {
    RecordInvalid {
        schema,
        failures: vec![FieldIssue {
            field,
            kind: IssueKind::Missing,
        }],
    }
}

fn require<T>(
    record: &ParsedRecord,
    field: &'static str,
    get: impl Fn(&ParsedRecord, &str) -> Option<T>,
) -> Result<T, RecordInvalid> {
    get(record, field).ok_or_else(|| missing(record.schema, field))
}

fn text(record: &ParsedRecord, field: &str) -> Option<String> {
    record.text(field).map(str::to_string)
}

impl TryFrom<&ParsedRecord> for ServerMetrics {
    type Error = RecordInvalid;

    fn try_from(r: &ParsedRecord) -> Result<Self, Self::Error> {
        Ok(Self {
            architecture: require(r, "architecture", text)?,
            operating_system: require(r, "operating_system", text)?,
            physical_cpus: r.integer("physical_cpus"),
            virtual_cpus: require(r, "virtual_cpus", ParsedRecord::integer)?,
            ram_used: text(r, "ram_used"),
            ram_total: text(r, "ram_total"),
            ram_percentage: require(r, "ram_percentage", ParsedRecord::float)?,
            disk_used: text(r, "disk_used"),
            disk_total: text(r, "disk_total"),
            disk_percentage: require(r, "disk_percentage", ParsedRecord::float)?,
            cpu_load_1min: require(r, "cpu_load_1min", ParsedRecord::float)?,
            cpu_load_5min: r.float("cpu_load_5min"),
            cpu_load_15min: r.float("cpu_load_15min"),
            last_boot: r.timestamp("last_boot"),
            tcp_connections: r.integer("tcp_connections"),
            logged_users: r.integer("logged_users"),
            active_vnc_users: r.integer("active_vnc_users"),
            active_ssh_users: r.integer("active_ssh_users"),
        })
    }
}

impl TryFrom<&ParsedRecord> for UserActivity {
    type Error = RecordInvalid;

    fn try_from(r: &ParsedRecord) -> Result<Self, Self::Error> {
        Ok(Self {
            username: require(r, "username", text)?,
            cpu_percent: require(r, "cpu_percent", ParsedRecord::float)?,
            memory_percent: require(r, "memory_percent", ParsedRecord::float)?,
            disk_gb: r.float("disk_gb"),
            process_count: require(r, "process_count", ParsedRecord::integer)?,
            top_process: text(r, "top_process"),
            last_login: r.timestamp("last_login"),
            full_name: text(r, "full_name"),
        })
    }
}
