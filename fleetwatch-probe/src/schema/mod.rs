//! Declarative field schema for probe output
//!
//! Each probe version has a fixed token layout. A `RecordSchema` describes,
//! for every field of one record shape:
//! - where its token sits in the raw line
//! - which pure transform extracts the value from that token
//! - its semantic type, nullability and validation rule
//!
//! Schemas are plain data; `crate::parser` interprets them.

use std::sync::OnceLock;

/// Version of the probe scripts' output layout
pub const PROBE_LAYOUT_VERSION: &str = "1.0.0";

/// Tokens emitted by the probe scripts when a value is unavailable
pub const MISSING_TOKENS: &[&str] = &["", "nan", "OFF", "--"];

/// Accepted timestamp layouts, tried in order
pub const TIMESTAMP_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M",
];

/// Semantic type a token is coerced to
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldType {
    Integer,
    Float,
    /// Float constrained to [0, 100]
    Percentage,
    /// String of at most N characters
    BoundedText(usize),
    /// Naive local timestamp, date-only values land at midnight
    Timestamp,
}

/// Closed set of token transforms
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Transform {
    Identity,
    /// `A/B` -> `A`
    BeforeDelimiter(char),
    /// `A/B` -> `B`
    AfterDelimiter(char),
    /// Nth (0-based) element of an embedded comma-separated value
    NthToken(usize),
    /// Drop one trailing `%`
    StripPercent,
}

/// Validation applied after type coercion
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Validation {
    None,
    Range { min: f64, max: f64 },
    MaxLength(usize),
    OneOf(&'static [&'static str]),
}

/// How a raw line is split into tokens
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Delimiter {
    Char(char),
    Whitespace,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldDescriptor {
    pub name: &'static str,
    pub position: usize,
    pub field_type: FieldType,
    pub transform: Transform,
    pub nullable: bool,
    pub validation: Validation,
}

impl FieldDescriptor {
    /// Required identity field without extra validation
    pub const fn new(name: &'static str, position: usize, field_type: FieldType) -> Self {
        Self {
            name,
            position,
            field_type,
            transform: Transform::Identity,
            nullable: false,
            validation: Validation::None,
        }
    }

    pub fn transform(mut self, transform: Transform) -> Self {
        self.transform = transform;
        self
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn validate(mut self, validation: Validation) -> Self {
        self.validation = validation;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordSchema {
    pub name: &'static str,
    pub version: &'static str,
    pub delimiter: Delimiter,
    pub fields: Vec<FieldDescriptor>,
}

impl RecordSchema {
    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Smallest token count that puts every field in bounds
    pub fn expected_tokens(&self) -> usize {
        self.fields
            .iter()
            .map(|f| f.position + 1)
            .max()
            .unwrap_or(0)
    }
}

const LOAD_AVERAGE: Validation = Validation::Range {
    min: 0.0,
    max: 999.99,
};
const COUNT: Validation = Validation::Range {
    min: 0.0,
    max: 1_000_000.0,
};

/// `server_metrics` probe: one comma-delimited line
///
/// `arch,os,pcpu,vcpu,ram_used/ram_total,ram%,disk_used/disk_total,disk%,load1,load5,load15,last_boot,tcp,users,vnc,ssh`
pub fn server_metrics_schema() -> &'static RecordSchema {
    static SCHEMA: OnceLock<RecordSchema> = OnceLock::new();
    SCHEMA.get_or_init(|| RecordSchema {
        name: "server_metrics",
        version: PROBE_LAYOUT_VERSION,
        delimiter: Delimiter::Char(','),
        fields: vec![
            FieldDescriptor::new("architecture", 0, FieldType::BoundedText(255)),
            FieldDescriptor::new("operating_system", 1, FieldType::BoundedText(255)),
            FieldDescriptor::new("physical_cpus", 2, FieldType::Integer)
                .nullable()
                .validate(Validation::Range { min: 1.0, max: 1024.0 }),
            FieldDescriptor::new("virtual_cpus", 3, FieldType::Integer)
                .validate(Validation::Range { min: 1.0, max: 65_536.0 }),
            FieldDescriptor::new("ram_used", 4, FieldType::BoundedText(30))
                .transform(Transform::BeforeDelimiter('/'))
                .nullable(),
            FieldDescriptor::new("ram_total", 4, FieldType::BoundedText(30))
                .transform(Transform::AfterDelimiter('/'))
                .nullable(),
            FieldDescriptor::new("ram_percentage", 5, FieldType::Percentage),
            FieldDescriptor::new("disk_used", 6, FieldType::BoundedText(30))
                .transform(Transform::BeforeDelimiter('/'))
                .nullable(),
            FieldDescriptor::new("disk_total", 6, FieldType::BoundedText(30))
                .transform(Transform::AfterDelimiter('/'))
                .nullable(),
            FieldDescriptor::new("disk_percentage", 7, FieldType::Percentage)
                .transform(Transform::StripPercent),
            FieldDescriptor::new("cpu_load_1min", 8, FieldType::Float).validate(LOAD_AVERAGE),
            FieldDescriptor::new("cpu_load_5min", 9, FieldType::Float)
                .nullable()
                .validate(LOAD_AVERAGE),
            FieldDescriptor::new("cpu_load_15min", 10, FieldType::Float)
                .nullable()
                .validate(LOAD_AVERAGE),
            FieldDescriptor::new("last_boot", 11, FieldType::Timestamp).nullable(),
            FieldDescriptor::new("tcp_connections", 12, FieldType::Integer)
                .nullable()
                .validate(COUNT),
            FieldDescriptor::new("logged_users", 13, FieldType::Integer)
                .nullable()
                .validate(COUNT),
            FieldDescriptor::new("active_vnc_users", 14, FieldType::Integer)
                .nullable()
                .validate(COUNT),
            FieldDescriptor::new("active_ssh_users", 15, FieldType::Integer)
                .nullable()
                .validate(COUNT),
        ],
    })
}

/// `user_activity` probe: one whitespace-delimited line per user
///
/// `username cpu% mem% disk_gb procs top_process last_login full_name`
pub fn user_activity_schema() -> &'static RecordSchema {
    static SCHEMA: OnceLock<RecordSchema> = OnceLock::new();
    SCHEMA.get_or_init(|| RecordSchema {
        name: "user_activity",
        version: PROBE_LAYOUT_VERSION,
        delimiter: Delimiter::Whitespace,
        fields: vec![
            FieldDescriptor::new("username", 0, FieldType::BoundedText(255)),
            // summed over all of a user's processes, so may exceed 100 on multi-core hosts
            FieldDescriptor::new("cpu_percent", 1, FieldType::Float)
                .validate(Validation::Range { min: 0.0, max: 100_000.0 }),
            FieldDescriptor::new("memory_percent", 2, FieldType::Percentage),
            FieldDescriptor::new("disk_gb", 3, FieldType::Float)
                .nullable()
                .validate(Validation::Range { min: 0.0, max: 1_000_000.0 }),
            FieldDescriptor::new("process_count", 4, FieldType::Integer).validate(COUNT),
            FieldDescriptor::new("top_process", 5, FieldType::BoundedText(255)).nullable(),
            FieldDescriptor::new("last_login", 6, FieldType::Timestamp).nullable(),
            FieldDescriptor::new("full_name", 7, FieldType::BoundedText(255)).nullable(),
        ],
    })
}
