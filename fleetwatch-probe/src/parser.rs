//! Schema-driven field parser
//!
//! Turns one raw probe line into typed, validated field values. Parsing is a
//! pure function of (line, schema): no clock, no I/O, no hidden state.
//!
//! Failure policy per field:
//! - nullable: the value degrades to `None` and a `FieldIssue` is attached
//! - non-nullable: the whole record is rejected with `RecordInvalid`

use crate::schema::{
    Delimiter, FieldDescriptor, FieldType, RecordSchema, Transform, Validation, MISSING_TOKENS,
    TIMESTAMP_FORMATS,
};
use chrono::{NaiveDate, NaiveDateTime};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

/// Typed value of one field
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Integer(i64),
    Float(f64),
    Text(String),
    Timestamp(NaiveDateTime),
}

/// Why a field has no value
#[derive(Debug, Clone, PartialEq)]
pub enum IssueKind {
    /// Source position beyond the end of the line
    OutOfBounds { position: usize, tokens: usize },
    /// Placeholder token (`nan`, `--`, ...) or empty value
    Missing,
    /// Transform could not be applied to the token
    Malformed { token: String },
    /// Token could not be coerced to the field type
    Coercion { token: String },
    /// Coerced value violates the field's rule
    Validation { reason: String },
}

impl fmt::Display for IssueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IssueKind::OutOfBounds { position, tokens } => {
                write!(f, "position {} out of bounds ({} tokens)", position, tokens)
            }
            IssueKind::Missing => f.write_str("value missing"),
            IssueKind::Malformed { token } => write!(f, "malformed token '{}'", token),
            IssueKind::Coercion { token } => write!(f, "cannot coerce '{}'", token),
            IssueKind::Validation { reason } => f.write_str(reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldIssue {
    pub field: &'static str,
    pub kind: IssueKind,
}

impl fmt::Display for FieldIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.kind)
    }
}

/// A non-nullable field failed; nothing from this record may be stored
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{schema} record invalid: {}", join_issues(.failures))]
pub struct RecordInvalid {
    pub schema: &'static str,
    pub failures: Vec<FieldIssue>,
}

fn join_issues(issues: &[FieldIssue]) -> String {
    issues
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Field name -> value mapping, plus annotations for fields that degraded to null
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRecord {
    pub schema: &'static str,
    pub values: BTreeMap<&'static str, Option<FieldValue>>,
    pub issues: Vec<FieldIssue>,
}

impl ParsedRecord {
    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.values.get(field).and_then(|v| v.as_ref())
    }

    pub fn integer(&self, field: &str) -> Option<i64> {
        match self.get(field) {
            Some(FieldValue::Integer(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn float(&self, field: &str) -> Option<f64> {
        match self.get(field) {
            Some(FieldValue::Float(v)) => Some(*v),
            Some(FieldValue::Integer(v)) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn text(&self, field: &str) -> Option<&str> {
        match self.get(field) {
            Some(FieldValue::Text(v)) => Some(v.as_str()),
            _ => None,
        }
    }

    pub fn timestamp(&self, field: &str) -> Option<NaiveDateTime> {
        match self.get(field) {
            Some(FieldValue::Timestamp(v)) => Some(*v),
            _ => None,
        }
    }
}

/// Parse one raw probe line against a schema
pub fn parse_line(raw: &str, schema: &RecordSchema) -> Result<ParsedRecord, RecordInvalid> {
    let tokens = tokenize(raw, schema.delimiter);
    let mut values = BTreeMap::new();
    let mut issues = Vec::new();
    let mut failures = Vec::new();

    for field in &schema.fields {
        match extract(field, &tokens) {
            Ok(value) => {
                values.insert(field.name, Some(value));
            }
            Err(kind) if field.nullable => {
                if kind != IssueKind::Missing {
                    debug!(schema = schema.name, field = field.name, issue = %kind, "field degraded to null");
                    issues.push(FieldIssue {
                        field: field.name,
                        kind,
                    });
                }
                values.insert(field.name, None);
            }
            Err(kind) => failures.push(FieldIssue {
                field: field.name,
                kind,
            }),
        }
    }

    if failures.is_empty() {
        Ok(ParsedRecord {
            schema: schema.name,
            values,
            issues,
        })
    } else {
        Err(RecordInvalid {
            schema: schema.name,
            failures,
        })
    }
}

/// Parse multi-line probe output, one record per data line
///
/// Blank lines, `USERNAME ...` header lines and `----` separator lines are skipped.
pub fn parse_lines(raw: &str, schema: &RecordSchema) -> Vec<Result<ParsedRecord, RecordInvalid>> {
    raw.lines()
        .filter(|line| is_data_line(line))
        .map(|line| parse_line(line, schema))
        .collect()
}

fn is_data_line(line: &str) -> bool {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.contains("----") {
        return false;
    }
    !trimmed
        .split_whitespace()
        .next()
        .map(|first| first.eq_ignore_ascii_case("username"))
        .unwrap_or(false)
}

fn tokenize(raw: &str, delimiter: Delimiter) -> Vec<&str> {
    let line = raw.trim();
    match delimiter {
        Delimiter::Char(c) => line.split(c).map(str::trim).collect(),
        Delimiter::Whitespace => line.split_whitespace().collect(),
    }
}

fn extract(field: &FieldDescriptor, tokens: &[&str]) -> Result<FieldValue, IssueKind> {
    let token = tokens
        .get(field.position)
        .copied()
        .ok_or(IssueKind::OutOfBounds {
            position: field.position,
            tokens: tokens.len(),
        })?;
    if is_missing(token) {
        return Err(IssueKind::Missing);
    }

    let value = apply_transform(field.transform, token).ok_or_else(|| IssueKind::Malformed {
        token: token.to_string(),
    })?;
    if is_missing(value) {
        return Err(IssueKind::Missing);
    }

    let typed = coerce(field.field_type, value)?;
    validate(field, &typed)?;
    Ok(typed)
}

fn is_missing(token: &str) -> bool {
    MISSING_TOKENS.contains(&token.trim())
}

/// Apply a transform to a token; `None` when the token does not have the expected shape
pub fn apply_transform(transform: Transform, token: &str) -> Option<&str> {
    match transform {
        Transform::Identity => Some(token.trim()),
        Transform::BeforeDelimiter(d) => token.split_once(d).map(|(before, _)| before.trim()),
        Transform::AfterDelimiter(d) => token.split_once(d).map(|(_, after)| after.trim()),
        Transform::NthToken(n) => token.split(',').nth(n).map(str::trim),
        Transform::StripPercent => {
            let token = token.trim();
            Some(token.strip_suffix('%').unwrap_or(token).trim())
        }
    }
}

fn coerce(field_type: FieldType, value: &str) -> Result<FieldValue, IssueKind> {
    let coercion = || IssueKind::Coercion {
        token: value.to_string(),
    };
    match field_type {
        FieldType::Integer => value
            .parse::<i64>()
            .map(FieldValue::Integer)
            .map_err(|_| coercion()),
        FieldType::Float | FieldType::Percentage => match value.parse::<f64>() {
            Ok(v) if v.is_finite() => Ok(FieldValue::Float(v)),
            _ => Err(coercion()),
        },
        FieldType::BoundedText(_) => Ok(FieldValue::Text(value.to_string())),
        FieldType::Timestamp => parse_timestamp(value)
            .map(FieldValue::Timestamp)
            .ok_or_else(coercion),
    }
}

fn parse_timestamp(value: &str) -> Option<NaiveDateTime> {
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(value, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

fn validate(field: &FieldDescriptor, value: &FieldValue) -> Result<(), IssueKind> {
    let invalid = |reason: String| Err(IssueKind::Validation { reason });

    if let (FieldType::Percentage, FieldValue::Float(v)) = (field.field_type, value) {
        if !(0.0..=100.0).contains(v) {
            return invalid(format!("percentage {} outside [0, 100]", v));
        }
    }
    if let (FieldType::BoundedText(max), FieldValue::Text(s)) = (field.field_type, value) {
        if s.chars().count() > max {
            return invalid(format!("text longer than {} characters", max));
        }
    }

    match (field.validation, value) {
        (Validation::None, _) => Ok(()),
        (Validation::Range { min, max }, FieldValue::Integer(v)) => {
            let v = *v as f64;
            if v < min || v > max {
                return invalid(format!("{} outside [{}, {}]", v, min, max));
            }
            Ok(())
        }
        (Validation::Range { min, max }, FieldValue::Float(v)) => {
            if *v < min || *v > max {
                return invalid(format!("{} outside [{}, {}]", v, min, max));
            }
            Ok(())
        }
        (Validation::MaxLength(max), FieldValue::Text(s)) => {
            if s.chars().count() > max {
                return invalid(format!("text longer than {} characters", max));
            }
            Ok(())
        }
        (Validation::OneOf(allowed), FieldValue::Text(s)) => {
            if !allowed.contains(&s.as_str()) {
                return invalid(format!("'{}' not in {:?}", s, allowed));
            }
            Ok(())
        }
        (rule, value) => invalid(format!("rule {:?} does not apply to {:?}", rule, value)),
    }
}
