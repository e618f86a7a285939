//! Canonical rule records.
//!
//! Every parser produces [`RuleRecord`]s, the normalizer merges them and the
//! compiler encodes them. Records are immutable values with a total order so
//! a normalized rule set has one deterministic layout.

mod cidr;
mod domain;

pub use cidr::CidrBlock;
pub use domain::{parse_domain_line, DomainKind, MAX_DOMAIN_LEN};

use serde_json::Value;
use std::borrow::Cow;
use std::fmt;

use crate::error::ValidationError;
use crate::RuleKind;

/// Key of an opaque record holding a whole rule object (logical rules,
/// rules with scalar options such as `invert`).
pub const OPAQUE_RULE_KEY: &str = "rule";

/// Which address a CIDR record is matched against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CidrKind {
    Destination,
    Source,
}

impl CidrKind {
    pub fn rule_kind(&self) -> RuleKind {
        match self {
            CidrKind::Destination => RuleKind::IpCidr,
            CidrKind::Source => RuleKind::SourceIpCidr,
        }
    }
}

/// Scalar value of a generic rule field.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FieldValue {
    Text(String),
    Integer(i64),
}

impl FieldValue {
    pub fn to_json(&self) -> Value {
        match self {
            FieldValue::Text(s) => Value::String(s.clone()),
            FieldValue::Integer(n) => Value::from(*n),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Text(s) => write!(f, "{}", s),
            FieldValue::Integer(n) => write!(f, "{}", n),
        }
    }
}

/// The canonical unit of rule data.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RuleRecord {
    /// IP range
    Cidr { kind: CidrKind, block: CidrBlock },
    /// Domain pattern
    Domain { kind: DomainKind, value: String },
    /// Element of any other typed rule array, tagged with its field name
    Field { field: String, value: FieldValue },
    /// Pass-through data as canonical (key-sorted) JSON text
    Opaque { key: String, json: String },
}

impl RuleRecord {
    pub fn cidr(block: CidrBlock) -> Self {
        RuleRecord::Cidr {
            kind: CidrKind::Destination,
            block,
        }
    }

    pub fn domain(kind: DomainKind, value: impl Into<String>) -> Self {
        RuleRecord::Domain {
            kind,
            value: value.into(),
        }
    }

    pub fn field(field: impl Into<String>, value: FieldValue) -> Self {
        RuleRecord::Field {
            field: field.into(),
            value,
        }
    }

    /// Opaque record from a JSON value, serialized with sorted keys.
    pub fn opaque(key: impl Into<String>, value: &Value) -> Self {
        RuleRecord::Opaque {
            key: key.into(),
            json: value.to_string(),
        }
    }

    pub fn kind(&self) -> RuleKind {
        match self {
            RuleRecord::Cidr { kind, .. } => kind.rule_kind(),
            RuleRecord::Domain { kind, .. } => kind.rule_kind(),
            RuleRecord::Field { .. } => RuleKind::Field,
            RuleRecord::Opaque { .. } => RuleKind::Opaque,
        }
    }

    /// Text used for keyword exclusion.
    pub fn text_value(&self) -> Cow<'_, str> {
        match self {
            RuleRecord::Cidr { block, .. } => Cow::Owned(block.to_string()),
            RuleRecord::Domain { value, .. } => Cow::Borrowed(value),
            RuleRecord::Field { value, .. } => Cow::Owned(value.to_string()),
            RuleRecord::Opaque { json, .. } => Cow::Borrowed(json),
        }
    }

    /// The sing-box field name and JSON value of a non-opaque record.
    pub fn field_entry(&self) -> Option<(Cow<'_, str>, Value)> {
        match self {
            RuleRecord::Cidr { kind, block } => Some((
                Cow::Borrowed(kind.rule_kind().as_str()),
                Value::String(block.to_string()),
            )),
            RuleRecord::Domain { kind, value } => Some((
                Cow::Borrowed(kind.rule_kind().as_str()),
                Value::String(value.clone()),
            )),
            RuleRecord::Field { field, value } => Some((Cow::Borrowed(field), value.to_json())),
            RuleRecord::Opaque { .. } => None,
        }
    }

    /// Check the record is structurally valid.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let result = match self {
            RuleRecord::Cidr { block, .. } => block.validate(),
            RuleRecord::Domain { kind, value } => kind.validate(value),
            RuleRecord::Field { field, value } => validate_field(field, value),
            RuleRecord::Opaque { key, json } => validate_opaque(key, json),
        };
        result.map_err(|reason| ValidationError::InvalidRecord {
            record: self.to_string(),
            reason,
        })
    }
}

fn validate_field(field: &str, value: &FieldValue) -> Result<(), String> {
    if field.is_empty() {
        return Err("empty field name".to_string());
    }
    if RuleKind::parse(field).is_some() {
        return Err(format!("typed field `{}` carried as a generic field", field));
    }
    match value {
        FieldValue::Text(s) if s.trim().is_empty() => Err("empty field value".to_string()),
        _ => Ok(()),
    }
}

fn validate_opaque(key: &str, json: &str) -> Result<(), String> {
    if key.is_empty() {
        return Err("empty opaque key".to_string());
    }
    serde_json::from_str::<Value>(json)
        .map(|_| ())
        .map_err(|e| format!("opaque value is not JSON: {}", e))
}

impl fmt::Display for RuleRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleRecord::Cidr { kind, block } => write!(f, "{}:{}", kind.rule_kind(), block),
            RuleRecord::Domain { kind, value } => write!(f, "{}:{}", kind.rule_kind(), value),
            RuleRecord::Field { field, value } => write!(f, "{}:{}", field, value),
            RuleRecord::Opaque { key, json } => write!(f, "{}:{}", key, json),
        }
    }
}
