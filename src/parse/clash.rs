//! Clash classical rules, as plain text lists or rule-provider YAML.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Value};

use super::Line;
use crate::rule::{CidrBlock, CidrKind, DomainKind, FieldValue, RuleRecord, OPAQUE_RULE_KEY};

/// Innermost parenthesised `TYPE,value` group of a logical rule.
static LOGICAL_COMPONENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"\(([^()]*)\)").unwrap());

/// Rule provider payload structure.
#[derive(Debug, Deserialize)]
pub(crate) struct ProviderPayload {
    #[serde(default)]
    pub payload: Vec<serde_yaml::Value>,
}

/// Parse one classical rule line.
///
/// Trailing fields after the value (policy, `no-resolve`) are ignored.
pub(crate) fn parse_clash_line(line: &str) -> Line {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Line::Blank;
    }

    let parts: Vec<&str> = line.split(',').map(str::trim).collect();
    if parts.len() < 2 {
        // Bare entries of domain-behavior providers
        return match crate::rule::parse_domain_line(line) {
            Some((kind, value)) => Line::Record(RuleRecord::domain(kind, value)),
            None => Line::Malformed,
        };
    }

    let rule_type = parts[0].to_uppercase();
    match rule_type.as_str() {
        "AND" | "OR" | "NOT" => parse_logical(&rule_type, line),
        "GEOIP" if parts[1].eq_ignore_ascii_case("LAN") => Line::Many(lan_cidrs()),
        _ => match map_rule(&rule_type, parts[1]) {
            Some(record) => Line::Record(record),
            None => Line::Malformed,
        },
    }
}

/// Map a classical rule type and value to a record.
fn map_rule(rule_type: &str, value: &str) -> Option<RuleRecord> {
    if value.is_empty() {
        return None;
    }
    let domain = |kind: DomainKind| kind.parse_value(value).map(|v| RuleRecord::domain(kind, v));
    let cidr = |kind: CidrKind| {
        CidrBlock::parse(value).map(|block| RuleRecord::Cidr { kind, block })
    };

    match rule_type {
        "DOMAIN" | "HOST" => domain(DomainKind::Exact),
        "DOMAIN-SUFFIX" | "HOST-SUFFIX" => domain(DomainKind::Suffix),
        "DOMAIN-KEYWORD" | "HOST-KEYWORD" => domain(DomainKind::Keyword),
        "DOMAIN-REGEX" | "URL-REGEX" => domain(DomainKind::Regex),
        "IP-CIDR" | "IP-CIDR6" | "IP6-CIDR" => cidr(CidrKind::Destination),
        "SRC-IP-CIDR" => cidr(CidrKind::Source),
        "DST-PORT" => port_rule("port", "port_range", value),
        "SRC-PORT" => port_rule("source_port", "source_port_range", value),
        "PROCESS-NAME" => Some(RuleRecord::field(
            "process_name",
            FieldValue::Text(value.to_string()),
        )),
        "GEOIP" => Some(RuleRecord::field(
            "geoip",
            FieldValue::Text(value.to_lowercase()),
        )),
        _ => None,
    }
}

/// A single port becomes an integer field; `a-b` becomes a port range.
fn port_rule(field: &str, range_field: &str, value: &str) -> Option<RuleRecord> {
    if let Ok(port) = value.parse::<u16>() {
        return Some(RuleRecord::field(field, FieldValue::Integer(i64::from(port))));
    }
    let (start, end) = value.split_once(['-', ':'])?;
    let start: u16 = start.trim().parse().ok()?;
    let end: u16 = end.trim().parse().ok()?;
    if start > end {
        return None;
    }
    Some(RuleRecord::field(
        range_field,
        FieldValue::Text(format!("{}:{}", start, end)),
    ))
}

/// Convert `AND,((DOMAIN,a.com),(DST-PORT,443))` into a logical rule object.
///
/// `NOT` becomes an inverted `and` rule.
fn parse_logical(rule_type: &str, line: &str) -> Line {
    let mut rules = Vec::new();
    for caps in LOGICAL_COMPONENT.captures_iter(line) {
        let component = &caps[1];
        let Some((kind, value)) = component.split_once(',') else {
            return Line::Malformed;
        };
        let value = value.split(',').next().unwrap_or("").trim();
        let Some(record) = map_rule(&kind.trim().to_uppercase(), value) else {
            return Line::Malformed;
        };
        let Some((field, json)) = record.field_entry() else {
            return Line::Malformed;
        };
        let mut rule = Map::new();
        rule.insert(field.into_owned(), json);
        rules.push(Value::Object(rule));
    }
    if rules.is_empty() {
        return Line::Malformed;
    }

    let mut logical = Map::new();
    logical.insert("type".to_string(), Value::from("logical"));
    let mode = if rule_type == "OR" { "or" } else { "and" };
    logical.insert("mode".to_string(), Value::from(mode));
    if rule_type == "NOT" {
        logical.insert("invert".to_string(), Value::Bool(true));
    }
    logical.insert("rules".to_string(), Value::Array(rules));
    Line::Record(RuleRecord::opaque(OPAQUE_RULE_KEY, &Value::Object(logical)))
}

/// Private and loopback ranges matched by `GEOIP,LAN`.
fn lan_cidrs() -> Vec<RuleRecord> {
    [
        "127.0.0.0/8",
        "10.0.0.0/8",
        "172.16.0.0/12",
        "192.168.0.0/16",
        "169.254.0.0/16",
        "fc00::/7",
        "fe80::/10",
        "::1/128",
    ]
    .iter()
    .filter_map(|s| CidrBlock::parse(s))
    .map(RuleRecord::cidr)
    .collect()
}
