//! sing-box rule-set source documents.
//!
//! Accepts `{"version": N, "rules": [...]}` or a single bare rule object.
//! Flat rule objects (every value a list or a single scalar) are split into
//! one record per element. Anything whose meaning depends on the whole
//! object (logical rules, `invert`, nested options) is kept intact as an
//! opaque rule.

use serde_json::{Map, Value};

use crate::error::ParseError;
use crate::rule::{CidrBlock, CidrKind, DomainKind, FieldValue, RuleRecord, OPAQUE_RULE_KEY};
use crate::source::SourceFormat;
use crate::RuleKind;

/// Decode a document into per-element results.
pub(crate) fn parse_document(
    text: &str,
) -> Result<Vec<Result<RuleRecord, ParseError>>, ParseError> {
    let doc: Value = serde_json::from_str(text).map_err(|e| ParseError::UnsupportedFormat {
        format: SourceFormat::Json,
        detail: e.to_string(),
    })?;
    let Value::Object(doc) = doc else {
        return Err(ParseError::UnsupportedFormat {
            format: SourceFormat::Json,
            detail: "document is not a JSON object".to_string(),
        });
    };

    let mut out = Vec::new();
    if !doc.contains_key("rules") {
        parse_rule(&doc, &mut out);
        return Ok(out);
    }

    for (key, value) in &doc {
        match key.as_str() {
            "version" => {}
            "rules" => {
                let Value::Array(rules) = value else {
                    return Err(ParseError::UnsupportedFormat {
                        format: SourceFormat::Json,
                        detail: "`rules` is not an array".to_string(),
                    });
                };
                for (idx, rule) in rules.iter().enumerate() {
                    match rule {
                        Value::Object(rule) => parse_rule(rule, &mut out),
                        other => out.push(Err(malformed(idx, other))),
                    }
                }
            }
            _ => out.push(Ok(RuleRecord::opaque(key.clone(), value))),
        }
    }
    Ok(out)
}

/// Split one rule object into records.
///
/// Element errors carry the element position inside its array.
fn parse_rule(rule: &Map<String, Value>, out: &mut Vec<Result<RuleRecord, ParseError>>) {
    if rule.is_empty() {
        return;
    }
    if !is_flat(rule) {
        out.push(Ok(RuleRecord::opaque(OPAQUE_RULE_KEY, &Value::Object(rule.clone()))));
        return;
    }

    for (field, value) in rule {
        let elements: &[Value] = match value {
            Value::Array(items) => items,
            scalar => std::slice::from_ref(scalar),
        };
        for (idx, element) in elements.iter().enumerate() {
            out.push(parse_element(field, element).ok_or_else(|| malformed(idx, element)));
        }
    }
}

/// A rule is flat when no value needs the rest of the object to make sense.
fn is_flat(rule: &Map<String, Value>) -> bool {
    !rule.contains_key("type")
        && !rule.contains_key("invert")
        && rule.values().all(|v| match v {
            Value::Array(items) => items.iter().all(|i| i.is_string() || i.is_i64()),
            Value::String(_) => true,
            Value::Number(n) => n.is_i64(),
            _ => false,
        })
}

fn parse_element(field: &str, element: &Value) -> Option<RuleRecord> {
    match RuleKind::parse(field) {
        Some(kind) if kind.is_cidr() => {
            let block = CidrBlock::parse(element.as_str()?)?;
            let kind = if kind == RuleKind::SourceIpCidr {
                CidrKind::Source
            } else {
                CidrKind::Destination
            };
            Some(RuleRecord::Cidr { kind, block })
        }
        Some(kind) => {
            let domain_kind = DomainKind::from_rule_kind(kind)?;
            let value = domain_kind.parse_value(element.as_str()?)?;
            Some(RuleRecord::domain(domain_kind, value))
        }
        None => {
            let value = match element {
                Value::String(s) => FieldValue::Text(s.clone()),
                Value::Number(n) => FieldValue::Integer(n.as_i64()?),
                _ => return None,
            };
            Some(RuleRecord::field(field, value))
        }
    }
}

fn malformed(idx: usize, element: &Value) -> ParseError {
    ParseError::MalformedLine {
        line_no: idx + 1,
        content: element.to_string(),
    }
}
