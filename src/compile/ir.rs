//! Intermediate representation: a sing-box rule-set source document.
//!
//! Each rule kind and generic field gets its own rule object so the rules
//! are OR-ed by the engine. Opaque rule objects follow; other opaque keys
//! are restored at the top level. Object keys are emitted sorted.

use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::rule::{RuleRecord, OPAQUE_RULE_KEY};
use crate::ruleset::RuleSet;
use crate::RuleKind;

/// Build the IR document for a rule set.
pub fn intermediate(ruleset: &RuleSet, source_version: u32) -> Value {
    let mut typed: BTreeMap<RuleKind, Vec<Value>> = BTreeMap::new();
    let mut fields: BTreeMap<&str, Vec<Value>> = BTreeMap::new();
    let mut rules_tail = Vec::new();
    let mut top_level = Map::new();

    for record in ruleset.records() {
        match record {
            RuleRecord::Opaque { key, json } => {
                let value = serde_json::from_str(json).unwrap_or_else(|_| Value::String(json.clone()));
                if key == OPAQUE_RULE_KEY {
                    rules_tail.push(value);
                } else {
                    top_level.insert(key.clone(), value);
                }
            }
            RuleRecord::Field { field, value } => {
                fields.entry(field.as_str()).or_default().push(value.to_json());
            }
            other => {
                if let Some((_, value)) = other.field_entry() {
                    typed.entry(other.kind()).or_default().push(value);
                }
            }
        }
    }

    let grouped = typed
        .into_iter()
        .map(|(kind, values)| (kind.as_str().to_string(), values))
        .chain(fields.into_iter().map(|(name, values)| (name.to_string(), values)));
    let mut rules = Vec::new();
    for (name, values) in grouped {
        let mut rule = Map::new();
        rule.insert(name, Value::Array(values));
        rules.push(Value::Object(rule));
    }
    rules.extend(rules_tail);

    top_level.insert("version".to_string(), Value::from(source_version));
    top_level.insert("rules".to_string(), Value::Array(rules));
    Value::Object(top_level)
}

/// Pretty-printed IR document.
pub fn to_json_string(ruleset: &RuleSet, source_version: u32) -> serde_json::Result<String> {
    serde_json::to_string_pretty(&intermediate(ruleset, source_version))
}
