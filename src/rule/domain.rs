//! Domain pattern records.

use regex::Regex;
use serde::Serialize;

use crate::RuleKind;

/// Longest domain name allowed in a record.
pub const MAX_DOMAIN_LEN: usize = 253;

/// How a domain pattern matches.
///
/// # Pattern Formats
/// - Exact match: `example.com`
/// - Suffix match: `.example.com` or `+.example.com` in domain lists,
///   stored without the marker
/// - Keyword and regex patterns only come from rule documents
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainKind {
    Exact,
    Suffix,
    Keyword,
    Regex,
}

impl DomainKind {
    pub fn rule_kind(&self) -> RuleKind {
        match self {
            DomainKind::Exact => RuleKind::Domain,
            DomainKind::Suffix => RuleKind::DomainSuffix,
            DomainKind::Keyword => RuleKind::DomainKeyword,
            DomainKind::Regex => RuleKind::DomainRegex,
        }
    }

    pub fn from_rule_kind(kind: RuleKind) -> Option<Self> {
        match kind {
            RuleKind::Domain => Some(DomainKind::Exact),
            RuleKind::DomainSuffix => Some(DomainKind::Suffix),
            RuleKind::DomainKeyword => Some(DomainKind::Keyword),
            RuleKind::DomainRegex => Some(DomainKind::Regex),
            _ => None,
        }
    }

    /// Normalize a raw value for this kind.
    ///
    /// Regex patterns are case-sensitive and kept verbatim.
    pub fn canonical_value(&self, raw: &str) -> String {
        match self {
            DomainKind::Regex => raw.trim().to_string(),
            _ => raw.trim().to_lowercase(),
        }
    }

    /// Canonicalize and check a value read from a source.
    ///
    /// A single trailing root dot of a fully-qualified name is dropped.
    /// Returns `None` when the result is not a valid pattern of this kind.
    pub fn parse_value(&self, raw: &str) -> Option<String> {
        let mut value = self.canonical_value(raw);
        if matches!(self, DomainKind::Exact | DomainKind::Suffix) && value.ends_with('.') {
            value.pop();
        }
        self.validate(&value).ok()?;
        Some(value)
    }

    /// Check a canonical value for this kind.
    pub fn validate(&self, value: &str) -> Result<(), String> {
        if value.is_empty() {
            return Err("empty domain pattern".to_string());
        }
        match self {
            DomainKind::Regex => Regex::new(value)
                .map(|_| ())
                .map_err(|e| format!("invalid regex: {}", e)),
            DomainKind::Keyword => {
                if value.chars().any(char::is_whitespace) {
                    return Err("keyword contains whitespace".to_string());
                }
                Ok(())
            }
            DomainKind::Exact | DomainKind::Suffix => {
                if value.len() > MAX_DOMAIN_LEN {
                    return Err(format!("domain longer than {} bytes", MAX_DOMAIN_LEN));
                }
                if let Some(c) = value
                    .chars()
                    .find(|c| c.is_whitespace() || matches!(c, '/' | '\\' | ',' | '@'))
                {
                    return Err(format!("domain contains invalid character {:?}", c));
                }
                if value.ends_with('.') || value.contains("..") {
                    return Err("domain has an empty label".to_string());
                }
                if *self == DomainKind::Exact && value.starts_with('.') {
                    return Err("domain has an empty label".to_string());
                }
                Ok(())
            }
        }
    }
}

/// Parse one domain-list line into a kind and canonical value.
///
/// Returns `None` for a line that is not a single pattern.
pub fn parse_domain_line(line: &str) -> Option<(DomainKind, String)> {
    let line = line.trim();
    if line.is_empty() || line.chars().any(char::is_whitespace) {
        return None;
    }
    let (kind, rest) = if let Some(rest) = line.strip_prefix("+.") {
        (DomainKind::Suffix, rest)
    } else if let Some(rest) = line.strip_prefix('.') {
        (DomainKind::Suffix, rest)
    } else {
        (DomainKind::Exact, line)
    };
    kind.parse_value(rest).map(|value| (kind, value))
}
