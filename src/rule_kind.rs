//! Rule kind definitions.

use std::fmt;

use serde::Serialize;

/// RuleKind names the sing-box rule field a record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    /// Exact domain match
    Domain,
    /// Domain suffix match
    DomainSuffix,
    /// Substring match on the domain
    DomainKeyword,
    /// Regular expression match on the domain
    DomainRegex,
    /// Destination IP CIDR range
    IpCidr,
    /// Source IP CIDR range
    SourceIpCidr,
    /// Any other typed rule field (process_name, port, ...)
    Field,
    /// Pass-through data the pipeline does not interpret
    Opaque,
}

impl RuleKind {
    /// Parse a typed rule field name (case-insensitive).
    ///
    /// Returns `None` for field names carried as generic [`RuleKind::Field`] records.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "domain" => Some(RuleKind::Domain),
            "domain_suffix" => Some(RuleKind::DomainSuffix),
            "domain_keyword" => Some(RuleKind::DomainKeyword),
            "domain_regex" => Some(RuleKind::DomainRegex),
            "ip_cidr" => Some(RuleKind::IpCidr),
            "source_ip_cidr" => Some(RuleKind::SourceIpCidr),
            _ => None,
        }
    }

    /// Get the canonical string representation (the sing-box field name).
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleKind::Domain => "domain",
            RuleKind::DomainSuffix => "domain_suffix",
            RuleKind::DomainKeyword => "domain_keyword",
            RuleKind::DomainRegex => "domain_regex",
            RuleKind::IpCidr => "ip_cidr",
            RuleKind::SourceIpCidr => "source_ip_cidr",
            RuleKind::Field => "field",
            RuleKind::Opaque => "opaque",
        }
    }

    /// Whether the kind is a CIDR range.
    pub fn is_cidr(&self) -> bool {
        matches!(self, RuleKind::IpCidr | RuleKind::SourceIpCidr)
    }
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
