//! Rule source declarations and raw fetch results.

use std::fmt;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// Declared format of a rule source.
///
/// Parsing dispatches on this tag only; the fetched bytes are never sniffed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceFormat {
    /// One CIDR or bare IP per line
    #[serde(alias = "ip", alias = "ip-cidr", alias = "ipcidr")]
    Cidr,
    /// One domain pattern per line, `.`/`+.` prefix for suffix matches
    #[serde(alias = "domain", alias = "domains")]
    DomainList,
    /// sing-box style rule-set source document
    #[serde(alias = "sing-box")]
    Json,
    /// Clash classical rules, one `TYPE,value` per line
    #[serde(alias = "classical")]
    Clash,
    /// Clash rule provider YAML with a `payload` list
    #[serde(alias = "clash-yml")]
    ClashYaml,
}

impl SourceFormat {
    /// Parse a format name (case-insensitive).
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "cidr" | "ip" | "ip-cidr" | "ipcidr" => Some(SourceFormat::Cidr),
            "domain-list" | "domain" | "domains" => Some(SourceFormat::DomainList),
            "json" | "sing-box" => Some(SourceFormat::Json),
            "clash" | "classical" => Some(SourceFormat::Clash),
            "clash-yaml" | "clash-yml" => Some(SourceFormat::ClashYaml),
            _ => None,
        }
    }

    /// Get the canonical string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceFormat::Cidr => "cidr",
            SourceFormat::DomainList => "domain-list",
            SourceFormat::Json => "json",
            SourceFormat::Clash => "clash",
            SourceFormat::ClashYaml => "clash-yaml",
        }
    }

    /// Format for a plain `rulesets` URL entry.
    ///
    /// `.json` paths are rule-set documents, everything else is an IP list.
    pub fn for_ruleset_url(url: &str) -> Self {
        if url_path(url).to_lowercase().ends_with(".json") {
            SourceFormat::Json
        } else {
            SourceFormat::Cidr
        }
    }

    /// Format for a plain `convert` URL entry.
    pub fn for_convert_url(url: &str) -> Self {
        let path = url_path(url).to_lowercase();
        if path.ends_with(".yaml") || path.ends_with(".yml") {
            SourceFormat::ClashYaml
        } else {
            SourceFormat::Clash
        }
    }
}

impl fmt::Display for SourceFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// URL without query string or fragment.
fn url_path(url: &str) -> &str {
    url.split(['?', '#']).next().unwrap_or(url)
}

/// One feed contributing raw rule data to a ruleset.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RuleSource {
    url: String,
    format: SourceFormat,
}

impl RuleSource {
    /// Create a new RuleSource.
    pub fn new(url: impl Into<String>, format: SourceFormat) -> Self {
        Self {
            url: url.into(),
            format,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn format(&self) -> SourceFormat {
        self.format
    }
}

/// How the bytes of a [`RawFetchResult`] were obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStatus {
    /// Downloaded from the network.
    Fetched { http_status: u16, attempts: u32 },
    /// Served from the local cache, optionally after a 304 revalidation.
    Cached { revalidated: bool },
}

/// Raw bytes of one source, consumed by the parser.
#[derive(Debug, Clone)]
pub struct RawFetchResult {
    pub source: RuleSource,
    pub content: Vec<u8>,
    pub fetched_at: SystemTime,
    pub status: FetchStatus,
}

impl RawFetchResult {
    /// Build a result from bytes already in memory.
    pub fn from_bytes(source: RuleSource, content: impl Into<Vec<u8>>) -> Self {
        Self {
            source,
            content: content.into(),
            fetched_at: SystemTime::now(),
            status: FetchStatus::Fetched {
                http_status: 200,
                attempts: 1,
            },
        }
    }

    /// Number of network attempts, zero for cache hits.
    pub fn attempts(&self) -> u32 {
        match self.status {
            FetchStatus::Fetched { attempts, .. } => attempts,
            FetchStatus::Cached { revalidated } => u32::from(revalidated),
        }
    }

    pub fn from_cache(&self) -> bool {
        matches!(self.status, FetchStatus::Cached { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_parse() {
        assert_eq!(SourceFormat::parse("CIDR"), Some(SourceFormat::Cidr));
        assert_eq!(SourceFormat::parse("domain"), Some(SourceFormat::DomainList));
        assert_eq!(SourceFormat::parse("json"), Some(SourceFormat::Json));
        assert_eq!(SourceFormat::parse("classical"), Some(SourceFormat::Clash));
        assert_eq!(SourceFormat::parse("mrs"), None);
    }

    #[test]
    fn test_format_for_urls() {
        assert_eq!(
            SourceFormat::for_ruleset_url("https://example.com/geosite-cn.json"),
            SourceFormat::Json
        );
        assert_eq!(
            SourceFormat::for_ruleset_url("https://example.com/rules.JSON?ref=main"),
            SourceFormat::Json
        );
        assert_eq!(
            SourceFormat::for_ruleset_url("https://example.com/china_ip.txt"),
            SourceFormat::Cidr
        );
        assert_eq!(
            SourceFormat::for_convert_url("https://example.com/reject.yaml"),
            SourceFormat::ClashYaml
        );
        assert_eq!(
            SourceFormat::for_convert_url("https://example.com/reject.list"),
            SourceFormat::Clash
        );
    }

    #[test]
    fn test_format_deserialize_aliases() {
        let format: SourceFormat = serde_json::from_str("\"domain\"").unwrap();
        assert_eq!(format, SourceFormat::DomainList);
        let format: SourceFormat = serde_json::from_str("\"clash-yaml\"").unwrap();
        assert_eq!(format, SourceFormat::ClashYaml);
    }
}
