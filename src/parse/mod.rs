//! Parsing of fetched rule sources.
//!
//! Dispatch is on the declared [`SourceFormat`] of the source. Line-based
//! formats are parsed lazily; JSON and YAML documents are decoded up front
//! and then iterated.

mod clash;
mod json;
mod text;

use std::vec;

use crate::error::ParseError;
use crate::rule::RuleRecord;
use crate::source::{RawFetchResult, SourceFormat};

/// Outcome of parsing a single line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Line {
    /// Blank or comment line
    Blank,
    Record(RuleRecord),
    /// One line expanding into several records
    Many(Vec<RuleRecord>),
    Malformed,
}

/// Records of one source plus the lines that were skipped.
#[derive(Debug, Clone, Default)]
pub struct ParsedSource {
    pub records: Vec<RuleRecord>,
    pub malformed: Vec<ParseError>,
}

impl ParsedSource {
    pub fn malformed_count(&self) -> usize {
        self.malformed.len()
    }
}

/// Lazy iterator over the records of one source.
///
/// Malformed lines are yielded as [`ParseError::MalformedLine`] items and do
/// not stop iteration. Calling [`SourceParser::records`] again starts over.
pub struct Records<'a> {
    inner: RecordsInner<'a>,
}

enum RecordsInner<'a> {
    Lines {
        lines: std::iter::Enumerate<std::str::Lines<'a>>,
        parse_line: fn(&str) -> Line,
        pending: vec::IntoIter<RuleRecord>,
    },
    Buffered(vec::IntoIter<Result<RuleRecord, ParseError>>),
}

impl Iterator for Records<'_> {
    type Item = Result<RuleRecord, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.inner {
            RecordsInner::Buffered(items) => items.next(),
            RecordsInner::Lines {
                lines,
                parse_line,
                pending,
            } => loop {
                if let Some(record) = pending.next() {
                    return Some(Ok(record));
                }
                let (idx, line) = lines.next()?;
                match (*parse_line)(line) {
                    Line::Blank => continue,
                    Line::Record(record) => return Some(Ok(record)),
                    Line::Many(records) => *pending = records.into_iter(),
                    Line::Malformed => {
                        return Some(Err(ParseError::MalformedLine {
                            line_no: idx + 1,
                            content: line.trim().to_string(),
                        }))
                    }
                }
            },
        }
    }
}

/// Converts raw source bytes into rule records.
#[derive(Debug, Clone, Copy, Default)]
pub struct SourceParser;

impl SourceParser {
    pub fn new() -> Self {
        Self
    }

    /// Iterate over the records of `raw`.
    ///
    /// Fails up front when the content cannot be decoded as the declared
    /// format at all.
    pub fn records<'a>(&self, raw: &'a RawFetchResult) -> Result<Records<'a>, ParseError> {
        let format = raw.source.format();
        let text = std::str::from_utf8(&raw.content).map_err(|e| {
            ParseError::UnsupportedFormat {
                format,
                detail: format!("content is not UTF-8: {}", e),
            }
        })?;
        let text = text.trim_start_matches('\u{feff}');

        let inner = match format {
            SourceFormat::Cidr => lines(text, text::parse_cidr_line),
            SourceFormat::DomainList => lines(text, text::parse_domain_list_line),
            SourceFormat::Clash => lines(text, clash::parse_clash_line),
            SourceFormat::Json => RecordsInner::Buffered(json::parse_document(text)?.into_iter()),
            SourceFormat::ClashYaml => RecordsInner::Buffered(parse_yaml_payload(text)?.into_iter()),
        };
        Ok(Records { inner })
    }

    /// Parse every record of `raw`, collecting malformed lines.
    pub fn parse(&self, raw: &RawFetchResult) -> Result<ParsedSource, ParseError> {
        let mut parsed = ParsedSource::default();
        for item in self.records(raw)? {
            match item {
                Ok(record) => parsed.records.push(record),
                Err(e) => {
                    log::debug!("{}: skipping {}", raw.source.url(), e);
                    parsed.malformed.push(e);
                }
            }
        }
        if let Some(first) = parsed.malformed.first() {
            log::warn!(
                "{}: skipped {} malformed line(s), first: {}",
                raw.source.url(),
                parsed.malformed.len(),
                first
            );
        }
        Ok(parsed)
    }
}

fn lines(text: &str, parse_line: fn(&str) -> Line) -> RecordsInner<'_> {
    RecordsInner::Lines {
        lines: text.lines().enumerate(),
        parse_line,
        pending: Vec::new().into_iter(),
    }
}

/// Decode a Clash rule-provider document and parse its `payload` entries.
fn parse_yaml_payload(text: &str) -> Result<Vec<Result<RuleRecord, ParseError>>, ParseError> {
    let doc: clash::ProviderPayload =
        serde_yaml::from_str(text).map_err(|e| ParseError::UnsupportedFormat {
            format: SourceFormat::ClashYaml,
            detail: e.to_string(),
        })?;

    let mut out = Vec::new();
    for (idx, item) in doc.payload.iter().enumerate() {
        let malformed = |content: String| ParseError::MalformedLine {
            line_no: idx + 1,
            content,
        };
        let Some(line) = item.as_str() else {
            out.push(Err(malformed(format!("{:?}", item))));
            continue;
        };
        match clash::parse_clash_line(line) {
            Line::Blank => {}
            Line::Record(record) => out.push(Ok(record)),
            Line::Many(records) => out.extend(records.into_iter().map(Ok)),
            Line::Malformed => out.push(Err(malformed(line.trim().to_string()))),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::{CidrBlock, DomainKind};
    use crate::source::RuleSource;

    fn raw(format: SourceFormat, content: &str) -> RawFetchResult {
        RawFetchResult::from_bytes(RuleSource::new("https://example.com/src", format), content)
    }

    #[test]
    fn test_malformed_line_tolerance() {
        let content = "1.0.0.0/24\n2.0.0.0/24\n3.0.0.0/24\n4.0.0.0/24\nnot-a-cidr\n\
                       6.0.0.0/24\n7.0.0.0/24\n8.0.0.0/24\n9.0.0.0/24\n10.0.0.0/24\n";
        let parsed = SourceParser::new()
            .parse(&raw(SourceFormat::Cidr, content))
            .unwrap();
        assert_eq!(parsed.records.len(), 9);
        assert_eq!(parsed.malformed_count(), 1);
        assert_eq!(
            parsed.malformed[0],
            ParseError::MalformedLine {
                line_no: 5,
                content: "not-a-cidr".into()
            }
        );
    }

    #[test]
    fn test_cidr_comments_and_blank_lines() {
        let content = "# header\n\n1.1.1.0/24 # cloudflare\n8.8.8.8\n";
        let parsed = SourceParser::new()
            .parse(&raw(SourceFormat::Cidr, content))
            .unwrap();
        assert_eq!(
            parsed.records,
            vec![
                RuleRecord::cidr(CidrBlock::parse("1.1.1.0/24").unwrap()),
                RuleRecord::cidr(CidrBlock::parse("8.8.8.8/32").unwrap()),
            ]
        );
        assert!(parsed.malformed.is_empty());
    }

    #[test]
    fn test_records_is_lazy_and_restartable() {
        let source = raw(SourceFormat::DomainList, "a.com\n.b.com\nc.com\n");
        let parser = SourceParser::new();

        let first: Vec<_> = parser.records(&source).unwrap().take(1).collect();
        assert_eq!(first.len(), 1);

        let all: Vec<_> = parser.records(&source).unwrap().collect();
        assert_eq!(all.len(), 3);
        assert_eq!(
            all[1],
            Ok(RuleRecord::domain(DomainKind::Suffix, "b.com"))
        );
    }

    #[test]
    fn test_invalid_domains_are_malformed_lines() {
        let content = "google.com\nyoutube.com\nexample.com/path\nfacebook.com\n";
        let parsed = SourceParser::new()
            .parse(&raw(SourceFormat::DomainList, content))
            .unwrap();
        assert_eq!(parsed.records.len(), 3);
        assert_eq!(
            parsed.malformed,
            vec![ParseError::MalformedLine {
                line_no: 3,
                content: "example.com/path".into()
            }]
        );

        let clash = "DOMAIN,a..b\nDOMAIN-SUFFIX,example.com.\nDOMAIN,user@host\n";
        let parsed = SourceParser::new()
            .parse(&raw(SourceFormat::Clash, clash))
            .unwrap();
        assert_eq!(
            parsed.records,
            vec![RuleRecord::domain(DomainKind::Suffix, "example.com")]
        );
        assert_eq!(parsed.malformed_count(), 2);
    }

    #[test]
    fn test_non_utf8_is_unsupported() {
        let source = RawFetchResult::from_bytes(
            RuleSource::new("https://example.com/bin", SourceFormat::Cidr),
            vec![0xff, 0xfe, 0x00, 0x31],
        );
        assert!(matches!(
            SourceParser::new().parse(&source),
            Err(ParseError::UnsupportedFormat {
                format: SourceFormat::Cidr,
                ..
            })
        ));
    }

    #[test]
    fn test_clash_text() {
        let content = "# reject list\nDOMAIN-SUFFIX,ads.com\nGEOIP,LAN\nFOO,bar\n";
        let parsed = SourceParser::new()
            .parse(&raw(SourceFormat::Clash, content))
            .unwrap();
        assert_eq!(parsed.records.len(), 9);
        assert_eq!(parsed.malformed_count(), 1);
    }

    #[test]
    fn test_clash_yaml_payload() {
        let content = "payload:\n  - DOMAIN-SUFFIX,google.com\n  - IP-CIDR,1.1.1.0/24,no-resolve\n  - '+.example.org'\n  - 42\n";
        let parsed = SourceParser::new()
            .parse(&raw(SourceFormat::ClashYaml, content))
            .unwrap();
        assert_eq!(parsed.records.len(), 3);
        assert_eq!(parsed.malformed_count(), 1);

        let broken = raw(SourceFormat::ClashYaml, "payload: [unclosed");
        assert!(matches!(
            SourceParser::new().parse(&broken),
            Err(ParseError::UnsupportedFormat { .. })
        ));
    }

    #[test]
    fn test_json_dispatch() {
        let content = r#"{"version": 2, "rules": [{"ip_cidr": ["1.1.1.0/24", "8.8.8.0/24"]}]}"#;
        let parsed = SourceParser::new()
            .parse(&raw(SourceFormat::Json, content))
            .unwrap();
        assert_eq!(parsed.records.len(), 2);
    }
}
