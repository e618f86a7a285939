//! Line-oriented text formats: CIDR lists and domain lists.

use super::Line;
use crate::rule::{parse_domain_line, CidrBlock, RuleRecord};

/// Strip a trailing `#` comment and surrounding whitespace.
pub(crate) fn strip_comment(line: &str) -> &str {
    let line = match line.find('#') {
        Some(idx) => &line[..idx],
        None => line,
    };
    line.trim()
}

/// Parse one line of a CIDR list.
///
/// A bare address becomes a host route. The prefix range is not checked.
pub(crate) fn parse_cidr_line(line: &str) -> Line {
    let line = strip_comment(line);
    if line.is_empty() {
        return Line::Blank;
    }
    match CidrBlock::parse(line) {
        Some(block) => Line::Record(RuleRecord::cidr(block)),
        None => Line::Malformed,
    }
}

/// Parse one line of a domain list.
pub(crate) fn parse_domain_list_line(line: &str) -> Line {
    let line = strip_comment(line);
    if line.is_empty() {
        return Line::Blank;
    }
    match parse_domain_line(line) {
        Some((kind, value)) => Line::Record(RuleRecord::domain(kind, value)),
        None => Line::Malformed,
    }
}
