//! Merging and cleanup of parsed records into a [`RuleSet`].

use std::collections::{BTreeMap, BTreeSet};

use serde::Deserialize;

use crate::error::ValidationError;
use crate::rule::{CidrKind, RuleRecord};
use crate::ruleset::{NormalizeStats, RuleEntry, RuleSet};

/// Records parsed from one source, in source order.
#[derive(Debug, Clone)]
pub struct SourceRecords {
    pub url: String,
    pub records: Vec<RuleRecord>,
}

impl SourceRecords {
    pub fn new(url: impl Into<String>, records: Vec<RuleRecord>) -> Self {
        Self {
            url: url.into(),
            records,
        }
    }
}

/// Opt-in normalization policies. Both are off by default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct NormalizeOptions {
    /// Drop CIDR blocks contained in a broader block of the same kind
    pub collapse_subsumed_cidrs: bool,
    /// Drop records whose value contains one of these (case-insensitive)
    pub exclude_keywords: Vec<String>,
}

/// Merges the records of every source of one ruleset.
#[derive(Debug, Clone, Default)]
pub struct RuleNormalizer {
    options: NormalizeOptions,
    keywords: Vec<String>,
}

impl RuleNormalizer {
    pub fn new(options: NormalizeOptions) -> Self {
        let keywords = options
            .exclude_keywords
            .iter()
            .map(|k| k.trim().to_lowercase())
            .filter(|k| !k.is_empty())
            .collect();
        Self { options, keywords }
    }

    pub fn options(&self) -> &NormalizeOptions {
        &self.options
    }

    /// Build a finalized rule set.
    ///
    /// Excluded records are dropped before validation, so a bad record that
    /// is excluded anyway does not fail the ruleset.
    pub fn normalize(
        &self,
        name: &str,
        sources: Vec<SourceRecords>,
    ) -> Result<RuleSet, ValidationError> {
        let mut stats = NormalizeStats::default();
        let mut urls = Vec::with_capacity(sources.len());
        let mut merged: BTreeMap<RuleRecord, BTreeSet<usize>> = BTreeMap::new();

        for (idx, source) in sources.into_iter().enumerate() {
            urls.push(source.url);
            for record in source.records {
                stats.input += 1;
                if self.is_excluded(&record) {
                    stats.excluded += 1;
                    continue;
                }
                record.validate()?;
                let contributors = merged.entry(record).or_default();
                if !contributors.is_empty() {
                    stats.duplicates_removed += 1;
                }
                contributors.insert(idx);
            }
        }

        let mut entries: Vec<RuleEntry> = merged
            .into_iter()
            .map(|(record, sources)| RuleEntry {
                record,
                sources: sources.into_iter().collect(),
            })
            .collect();

        if self.options.collapse_subsumed_cidrs {
            let before = entries.len();
            entries = collapse_subsumed(entries);
            stats.subsumed_removed = before - entries.len();
        }

        stats.output = entries.len();
        log::debug!(
            "normalized {}: {} in, {} out ({} duplicate, {} subsumed, {} excluded)",
            name,
            stats.input,
            stats.output,
            stats.duplicates_removed,
            stats.subsumed_removed,
            stats.excluded
        );
        Ok(RuleSet::from_parts(name, urls, entries, stats))
    }

    fn is_excluded(&self, record: &RuleRecord) -> bool {
        if self.keywords.is_empty() {
            return false;
        }
        let text = record.text_value().to_lowercase();
        self.keywords.iter().any(|k| text.contains(k.as_str()))
    }
}

/// Remove CIDR entries covered by a broader entry of the same kind and family.
///
/// Entries arrive sorted by record, which orders CIDR blocks by kind, then
/// address, then prefix. Within one (kind, family) run a block is covered
/// exactly when it ends at or before the furthest end seen so far.
fn collapse_subsumed(entries: Vec<RuleEntry>) -> Vec<RuleEntry> {
    let mut kept: Vec<RuleEntry> = Vec::with_capacity(entries.len());
    let mut cover: Option<((CidrKind, bool), u128)> = None;

    for entry in entries {
        if let RuleRecord::Cidr { kind, block } = &entry.record {
            let group = (*kind, block.is_ipv4());
            let (start, end) = block.range();
            match cover {
                Some((g, cover_end)) if g == group && start <= cover_end => {
                    if end <= cover_end {
                        log::trace!("dropping subsumed {}", entry.record);
                        continue;
                    }
                    cover = Some((group, end));
                }
                _ => cover = Some((group, end)),
            }
        }
        kept.push(entry);
    }
    kept
}
